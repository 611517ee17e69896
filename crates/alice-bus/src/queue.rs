//! Per-subscriber bounded outbound queue.
//!
//! When full, the oldest queued non-critical envelope is evicted to make room.
//! If only critical envelopes are queued, a non-critical arrival is the one dropped,
//! while a critical arrival may overcommit up to twice the capacity before the
//! oldest entry is evicted regardless of criticality.
//!
//! Single consumer: one transport writer or one local client drains each queue.

use crate::envelope::Envelope;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug)]
struct Queued {
    envelope: Arc<Envelope>,
    critical: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Queued>,
    closed: bool,
    dropped_total: u64,
}

/// Result of [`OutboundQueue::push`].
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; this envelope was dropped instead of delivered.
    Evicted(Arc<Envelope>),
    Closed,
}

#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, envelope: Arc<Envelope>, critical: bool) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.items.len() < self.capacity {
                state.items.push_back(Queued { envelope, critical });
                PushOutcome::Queued
            } else if let Some(pos) = state.items.iter().position(|q| !q.critical) {
                let evicted = state.items.remove(pos).map(|q| q.envelope);
                state.items.push_back(Queued { envelope, critical });
                state.dropped_total += 1;
                match evicted {
                    Some(evicted) => PushOutcome::Evicted(evicted),
                    None => PushOutcome::Queued,
                }
            } else if !critical {
                state.dropped_total += 1;
                PushOutcome::Evicted(envelope)
            } else if state.items.len() < self.capacity * 2 {
                state.items.push_back(Queued { envelope, critical });
                PushOutcome::Queued
            } else {
                let evicted = state.items.pop_front().map(|q| q.envelope);
                state.items.push_back(Queued { envelope, critical });
                state.dropped_total += 1;
                match evicted {
                    Some(evicted) => PushOutcome::Evicted(evicted),
                    None => PushOutcome::Queued,
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next envelope. Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Arc<Envelope>> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(queued) = state.items.pop_front() {
                    return Some(queued.envelope);
                }
                if state.closed {
                    return None;
                }
            }
            // notify_one stores a permit when nobody is waiting, so a push between
            // the check above and this await is not lost.
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<Arc<Envelope>> {
        self.state.lock().items.pop_front().map(|q| q.envelope)
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_total(&self) -> u64 {
        self.state.lock().dropped_total
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Stop accepting envelopes; already queued ones can still be drained.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    /// Close and discard anything not yet delivered. Returns how many were discarded.
    pub fn close_and_clear(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            state.closed = true;
            let n = state.items.len();
            state.items.clear();
            n
        };
        self.notify.notify_one();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(t: &str) -> Arc<Envelope> {
        Arc::new(Envelope::new(t))
    }

    fn drain(q: &OutboundQueue) -> Vec<String> {
        std::iter::from_fn(|| q.try_pop())
            .map(|e| e.msg_type.clone())
            .collect()
    }

    #[test]
    fn test_fifo_under_capacity() {
        let q = OutboundQueue::new(4);
        for t in ["a", "b", "c"] {
            assert!(matches!(q.push(env(t), false), PushOutcome::Queued));
        }
        assert_eq!(drain(&q), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_overflow_drops_oldest_non_critical() {
        let q = OutboundQueue::new(3);
        q.push(env("c1"), true);
        q.push(env("n1"), false);
        q.push(env("n2"), false);
        match q.push(env("n3"), false) {
            PushOutcome::Evicted(e) => assert_eq!(e.msg_type, "n1"),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(q.dropped_total(), 1);
        assert_eq!(drain(&q), vec!["c1", "n2", "n3"]);
    }

    #[test]
    fn test_all_critical_queue_drops_non_critical_arrival() {
        let q = OutboundQueue::new(2);
        q.push(env("c1"), true);
        q.push(env("c2"), true);
        match q.push(env("n1"), false) {
            PushOutcome::Evicted(e) => assert_eq!(e.msg_type, "n1"),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert!(matches!(q.push(env("c3"), true), PushOutcome::Queued));
        assert!(matches!(q.push(env("c4"), true), PushOutcome::Queued));
        match q.push(env("c5"), true) {
            PushOutcome::Evicted(e) => assert_eq!(e.msg_type, "c1"),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(drain(&q), vec!["c2", "c3", "c4", "c5"]);
    }

    #[test]
    fn test_close_and_clear_discards() {
        let q = OutboundQueue::new(4);
        q.push(env("a"), false);
        q.push(env("b"), false);
        assert_eq!(q.close_and_clear(), 2);
        assert!(matches!(q.push(env("c"), false), PushOutcome::Closed));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_then_drains_after_close() {
        let q = Arc::new(OutboundQueue::new(4));
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(e) = q.pop().await {
                    seen.push(e.msg_type.clone());
                }
                seen
            })
        };
        q.push(env("a"), false);
        q.push(env("b"), false);
        q.close();
        let seen = consumer.await.unwrap();
        assert_eq!(seen, vec!["a", "b"]);
    }
}

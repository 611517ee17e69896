//! Connection Registry: every attached client, its filters, queue and liveness.

use crate::error::{BusError, BusResult};
use crate::pattern::SubscriptionPattern;
use crate::queue::OutboundQueue;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Client id assigned at registration, e.g. `weather-skill-3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process participant (dispatcher, skill manager, tests). Never reaped.
    Local,
    WebSocket,
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    seq: u64,
    label: String,
    transport: TransportKind,
    subscriptions: RwLock<HashSet<SubscriptionPattern>>,
    queue: OutboundQueue,
    last_seen_ms: AtomicI64,
    connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Registration order, for deterministic iteration.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionPattern> {
        let mut patterns: Vec<_> = self.subscriptions.read().iter().cloned().collect();
        patterns.sort_by_key(|p| p.to_string());
        patterns
    }

    pub fn matches(&self, msg_type: &str) -> bool {
        self.subscriptions.read().iter().any(|p| p.matches(msg_type))
    }

    pub fn subscribed_exactly(&self, msg_type: &str) -> bool {
        self.subscriptions
            .read()
            .iter()
            .any(|p| p.is_exact_for(msg_type))
    }

    pub fn touch(&self, now_ms: i64) {
        self.last_seen_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    pub fn is_stale(&self, now_ms: i64, timeout_ms: i64) -> bool {
        self.transport != TransportKind::Local && now_ms - self.last_seen_ms() > timeout_ms
    }
}

/// Summary row for status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub label: String,
    pub transport: TransportKind,
    pub subscriptions: Vec<String>,
    pub queued: usize,
    pub dropped: u64,
    pub connected_at: DateTime<Utc>,
}

/// Owns every [`Connection`]. Subscribe/unsubscribe on one connection are serialized
/// by that connection's lock; fan-out readers only take the read side.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_seq: AtomicU64,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            next_seq: AtomicU64::new(1),
            queue_capacity,
        }
    }

    pub fn register(
        &self,
        label: &str,
        transport: TransportKind,
        initial_subscriptions: Vec<SubscriptionPattern>,
    ) -> Arc<Connection> {
        self.register_with(label, transport, initial_subscriptions, |_| {})
    }

    /// Like [`register`](Self::register), but `prime` runs on the new connection before
    /// it becomes visible to fan-out, so whatever it queues comes first.
    pub fn register_with(
        &self,
        label: &str,
        transport: TransportKind,
        initial_subscriptions: Vec<SubscriptionPattern>,
        prime: impl FnOnce(&Connection),
    ) -> Arc<Connection> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let label = sanitize_label(label);
        let id = ConnectionId(format!("{}-{}", label, seq));
        let now = Utc::now();
        let connection = Arc::new(Connection {
            id: id.clone(),
            seq,
            label,
            transport,
            subscriptions: RwLock::new(initial_subscriptions.into_iter().collect()),
            queue: OutboundQueue::new(self.queue_capacity),
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
            connected_at: now,
        });
        prime(&connection);
        self.connections.insert(id, Arc::clone(&connection));
        connection
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn require(&self, id: &ConnectionId) -> BusResult<Arc<Connection>> {
        self.get(id)
            .ok_or_else(|| BusError::UnknownConnection(id.to_string()))
    }

    /// Returns false when the pattern was already present.
    pub fn subscribe(&self, id: &ConnectionId, pattern: SubscriptionPattern) -> BusResult<bool> {
        let connection = self.require(id)?;
        let added = connection.subscriptions.write().insert(pattern);
        Ok(added)
    }

    /// Returns false when the pattern was not present.
    pub fn unsubscribe(&self, id: &ConnectionId, pattern: &SubscriptionPattern) -> BusResult<bool> {
        let connection = self.require(id)?;
        let removed = connection.subscriptions.write().remove(pattern);
        Ok(removed)
    }

    /// Remove the connection and discard anything still queued for it.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(id)?;
        connection.queue.close_and_clear();
        Some(connection)
    }

    /// Snapshot of all connections in registration order.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        let mut all: Vec<_> = self
            .connections
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect();
        all.sort_by_key(|c| c.seq);
        all
    }

    /// Live connections in no particular order. Shard read locks are held while the
    /// iterator is alive, so do not register or unregister from inside the loop.
    pub fn iter(&self) -> impl Iterator<Item = Arc<Connection>> + '_ {
        self.connections.iter().map(|c| Arc::clone(c.value()))
    }

    pub fn stale(&self, now_ms: i64, timeout_ms: i64) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|c| c.value().is_stale(now_ms, timeout_ms))
            .map(|c| c.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn info(&self) -> Vec<ConnectionInfo> {
        self.all()
            .into_iter()
            .map(|c| ConnectionInfo {
                id: c.id.clone(),
                label: c.label.clone(),
                transport: c.transport,
                subscriptions: c.subscriptions().iter().map(|p| p.to_string()).collect(),
                queued: c.queue.len(),
                dropped: c.queue.dropped_total(),
                connected_at: c.connected_at,
            })
            .collect()
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .take(48)
        .collect();
    if cleaned.is_empty() {
        "client".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(raw: &str) -> SubscriptionPattern {
        SubscriptionPattern::parse(raw).unwrap()
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let registry = ConnectionRegistry::new(8);
        let a = registry.register("weather skill", TransportKind::WebSocket, vec![]);
        let b = registry.register("weather skill", TransportKind::WebSocket, vec![]);
        assert_ne!(a.id(), b.id());
        assert!(a.id().as_str().starts_with("weather-skill-"));
        assert_eq!(registry.len(), 2);
        assert_eq!(sanitize_label("   "), "client");
    }

    #[test]
    fn test_subscribe_unsubscribe_mutate_filters() {
        let registry = ConnectionRegistry::new(8);
        let c = registry.register("gui", TransportKind::Local, vec![pattern("speak")]);
        assert!(c.matches("speak"));
        assert!(!c.matches("mycroft.audio.service.play"));

        assert!(registry.subscribe(c.id(), pattern("mycroft.audio.*")).unwrap());
        assert!(!registry.subscribe(c.id(), pattern("mycroft.audio.*")).unwrap());
        assert!(c.matches("mycroft.audio.service.play"));

        assert!(registry.unsubscribe(c.id(), &pattern("speak")).unwrap());
        assert!(!c.matches("speak"));
    }

    #[test]
    fn test_unknown_connection_rejected() {
        let registry = ConnectionRegistry::new(8);
        let missing = ConnectionId::from("ghost-1");
        assert!(matches!(
            registry.subscribe(&missing, pattern("*")),
            Err(BusError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_unregister_cancels_queued_deliveries() {
        let registry = ConnectionRegistry::new(8);
        let c = registry.register("skill", TransportKind::WebSocket, vec![pattern("*")]);
        c.queue()
            .push(Arc::new(crate::envelope::Envelope::new("speak")), false);
        let removed = registry.unregister(c.id()).unwrap();
        assert!(removed.queue().is_empty());
        assert!(removed.queue().is_closed());
        assert!(registry.get(c.id()).is_none());
        assert!(registry.unregister(c.id()).is_none());
    }

    #[test]
    fn test_stale_ignores_local_connections() {
        let registry = ConnectionRegistry::new(8);
        let local = registry.register("dispatcher", TransportKind::Local, vec![]);
        let remote = registry.register("skill", TransportKind::WebSocket, vec![]);
        let later = remote.last_seen_ms() + 120_000;
        let stale = registry.stale(later, 60_000);
        assert_eq!(stale, vec![remote.id().clone()]);
        assert!(!local.is_stale(later, 60_000));

        remote.touch(later);
        assert!(registry.stale(later, 60_000).is_empty());
    }
}

//! Bus Core: validates envelopes and fans them out to matching subscribers.
//!
//! Fan-out only ever pushes onto per-subscriber [`OutboundQueue`]s, so a slow
//! subscriber cannot hold up a publisher or any other subscriber. One publish call
//! enqueues to every recipient before returning, which gives per-publisher FIFO.
//!
//! [`OutboundQueue`]: crate::queue::OutboundQueue

use crate::client::BusClient;
use crate::config::BusConfig;
use crate::envelope::Envelope;
use crate::error::{BusError, BusResult};
use crate::messages;
use crate::pattern::{parse_patterns, SubscriptionPattern};
use crate::queue::PushOutcome;
use crate::registry::{Connection, ConnectionId, ConnectionInfo, ConnectionRegistry, TransportKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Closed,
    HeartbeatTimeout,
    Unregistered,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Closed => "closed",
            DisconnectReason::HeartbeatTimeout => "heartbeat_timeout",
            DisconnectReason::Unregistered => "unregistered",
            DisconnectReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acceptance for fan-out. Says nothing about whether anyone processed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub recipients: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub connections: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub accepting: bool,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

/// One process-wide broker instance. Construct with [`MessageBus::new`] and share as `Arc`.
#[derive(Debug)]
pub struct MessageBus {
    config: BusConfig,
    registry: ConnectionRegistry,
    critical: Vec<SubscriptionPattern>,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    counters: Counters,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> BusResult<Arc<Self>> {
        config.validate()?;
        let critical = config.critical_patterns()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            registry: ConnectionRegistry::new(config.queue_capacity),
            config,
            critical,
            accepting: AtomicBool::new(true),
            shutdown_tx,
            counters: Counters::default(),
        }))
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Register a new connection and announce it.
    pub fn attach(
        &self,
        label: &str,
        transport: TransportKind,
        initial_subscriptions: Vec<SubscriptionPattern>,
    ) -> BusResult<Arc<Connection>> {
        self.attach_inner(label, transport, initial_subscriptions, false)
    }

    /// Like [`attach`](Self::attach), but the connection's first queued envelope is a
    /// `message_bus.client.connected` addressed to itself, carrying its assigned id.
    pub fn attach_with_welcome(
        &self,
        label: &str,
        transport: TransportKind,
        initial_subscriptions: Vec<SubscriptionPattern>,
    ) -> BusResult<Arc<Connection>> {
        self.attach_inner(label, transport, initial_subscriptions, true)
    }

    #[instrument(skip(self, initial_subscriptions))]
    fn attach_inner(
        &self,
        label: &str,
        transport: TransportKind,
        initial_subscriptions: Vec<SubscriptionPattern>,
        welcome: bool,
    ) -> BusResult<Arc<Connection>> {
        if !self.is_accepting() {
            return Err(BusError::ShuttingDown);
        }
        let connection = self.registry.register_with(label, transport, initial_subscriptions, |c| {
            if welcome {
                let greeting = Envelope::new(messages::CLIENT_CONNECTED)
                    .with_source(messages::BROKER_SOURCE)
                    .with_destination(c.id().as_str())
                    .with_data(json!({ "client_id": c.id(), "label": c.label(), "reason": "connected" }));
                c.queue().push(Arc::new(greeting), true);
            }
        });
        info!(client_id = %connection.id(), label = %connection.label(), "client connected");
        let announce = Envelope::new(messages::CLIENT_CONNECTED)
            .with_source(messages::BROKER_SOURCE)
            .with_data(json!({
                "client_id": connection.id(),
                "label": connection.label(),
                "reason": "connected",
            }));
        self.fan_out(Arc::new(announce), Some(connection.id()), None);
        Ok(connection)
    }

    /// Attach an in-process participant.
    pub fn connect_local<I, S>(self: &Arc<Self>, label: &str, patterns: I) -> BusResult<BusClient>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = parse_patterns(patterns)?;
        let connection = self.attach(label, TransportKind::Local, patterns)?;
        Ok(BusClient::new(Arc::clone(self), connection))
    }

    /// Accept an envelope from `from` for fan-out. Control types are consumed here.
    #[instrument(skip(self, from, envelope), fields(client_id = %from, msg_type = %envelope.msg_type))]
    pub fn publish(&self, from: &ConnectionId, mut envelope: Envelope) -> BusResult<PublishAck> {
        if !self.is_accepting() {
            return Err(BusError::ShuttingDown);
        }
        let publisher = self.registry.require(from)?;
        envelope.validate()?;
        publisher.touch(Utc::now().timestamp_millis());

        match envelope.msg_type.as_str() {
            messages::SUBSCRIBE => {
                let pattern = pattern_field(&envelope)?;
                let added = self.registry.subscribe(from, pattern.clone())?;
                debug!(%pattern, added, "subscribe");
                return Ok(PublishAck { recipients: 0 });
            }
            messages::UNSUBSCRIBE => {
                let pattern = pattern_field(&envelope)?;
                let removed = self.registry.unsubscribe(from, &pattern)?;
                debug!(%pattern, removed, "unsubscribe");
                return Ok(PublishAck { recipients: 0 });
            }
            messages::PING => {
                let pong = envelope
                    .reply(messages::PONG, json!({}))
                    .with_source(messages::BROKER_SOURCE)
                    .with_destination(from.as_str());
                publisher.queue().push(Arc::new(pong), false);
                return Ok(PublishAck { recipients: 1 });
            }
            _ => {}
        }

        if envelope.context.source.is_none() {
            envelope.context.source = Some(from.to_string());
        }
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let recipients = self.fan_out(Arc::new(envelope), Some(from), None);
        trace!(recipients, "published");
        Ok(PublishAck { recipients })
    }

    /// Parse and publish one raw wire frame.
    pub fn publish_json(&self, from: &ConnectionId, raw: &str) -> BusResult<PublishAck> {
        if raw.len() > self.config.max_message_bytes {
            return Err(BusError::TooLarge {
                size: raw.len(),
                limit: self.config.max_message_bytes,
            });
        }
        let envelope = Envelope::from_json(raw)?;
        self.publish(from, envelope)
    }

    /// Transport entry point: publish, and on rejection queue a `message_bus.error`
    /// back to the publisher only.
    pub fn handle_inbound(&self, from: &ConnectionId, raw: &str) -> BusResult<PublishAck> {
        let result = self.publish_json(from, raw);
        if let Err(err) = &result {
            self.reject(from, err);
        }
        result
    }

    /// Queue an error envelope for `to`. Never fanned out.
    pub fn reject(&self, to: &ConnectionId, err: &BusError) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        if err.is_protocol() {
            warn!(client_id = %to, code = err.code(), error = %err, "envelope rejected");
        } else {
            debug!(client_id = %to, code = err.code(), error = %err, "envelope rejected");
        }
        let Some(connection) = self.registry.get(to) else {
            return;
        };
        let error = Envelope::new(messages::ERROR)
            .with_source(messages::BROKER_SOURCE)
            .with_destination(to.as_str())
            .with_data(json!({ "error": err.to_string(), "code": err.code() }))
            .critical();
        connection.queue().push(Arc::new(error), true);
    }

    pub fn subscribe(&self, id: &ConnectionId, pattern: &str) -> BusResult<bool> {
        let pattern = SubscriptionPattern::parse(pattern)?;
        self.registry.subscribe(id, pattern)
    }

    pub fn unsubscribe(&self, id: &ConnectionId, pattern: &str) -> BusResult<bool> {
        let pattern = SubscriptionPattern::parse(pattern)?;
        self.registry.unsubscribe(id, &pattern)
    }

    /// Refresh liveness without publishing anything.
    pub fn heartbeat(&self, id: &ConnectionId) -> BusResult<()> {
        self.registry.require(id)?.touch(Utc::now().timestamp_millis());
        Ok(())
    }

    /// Remove a connection, discard its pending deliveries and broadcast the disconnect.
    /// Returns false if it was already gone.
    #[instrument(skip(self))]
    pub fn unregister(&self, id: &ConnectionId, reason: DisconnectReason) -> bool {
        let Some(connection) = self.registry.unregister(id) else {
            return false;
        };
        info!(client_id = %id, label = %connection.label(), %reason, "client disconnected");
        let notice = Envelope::new(messages::CLIENT_DISCONNECTED)
            .with_source(messages::BROKER_SOURCE)
            .with_data(json!({
                "client_id": id,
                "label": connection.label(),
                "reason": reason.as_str(),
            }));
        self.fan_out(Arc::new(notice), None, None);
        true
    }

    /// Unregister every non-local connection silent for longer than the heartbeat timeout.
    pub fn reap_stale(&self, now: DateTime<Utc>) -> Vec<ConnectionId> {
        let timeout_ms = (self.config.heartbeat_timeout_secs * 1000) as i64;
        let stale = self.registry.stale(now.timestamp_millis(), timeout_ms);
        for id in &stale {
            warn!(client_id = %id, timeout_secs = self.config.heartbeat_timeout_secs, "heartbeat timeout");
            self.unregister(id, DisconnectReason::HeartbeatTimeout);
        }
        stale
    }

    /// Periodic liveness sweep until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(bus.config.reap_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        bus.reap_stale(Utc::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("reaper stopped");
        })
    }

    /// Drain-and-stop: refuse new connections and publishes, close every queue so
    /// consumers finish what is already queued, then signal transports to wind down.
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        let connections = self.registry.all();
        info!(connections = connections.len(), "message bus draining");
        for connection in &connections {
            connection.queue().close();
        }
        self.shutdown_tx.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.info()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            connections: self.registry.len(),
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            accepting: self.is_accepting(),
        }
    }

    fn is_critical(&self, envelope: &Envelope) -> bool {
        envelope.is_critical() || self.critical.iter().any(|p| p.matches(&envelope.msg_type))
    }

    /// Push to every matching connection. The publisher is skipped unless it holds an
    /// exact subscription to the type. Returns how many queues accepted the envelope.
    ///
    /// `overflowed` marks an overflow diagnostic about that connection: it is not
    /// delivered there, and drops it causes elsewhere are not reported again.
    fn fan_out(
        &self,
        envelope: Arc<Envelope>,
        publisher: Option<&ConnectionId>,
        overflowed: Option<&ConnectionId>,
    ) -> usize {
        let critical = self.is_critical(&envelope);
        let msg_type = envelope.msg_type.as_str();
        let mut recipients = 0;
        let mut overflows = Vec::new();

        for connection in self.registry.iter() {
            if overflowed == Some(connection.id()) {
                continue;
            }
            if !connection.matches(msg_type) || !envelope.is_addressed_to(connection.id().as_str()) {
                continue;
            }
            if publisher == Some(connection.id()) && !connection.subscribed_exactly(msg_type) {
                continue;
            }
            match connection.queue().push(Arc::clone(&envelope), critical) {
                PushOutcome::Queued => recipients += 1,
                PushOutcome::Evicted(dropped) => {
                    if !Arc::ptr_eq(&dropped, &envelope) {
                        recipients += 1;
                    }
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    overflows.push((connection, dropped));
                }
                PushOutcome::Closed => {}
            }
        }
        self.counters
            .delivered
            .fetch_add(recipients as u64, Ordering::Relaxed);

        for (connection, dropped) in overflows {
            let dropped_total = connection.queue().dropped_total();
            warn!(
                client_id = %connection.id(),
                dropped_type = %dropped.msg_type,
                dropped_total,
                "outbound queue overflow"
            );
            if overflowed.is_none() {
                let diagnostic = Envelope::new(messages::QUEUE_OVERFLOW)
                    .with_source(messages::BROKER_SOURCE)
                    .with_data(json!({
                        "client_id": connection.id(),
                        "dropped_type": dropped.msg_type,
                        "dropped_total": dropped_total,
                    }));
                self.fan_out(Arc::new(diagnostic), None, Some(connection.id()));
            }
        }
        recipients
    }
}

fn pattern_field(envelope: &Envelope) -> BusResult<SubscriptionPattern> {
    let raw = envelope
        .str_field("pattern")
        .ok_or_else(|| BusError::Malformed(format!("{} requires data.pattern", envelope.msg_type)))?;
    SubscriptionPattern::parse(raw)
}

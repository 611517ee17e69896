//! In-process bus participant.

use crate::broker::{DisconnectReason, MessageBus, PublishAck};
use crate::envelope::Envelope;
use crate::error::BusResult;
use crate::registry::{Connection, ConnectionId};
use std::sync::Arc;
use std::time::Duration;

/// Handle held by a local participant (dispatcher, skill manager, tests).
/// Dropping it unregisters the connection.
#[derive(Debug)]
pub struct BusClient {
    bus: Arc<MessageBus>,
    connection: Arc<Connection>,
}

impl BusClient {
    pub(crate) fn new(bus: Arc<MessageBus>, connection: Arc<Connection>) -> Self {
        Self { bus, connection }
    }

    pub fn id(&self) -> &ConnectionId {
        self.connection.id()
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn publish(&self, envelope: Envelope) -> BusResult<PublishAck> {
        self.bus.publish(self.connection.id(), envelope)
    }

    pub fn subscribe(&self, pattern: &str) -> BusResult<bool> {
        self.bus.subscribe(self.connection.id(), pattern)
    }

    pub fn unsubscribe(&self, pattern: &str) -> BusResult<bool> {
        self.bus.unsubscribe(self.connection.id(), pattern)
    }

    /// Next delivered envelope, or `None` once the connection is closed and drained.
    pub async fn recv(&self) -> Option<Envelope> {
        self.connection.queue().pop().await.map(Arc::unwrap_or_clone)
    }

    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.connection.queue().try_pop().map(Arc::unwrap_or_clone)
    }

    pub fn pending(&self) -> usize {
        self.connection.queue().len()
    }

    pub fn disconnect(self) {
        self.bus
            .unregister(self.connection.id(), DisconnectReason::Unregistered);
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        let reason = if self.bus.is_accepting() {
            DisconnectReason::Closed
        } else {
            DisconnectReason::Shutdown
        };
        self.bus.unregister(self.connection.id(), reason);
    }
}

//! Message types the broker consumes or emits itself.

/// Add a pattern to the publisher's filter set. Data: `{"pattern": string}`.
pub const SUBSCRIBE: &str = "message_bus.subscribe";
/// Remove a pattern from the publisher's filter set. Data: `{"pattern": string}`.
pub const UNSUBSCRIBE: &str = "message_bus.unsubscribe";
/// Liveness check; answered with [`PONG`] to the sender only.
pub const PING: &str = "ping";
pub const PONG: &str = "pong";
/// Synchronous rejection of a publish, delivered to the publisher only.
pub const ERROR: &str = "message_bus.error";

pub const CLIENT_CONNECTED: &str = "message_bus.client.connected";
pub const CLIENT_DISCONNECTED: &str = "message_bus.client.disconnected";
/// A subscriber's outbound queue overflowed and one message was dropped for it.
pub const QUEUE_OVERFLOW: &str = "message_bus.queue.overflow";

/// `context.source` stamped on envelopes the broker emits itself.
pub const BROKER_SOURCE: &str = "message_bus";

/// Envelope types consumed by the broker and never fanned out.
pub fn is_control(msg_type: &str) -> bool {
    matches!(msg_type, SUBSCRIBE | UNSUBSCRIBE | PING)
}

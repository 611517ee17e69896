//! WebSocket transport: one socket per client, text frames carry wire envelopes.
//!
//! Connect with `ws://host:port/core?name=<label>&subscribe=<pattern,pattern>`.
//! `subscribe` defaults to `*`. The first frame a client receives is
//! `message_bus.client.connected` addressed to itself, carrying its assigned id.

use crate::broker::{DisconnectReason, MessageBus};
use crate::error::BusError;
use crate::pattern::{parse_patterns, SubscriptionPattern};
use crate::registry::TransportKind;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub name: Option<String>,
    /// Comma-separated subscription patterns.
    pub subscribe: Option<String>,
}

impl ConnectParams {
    fn patterns(&self) -> Result<Vec<SubscriptionPattern>, BusError> {
        match self.subscribe.as_deref() {
            None => Ok(vec![SubscriptionPattern::All]),
            Some(raw) => parse_patterns(raw.split(',').filter(|p| !p.trim().is_empty())),
        }
    }
}

/// Router exposing the bus on the configured route.
pub fn router(bus: Arc<MessageBus>) -> Router {
    let route = bus.config().route.clone();
    Router::new()
        .route(&route, get(ws_handler))
        .with_state(bus)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(bus): State<Arc<MessageBus>>,
    Query(params): Query<ConnectParams>,
) -> Response {
    if !bus.is_accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, BusError::ShuttingDown.to_string()).into_response();
    }
    let patterns = match params.patterns() {
        Ok(patterns) => patterns,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let label = params.name.unwrap_or_else(|| "client".to_string());
    let limit = bus.config().max_message_bytes;
    ws.max_message_size(limit)
        .on_upgrade(move |socket| serve_socket(bus, socket, label, patterns))
}

/// Ping often enough that a responsive but otherwise silent client is never reaped.
fn keepalive_interval(heartbeat_timeout: Duration) -> Duration {
    (heartbeat_timeout / 3).max(Duration::from_millis(100))
}

enum Exit {
    PeerClosed,
    WriterDone,
    Shutdown,
}

/// Serve one upgraded socket until either side closes or the bus shuts down.
pub async fn serve_socket(
    bus: Arc<MessageBus>,
    socket: WebSocket,
    label: String,
    patterns: Vec<SubscriptionPattern>,
) {
    let connection = match bus.attach_with_welcome(&label, TransportKind::WebSocket, patterns) {
        Ok(connection) => connection,
        Err(e) => {
            warn!(label = %label, error = %e, "rejecting websocket client");
            return;
        }
    };
    let id = connection.id().clone();

    let (mut sender, mut receiver) = socket.split();

    let writer_conn = Arc::clone(&connection);
    let ping_every = keepalive_interval(bus.config().heartbeat_timeout());
    let mut writer = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                next = writer_conn.queue().pop() => {
                    let Some(envelope) = next else { break };
                    let text = match envelope.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(client_id = %writer_conn.id(), error = %e, "dropping unserializable envelope");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // Clients answer with a pong frame, which refreshes liveness.
                _ = keepalive.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut shutdown = bus.shutdown_signal();
    let exit = loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = bus.handle_inbound(&id, &text);
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        let _ = bus.handle_inbound(&id, &text);
                    }
                    Err(_) => bus.reject(&id, &BusError::Malformed("binary frame is not UTF-8".into())),
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    let _ = bus.heartbeat(&id);
                }
                Some(Ok(Message::Close(_))) | None => break Exit::PeerClosed,
                Some(Err(e)) => {
                    debug!(client_id = %id, error = %e, "websocket read error");
                    break Exit::PeerClosed;
                }
            },
            _ = &mut writer => break Exit::WriterDone,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Exit::Shutdown;
                }
            }
        }
    };

    match exit {
        Exit::Shutdown => {
            // Queue is already closed; let the writer flush what is left.
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
                warn!(client_id = %id, "drain timed out");
                writer.abort();
            }
            bus.unregister(&id, DisconnectReason::Shutdown);
        }
        Exit::PeerClosed => {
            bus.unregister(&id, DisconnectReason::Closed);
            writer.abort();
        }
        Exit::WriterDone => {
            let reason = if bus.is_accepting() {
                DisconnectReason::Closed
            } else {
                DisconnectReason::Shutdown
            };
            bus.unregister(&id, reason);
        }
    }
}

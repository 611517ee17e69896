//! Alice message bus: envelopes, connection registry, broker and WebSocket transport.
//!
//! Independent processes (speech capture, audio playback, skills, GUI clients) attach
//! to one [`MessageBus`] and exchange typed [`Envelope`]s. In-process participants use
//! [`BusClient`]; remote ones connect over [`ws::router`].

pub mod broker;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod messages;
pub mod pattern;
pub mod queue;
pub mod registry;
pub mod ws;

pub use broker::{BusStats, DisconnectReason, MessageBus, PublishAck};
pub use client::BusClient;
pub use config::BusConfig;
pub use envelope::{Envelope, MessageContext};
pub use error::{BusError, BusResult};
pub use pattern::SubscriptionPattern;
pub use registry::{ConnectionId, ConnectionInfo, TransportKind};

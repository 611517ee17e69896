//! Broker settings. Loaded by the host process as the `bus` section of its config.

use crate::error::{BusError, BusResult};
use crate::messages;
use crate::pattern::{parse_patterns, SubscriptionPattern};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    /// WebSocket upgrade path.
    pub route: String,
    /// Per-subscriber outbound queue bound.
    pub queue_capacity: usize,
    pub heartbeat_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub max_message_bytes: usize,
    /// Types (subscription pattern grammar) that are never dropped on overflow,
    /// in addition to envelopes flagged `context.critical`.
    pub critical_types: Vec<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8181,
            route: "/core".to_string(),
            queue_capacity: 256,
            heartbeat_timeout_secs: 60,
            reap_interval_secs: 10,
            max_message_bytes: 1024 * 1024,
            critical_types: vec![
                "mycroft.skill.handler.start".to_string(),
                "mycroft.skill.handler.complete".to_string(),
                "mycroft.skill.handler.failed".to_string(),
                "mycroft.skills.*".to_string(),
                messages::CLIENT_DISCONNECTED.to_string(),
            ],
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> BusResult<()> {
        if !self.route.starts_with('/') {
            return Err(BusError::Config(format!(
                "bus.route must start with '/': {:?}",
                self.route
            )));
        }
        if self.queue_capacity == 0 {
            return Err(BusError::Config("bus.queue_capacity must be > 0".into()));
        }
        if self.heartbeat_timeout_secs == 0 || self.reap_interval_secs == 0 {
            return Err(BusError::Config(
                "bus heartbeat and reap intervals must be > 0".into(),
            ));
        }
        if self.max_message_bytes == 0 {
            return Err(BusError::Config("bus.max_message_bytes must be > 0".into()));
        }
        self.critical_patterns()?;
        Ok(())
    }

    pub fn critical_patterns(&self) -> BusResult<Vec<SubscriptionPattern>> {
        parse_patterns(&self.critical_types)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

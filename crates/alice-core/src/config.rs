//! Layered configuration: defaults, then an optional file, then `ALICE__*` env vars.

use crate::error::ConfigError;
use crate::intent::ScoringWeights;
use alice_bus::BusConfig;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default config file stem; any extension the `config` crate understands is accepted.
pub const DEFAULT_CONFIG_PATH: &str = "config/alice";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AliceConfig {
    pub bus: BusConfig,
    pub dispatch: DispatchConfig,
    pub skills: SkillsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Minimum score for the top candidate to be routed without falling back.
    pub acceptance_threshold: f64,
    /// How long a skill has to complete an intent or converse invocation.
    pub handler_timeout_secs: u64,
    /// How long one fallback handler has to answer before the next is tried.
    pub fallback_timeout_secs: u64,
    /// Continuation window when a skill does not specify one.
    pub continuation_timeout_secs: u64,
    /// Idle sessions are forgotten after this long without activity.
    pub session_ttl_secs: u64,
    pub sweep_interval_ms: u64,
    pub scoring: ScoringWeights,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.5,
            handler_timeout_secs: 30,
            fallback_timeout_secs: 5,
            continuation_timeout_secs: 20,
            session_ttl_secs: 300,
            sweep_interval_ms: 500,
            scoring: ScoringWeights::default(),
        }
    }
}

impl DispatchConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::seconds(self.handler_timeout_secs as i64)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::seconds(self.fallback_timeout_secs as i64)
    }

    pub fn continuation_timeout(&self) -> Duration {
        Duration::seconds(self.continuation_timeout_secs as i64)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.session_ttl_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillsConfig {
    /// Reload requests issued for a failed skill before it is stopped.
    pub max_reload_attempts: u32,
    pub reload_backoff_secs: u64,
    pub check_interval_ms: u64,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            max_reload_attempts: 3,
            reload_backoff_secs: 5,
            check_interval_ms: 500,
        }
    }
}

impl SkillsConfig {
    pub fn reload_backoff(&self) -> Duration {
        Duration::seconds(self.reload_backoff_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is not set.
    pub level: String,
    /// When set, logs are also written to a daily rolling file here.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_prefix: "alice-messagebus.log".to_string(),
        }
    }
}

impl AliceConfig {
    /// Load from `ALICE_CONFIG` (default `config/alice`) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("ALICE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&config_path)
    }

    /// Load using `path` as the file source. A missing file is not an error.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let built = config::Config::builder()
            .set_default("bus.host", "127.0.0.1")?
            .set_default("bus.port", 8181_i64)?
            .set_default("log.level", "info")?
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("ALICE").separator("__"))
            .build()?;

        let loaded: AliceConfig = built.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let d = &self.dispatch;
        if !(0.0..=1.0).contains(&d.acceptance_threshold) {
            return Err(ConfigError::Invalid(format!(
                "dispatch.acceptance_threshold must be within [0, 1], got {}",
                d.acceptance_threshold
            )));
        }
        if d.handler_timeout_secs == 0
            || d.fallback_timeout_secs == 0
            || d.continuation_timeout_secs == 0
            || d.session_ttl_secs == 0
            || d.sweep_interval_ms == 0
        {
            return Err(ConfigError::Invalid(
                "dispatch timeouts and intervals must be > 0".into(),
            ));
        }
        d.scoring.validate().map_err(ConfigError::Invalid)?;

        if self.skills.check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "skills.check_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

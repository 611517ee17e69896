//! alice-core: intent index, session-aware dispatcher and skill activation state machine.
//!
//! Both actors run as ordinary bus participants: the [`Dispatcher`] owns sessions and
//! in-flight invocations, the [`SkillManager`] owns skill state and the [`IntentIndex`].
//! The dispatcher only reads what the skill manager writes.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod intent;
pub mod messages;
pub mod skills;

pub use config::{AliceConfig, DispatchConfig, LogConfig, SkillsConfig, DEFAULT_CONFIG_PATH};
pub use dispatch::{DispatchResult, Dispatcher, SessionManager, SessionState, SessionView};
pub use error::{ConfigError, CoreError, CoreResult, LifecycleError, RegistrationError};
pub use intent::{IntentDefinition, IntentIndex, MatchCandidate, ScoringWeights};
pub use skills::{SkillManager, SkillRecord, SkillRegistry, SkillState};

use alice_bus::{BusClient, BusError, Envelope};
use std::sync::Arc;
use tracing::warn;

/// Publish each envelope; false once the bus refuses work.
pub(crate) fn publish_all(client: &BusClient, outgoing: Vec<Envelope>) -> bool {
    for envelope in outgoing {
        match client.publish(envelope) {
            Ok(_) => {}
            Err(BusError::ShuttingDown) => return false,
            Err(e) => warn!(error = %e, "failed to publish"),
        }
    }
    true
}

/// Shared state for one dispatcher / skill manager pair.
pub struct Engine {
    pub intents: Arc<IntentIndex>,
    pub skills: Arc<SkillRegistry>,
}

impl Engine {
    pub fn new(config: &AliceConfig) -> Self {
        Self {
            intents: Arc::new(IntentIndex::new(config.dispatch.scoring)),
            skills: Arc::new(SkillRegistry::new()),
        }
    }

    pub fn dispatcher(&self, config: &AliceConfig) -> Dispatcher {
        Dispatcher::new(config.dispatch.clone(), Arc::clone(&self.intents), Arc::clone(&self.skills))
    }

    pub fn skill_manager(&self, config: &AliceConfig) -> SkillManager {
        SkillManager::new(config.skills.clone(), Arc::clone(&self.intents), Arc::clone(&self.skills))
    }
}

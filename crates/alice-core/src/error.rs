//! Error types for the dispatch and skill layers

use crate::skills::SkillState;
use alice_bus::BusError;
use thiserror::Error;

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// A skill's intent registration was refused. Prior registration stays in place.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("skill id must not be empty")]
    EmptySkillId,

    #[error("skill {skill_id} declared an intent without a name")]
    EmptyIntentName { skill_id: String },

    #[error("intent {intent} has invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        intent: String,
        pattern: String,
        reason: String,
    },

    #[error("malformed registration: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("unknown skill: {0}")]
    UnknownSkill(String),

    #[error("skill {skill_id} cannot move from {from} to {to}")]
    InvalidTransition {
        skill_id: String,
        from: SkillState,
        to: SkillState,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

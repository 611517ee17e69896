//! Error types for the message bus

use thiserror::Error;

/// Result type alias for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Errors raised at the bus boundary. None of them are forwarded to subscribers;
/// the publisher receives them synchronously as a `message_bus.error` envelope.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("envelope is missing a non-empty `type`")]
    MissingType,

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("envelope of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("invalid subscription pattern: {0:?}")]
    InvalidPattern(String),

    #[error("message bus is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Stable machine-readable code carried in `message_bus.error` payloads.
    pub fn code(&self) -> &'static str {
        match self {
            BusError::MissingType => "missing_type",
            BusError::Malformed(_) => "malformed",
            BusError::TooLarge { .. } => "too_large",
            BusError::UnknownConnection(_) => "unknown_connection",
            BusError::InvalidPattern(_) => "invalid_pattern",
            BusError::ShuttingDown => "shutting_down",
            BusError::Config(_) => "config",
            BusError::Serialization(_) => "serialization",
        }
    }

    /// Protocol errors are the publisher's fault; everything else is ours.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            BusError::MissingType
                | BusError::Malformed(_)
                | BusError::TooLarge { .. }
                | BusError::UnknownConnection(_)
                | BusError::InvalidPattern(_)
        )
    }
}

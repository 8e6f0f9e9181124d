//! # Pub/Sub Errors

use thiserror::Error;

use crate::store::StoreError;

/// Result type for broker operations
pub type PubSubResult<T> = Result<T, PubSubError>;

/// Broker errors
#[derive(Debug, Clone, Error)]
pub enum PubSubError {
    /// Empty or otherwise unusable channel name
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    /// Glob pattern that cannot be compiled
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Broker has been shut down
    #[error("Broker is shutting down")]
    ShuttingDown,

    /// The shared store failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl PubSubError {
    /// HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            PubSubError::InvalidChannel(_) | PubSubError::InvalidPattern(_) => 400,
            PubSubError::ShuttingDown => 503,
            PubSubError::Store(e) if e.is_transient() => 503,
            PubSubError::Store(_) => 500,
        }
    }
}

/// Failure reported by a subscription handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

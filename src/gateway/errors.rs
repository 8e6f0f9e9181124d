//! # Gateway Errors

use thiserror::Error;

use crate::pubsub::PubSubError;
use crate::store::StoreError;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway errors
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    // ==================
    // Connection Errors
    // ==================
    /// The client's stream is gone
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Unknown client id
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    // ==================
    // Request Errors
    // ==================
    /// Rejected by the rate limiter
    #[error("Rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Event that cannot be framed or routed
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    // ==================
    // Collaborator Errors
    // ==================
    /// Recipient resolution or notification persistence failed
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    // ==================
    // Internal Errors
    // ==================
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    PubSub(#[from] PubSubError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::ConnectionClosed(_) => 410,
            GatewayError::ConnectionNotFound(_) => 404,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::InvalidEvent(_) => 400,
            GatewayError::Collaborator(_) => 502,
            GatewayError::Store(e) if e.is_transient() => 503,
            GatewayError::PubSub(e) => e.status_code(),
            GatewayError::Store(_) | GatewayError::Internal(_) => 500,
        }
    }

    /// Seconds for a `Retry-After` header, rounded up
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_ms } => Some(retry_after_ms.div_ceil(1000).max(1)),
            _ => None,
        }
    }
}

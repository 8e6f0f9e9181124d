//! # Client Errors

use thiserror::Error;

use crate::gateway::GatewayError;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Client-side errors. `Clone` so one result can be handed to every caller
/// that shared an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The operation's cancellation signal fired first
    #[error("Operation cancelled")]
    Cancelled,

    /// A transport call failed; reconnecting may help
    #[error("Transport error: {0}")]
    Transport(String),

    /// Reconnecting stopped for good
    #[error("Gave up after {attempts} attempts: {last_error}")]
    Terminal { attempts: u32, last_error: String },

    /// The server asked us to slow down
    #[error("Throttled, retry after {retry_after_ms}ms")]
    Throttled { retry_after_ms: u64 },

    /// A response could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// The client has been shut down
    #[error("Client closed")]
    Closed,
}

impl ClientError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientError::Terminal { .. })
    }
}

impl From<GatewayError> for ClientError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::RateLimited { retry_after_ms } => ClientError::Throttled { retry_after_ms },
            other => ClientError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_throttling_stays_distinct() {
        let err: ClientError = GatewayError::RateLimited { retry_after_ms: 500 }.into();
        assert_eq!(err, ClientError::Throttled { retry_after_ms: 500 });

        let err: ClientError = GatewayError::ConnectionClosed("c".into()).into();
        assert!(matches!(err, ClientError::Transport(_)));
        assert!(!err.is_terminal());
    }
}

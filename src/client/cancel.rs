//! # Cancellation
//!
//! Every protected operation runs under a [`CancellationToken`]. Once the
//! token fires the operation resolves to [`ClientError::Cancelled`], even if
//! its own result became ready in the same instant.

use std::future::Future;

pub use tokio_util::sync::CancellationToken;

use super::errors::{ClientError, ClientResult};

/// Run `operation` unless `token` fires first
pub async fn cancellable<T, F>(token: &CancellationToken, operation: F) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    if token.is_cancelled() {
        return Err(ClientError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ClientError::Cancelled),
        result = operation => {
            if token.is_cancelled() {
                Err(ClientError::Cancelled)
            } else {
                result
            }
        }
    }
}

//! # Queue Errors
//!
//! Error codes follow the cloud queue API so existing consumers can branch on
//! `Code` in batch failures without translation.

use thiserror::Error;

use crate::store::StoreError;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue errors
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    // ==================
    // Request Errors
    // ==================
    /// A parameter is out of its allowed range
    #[error("Invalid parameter value: {0}")]
    InvalidParameterValue(String),

    /// A required parameter is missing or empty
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    /// Queue URL does not name a queue
    #[error("Invalid queue url: {0}")]
    InvalidQueueUrl(String),

    // ==================
    // Batch Errors
    // ==================
    /// Batch request without entries
    #[error("Batch request contains no entries")]
    EmptyBatchRequest,

    /// Batch request above the entry limit
    #[error("Batch request contains more than {0} entries")]
    TooManyEntriesInBatchRequest(usize),

    /// Two entries share an id
    #[error("Batch entry ids are not distinct: {0}")]
    BatchEntryIdsNotDistinct(String),

    // ==================
    // Store Errors
    // ==================
    /// The shared store failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl QueueError {
    /// Wire error code
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::InvalidParameterValue(_) => "InvalidParameterValue",
            QueueError::MissingParameter(_) => "MissingParameter",
            QueueError::InvalidQueueUrl(_) => "AWS.SimpleQueueService.NonExistentQueue",
            QueueError::EmptyBatchRequest => "AWS.SimpleQueueService.EmptyBatchRequest",
            QueueError::TooManyEntriesInBatchRequest(_) => {
                "AWS.SimpleQueueService.TooManyEntriesInBatchRequest"
            }
            QueueError::BatchEntryIdsNotDistinct(_) => {
                "AWS.SimpleQueueService.BatchEntryIdsNotDistinct"
            }
            QueueError::Store(e) if e.is_transient() => "ServiceUnavailable",
            QueueError::Store(_) => "InternalError",
        }
    }

    /// HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            QueueError::Store(e) if e.is_transient() => 503,
            QueueError::Store(_) => 500,
            _ => 400,
        }
    }
}

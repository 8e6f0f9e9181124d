//! # Queue
//!
//! Visibility-timeout message queue with the cloud queue API surface.
//!
//! ## Message lifecycle
//!
//! ```text
//! send(delay>0) ──► delayed ──(time)──► ready ◄── send(delay=0)
//!                                        │  ▲
//!                              receive   │  │ visibility expired (sweeper)
//!                                        ▼  │
//!                                     in-flight ──delete──► gone
//! ```
//!
//! Delivery is at-least-once: an unacknowledged message comes back after
//! its visibility timeout, with no manual retry API.

mod api;
mod errors;
mod message;
mod queue_store;
mod sweeper;

pub use api::{
    queue_name_from_url, BatchResultEntry, BatchResultErrorEntry, ChangeMessageVisibilityRequest,
    DeleteMessageRequest, Message, PurgeQueueRequest, QueueClient, ReceiveMessageRequest,
    SendMessageBatchRequest, SendMessageBatchRequestEntry, SendMessageBatchResponse,
    SendMessageRequest, SendMessageResponse,
};
pub use errors::{QueueError, QueueResult};
pub use message::{MessageAttributeValue, MessageAttributes, QueueStats, ReceivedMessage};
pub use queue_store::{
    BatchEntry, BatchOutcome, CleanupReport, QueueConfig, QueueStore, MAX_BATCH_ENTRIES,
    MAX_VISIBILITY_TIMEOUT_SECS,
};
pub use sweeper::spawn_sweeper;

//! # Pub/Sub Messages

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Delivery priority carried with a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A published message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubMessage {
    /// Message id
    pub id: String,
    /// Channel it was published on
    pub channel: String,
    /// Payload
    pub data: Value,
    /// Publish time (epoch ms)
    pub timestamp: i64,
    /// Priority
    #[serde(default)]
    pub priority: MessagePriority,
    /// Free-form headers
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Redeliveries so far to the current subscription
    #[serde(default)]
    pub retry_count: u32,
}

impl PubSubMessage {
    /// Create a message with a fresh id
    pub fn new(channel: &str, data: Value, options: &PublishOptions, now: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            data,
            timestamp: now,
            priority: options.priority,
            headers: options.headers.clone(),
            retry_count: 0,
        }
    }
}

/// Options for `publish`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublishOptions {
    pub priority: MessagePriority,
    /// Buffer this many messages per channel before emitting; 0 or 1 emits now
    pub batch_size: usize,
    /// Append to the channel history
    pub persist: bool,
    pub headers: HashMap<String, String>,
}

impl PublishOptions {
    pub fn persisted() -> Self {
        Self {
            persist: true,
            ..Default::default()
        }
    }

    pub fn batched(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Default::default()
        }
    }
}

/// One entry of `publish_batch`
#[derive(Debug, Clone)]
pub struct PublishEntry {
    pub channel: String,
    pub data: Value,
    pub options: PublishOptions,
}

/// What travels over the store channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub(crate) enum WirePayload {
    Single { message: PubSubMessage },
    Batch { messages: Vec<PubSubMessage> },
}

impl WirePayload {
    pub(crate) fn into_messages(self) -> Vec<PubSubMessage> {
        match self {
            WirePayload::Single { message } => vec![message],
            WirePayload::Batch { messages } => messages,
        }
    }
}

/// A message that exhausted its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub message: PubSubMessage,
    /// Last handler error
    pub error: String,
    pub subscription_id: String,
    /// Epoch ms
    pub failed_at: i64,
}

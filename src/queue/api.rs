//! # Queue API
//!
//! Wire-compatible request/response shapes of the cloud queue API, and the
//! [`QueueClient`] that resolves `QueueUrl` to a [`QueueStore`].
//!
//! Field names are PascalCase and must not change: existing producers and
//! consumers depend on them byte for byte.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::errors::{QueueError, QueueResult};
use super::message::{MessageAttributes, QueueStats, ReceivedMessage};
use super::queue_store::{
    BatchEntry, CleanupReport, QueueConfig, QueueStore, MAX_BATCH_ENTRIES,
    MAX_VISIBILITY_TIMEOUT_SECS,
};
use crate::clock::SharedClock;
use crate::store::SharedStore;

// ==================
// Requests
// ==================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendMessageRequest {
    pub queue_url: String,
    pub message_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_attributes: Option<MessageAttributes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendMessageBatchRequestEntry {
    pub id: String,
    pub message_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_attributes: Option<MessageAttributes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendMessageBatchRequest {
    pub queue_url: String,
    pub entries: Vec<SendMessageBatchRequestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReceiveMessageRequest {
    pub queue_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_number_of_messages: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteMessageRequest {
    pub queue_url: String,
    pub receipt_handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeMessageVisibilityRequest {
    pub queue_url: String,
    pub receipt_handle: String,
    pub visibility_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PurgeQueueRequest {
    pub queue_url: String,
}

// ==================
// Responses
// ==================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendMessageResponse {
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchResultEntry {
    pub id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchResultErrorEntry {
    pub id: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendMessageBatchResponse {
    pub successful: Vec<BatchResultEntry>,
    pub failed: Vec<BatchResultErrorEntry>,
}

/// A received message on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "MessageAttributes::is_empty")]
    pub message_attributes: MessageAttributes,
}

impl From<ReceivedMessage> for Message {
    fn from(m: ReceivedMessage) -> Self {
        Self {
            message_id: m.message_id,
            receipt_handle: m.receipt_handle,
            body: m.body,
            attributes: m.attributes,
            message_attributes: m.message_attributes,
        }
    }
}

/// Queue name from a queue URL: the last non-empty path segment
pub fn queue_name_from_url(queue_url: &str) -> QueueResult<String> {
    let name = queue_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let valid = !name.is_empty()
        && name.len() <= 80
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(name.to_string())
    } else {
        Err(QueueError::InvalidQueueUrl(queue_url.to_string()))
    }
}

fn visibility_timeout(secs: u64) -> QueueResult<Duration> {
    if secs > MAX_VISIBILITY_TIMEOUT_SECS {
        return Err(QueueError::InvalidParameterValue(format!(
            "VisibilityTimeout must be between 0 and {}",
            MAX_VISIBILITY_TIMEOUT_SECS
        )));
    }
    Ok(Duration::from_secs(secs))
}

/// Queue API entry point shared by every handler in the process
#[derive(Debug)]
pub struct QueueClient {
    store: SharedStore,
    clock: SharedClock,
    config: QueueConfig,
    queues: RwLock<HashMap<String, Arc<QueueStore>>>,
}

impl QueueClient {
    /// Create a client over the shared store
    pub fn new(store: SharedStore, clock: SharedClock, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the queue handle behind a URL
    pub fn queue(&self, queue_url: &str) -> QueueResult<Arc<QueueStore>> {
        let name = queue_name_from_url(queue_url)?;

        if let Some(queue) = self.queues.read().ok().and_then(|q| q.get(&name).cloned()) {
            return Ok(queue);
        }

        let mut queues = self
            .queues
            .write()
            .map_err(|_| crate::store::StoreError::Internal("Lock poisoned".into()))?;
        let queue = queues
            .entry(name.clone())
            .or_insert_with(|| {
                info!(queue = %name, "queue registered");
                Arc::new(QueueStore::new(
                    &name,
                    Arc::clone(&self.store),
                    Arc::clone(&self.clock),
                    self.config.clone(),
                ))
            })
            .clone();
        Ok(queue)
    }

    /// Queues this process has touched
    pub fn known_queues(&self) -> Vec<Arc<QueueStore>> {
        self.queues
            .read()
            .map(|q| q.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn send_message(&self, request: SendMessageRequest) -> QueueResult<SendMessageResponse> {
        let queue = self.queue(&request.queue_url)?;
        let message_id = queue
            .send_message(
                request.message_body,
                request.message_attributes.unwrap_or_default(),
                request.delay_seconds.unwrap_or(0),
            )
            .await?;
        Ok(SendMessageResponse { message_id })
    }

    pub async fn send_message_batch(
        &self,
        request: SendMessageBatchRequest,
    ) -> QueueResult<SendMessageBatchResponse> {
        let queue = self.queue(&request.queue_url)?;

        if request.entries.is_empty() {
            return Err(QueueError::EmptyBatchRequest);
        }
        if request.entries.len() > MAX_BATCH_ENTRIES {
            return Err(QueueError::TooManyEntriesInBatchRequest(MAX_BATCH_ENTRIES));
        }
        let mut seen = HashSet::new();
        for entry in &request.entries {
            if !seen.insert(entry.id.as_str()) {
                return Err(QueueError::BatchEntryIdsNotDistinct(entry.id.clone()));
            }
        }

        let entries = request
            .entries
            .into_iter()
            .map(|e| BatchEntry {
                id: e.id,
                body: e.message_body,
                delay_seconds: e.delay_seconds.unwrap_or(0),
                attributes: e.message_attributes.unwrap_or_default(),
            })
            .collect();

        let outcome = queue.send_message_batch(entries).await;
        Ok(SendMessageBatchResponse {
            successful: outcome
                .successful
                .into_iter()
                .map(|(id, message_id)| BatchResultEntry { id, message_id })
                .collect(),
            failed: outcome
                .failed
                .into_iter()
                .map(|(id, e)| BatchResultErrorEntry {
                    id,
                    code: e.code().to_string(),
                    message: e.to_string(),
                })
                .collect(),
        })
    }

    pub async fn receive_message(&self, request: ReceiveMessageRequest) -> QueueResult<Vec<Message>> {
        let queue = self.queue(&request.queue_url)?;
        let max = request.max_number_of_messages.unwrap_or(1);
        if max == 0 || max > MAX_BATCH_ENTRIES {
            return Err(QueueError::InvalidParameterValue(format!(
                "MaxNumberOfMessages must be between 1 and {}",
                MAX_BATCH_ENTRIES
            )));
        }
        let visibility = match request.visibility_timeout {
            Some(secs) => visibility_timeout(secs)?,
            None => self.config.default_visibility_timeout,
        };

        let messages = queue.receive_message(max, visibility).await?;
        Ok(messages.into_iter().map(Message::from).collect())
    }

    pub async fn delete_message(&self, request: DeleteMessageRequest) -> QueueResult<()> {
        let queue = self.queue(&request.queue_url)?;
        queue.delete_message(&request.receipt_handle).await?;
        Ok(())
    }

    pub async fn change_message_visibility(
        &self,
        request: ChangeMessageVisibilityRequest,
    ) -> QueueResult<bool> {
        let queue = self.queue(&request.queue_url)?;
        let visibility = visibility_timeout(request.visibility_timeout)?;
        queue
            .change_message_visibility(&request.receipt_handle, visibility)
            .await
    }

    pub async fn purge_queue(&self, request: PurgeQueueRequest) -> QueueResult<()> {
        let queue = self.queue(&request.queue_url)?;
        queue.purge().await?;
        info!(queue = %queue.name(), "queue purged");
        Ok(())
    }

    pub async fn get_queue_stats(&self, queue_url: &str) -> QueueResult<QueueStats> {
        self.queue(queue_url)?.get_queue_stats().await
    }

    /// Run one cleanup sweep over every known queue
    pub async fn cleanup_all(&self) -> QueueResult<CleanupReport> {
        let mut total = CleanupReport::default();
        for queue in self.known_queues() {
            let report = queue.cleanup_expired_messages().await?;
            total.promoted += report.promoted;
            total.redelivered += report.redelivered;
        }
        Ok(total)
    }
}

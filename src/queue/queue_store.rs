//! # Queue Store
//!
//! Visibility-timeout queue over the shared store.
//!
//! ## Layout
//!
//! - `queue:<name>:delayed`  sorted set, score = visible-at
//! - `queue:<name>:ready`    list, FIFO
//! - `queue:<name>:inflight` sorted set, score = visibility expiry
//!
//! ## Invariants
//!
//! - A ready message is handed to at most one receiver: the store's atomic
//!   multi-pop is the only exclusion mechanism.
//! - Moves out of a sorted set are claimed with `zrem`; only the caller whose
//!   `zrem` returned true pushes the message onward, so concurrent sweepers
//!   never duplicate a message.
//! - A received message that is never deleted returns to ready once its
//!   visibility window passes and the sweep runs (at-least-once).
//!
//! `delete_message` scans the in-flight set for the receipt handle. This is
//! linear in the number of in-flight messages and has no secondary index.

use std::time::Duration;

use tracing::{debug, error, warn};
use uuid::Uuid;

use super::errors::{QueueError, QueueResult};
use super::message::{
    Envelope, InFlightEntry, MessageAttributes, QueueMessage, QueueStats, ReceivedMessage,
};
use crate::clock::{millis, SharedClock};
use crate::store::SharedStore;

/// Largest batch accepted by receive and batch send
pub const MAX_BATCH_ENTRIES: usize = 10;

/// Longest accepted `VisibilityTimeout` (12 hours)
pub const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 43_200;

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Visibility timeout when the receiver does not pass one
    pub default_visibility_timeout: Duration,
    /// Largest accepted `DelaySeconds`
    pub max_delay_seconds: u32,
    /// Largest accepted body
    pub max_body_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_visibility_timeout: Duration::from_secs(30),
            max_delay_seconds: 900,
            max_body_bytes: 256 * 1024,
        }
    }
}

/// One entry of a batch send
#[derive(Debug, Clone)]
pub struct BatchEntry {
    /// Caller-chosen entry id, unique within the batch
    pub id: String,
    /// Body
    pub body: String,
    /// Delay
    pub delay_seconds: u32,
    /// User attributes
    pub attributes: MessageAttributes,
}

/// Per-entry outcome of a batch send
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// `(entry id, message id)` for accepted entries
    pub successful: Vec<(String, String)>,
    /// `(entry id, error)` for rejected entries
    pub failed: Vec<(String, QueueError)>,
}

/// Result of one cleanup sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    /// Delayed messages moved to ready
    pub promoted: usize,
    /// Expired in-flight messages moved back to ready
    pub redelivered: usize,
}

/// A named visibility-timeout queue
#[derive(Debug)]
pub struct QueueStore {
    name: String,
    store: SharedStore,
    clock: SharedClock,
    config: QueueConfig,
    ready_key: String,
    delayed_key: String,
    inflight_key: String,
}

impl QueueStore {
    /// Create a queue handle; the queue itself exists implicitly in the store
    pub fn new(name: &str, store: SharedStore, clock: SharedClock, config: QueueConfig) -> Self {
        Self {
            name: name.to_string(),
            store,
            clock,
            config,
            ready_key: format!("queue:{}:ready", name),
            delayed_key: format!("queue:{}:delayed", name),
            inflight_key: format!("queue:{}:inflight", name),
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn validate(&self, body: &str, delay_seconds: u32) -> QueueResult<()> {
        if body.is_empty() {
            return Err(QueueError::MissingParameter("MessageBody".into()));
        }
        if body.len() > self.config.max_body_bytes {
            return Err(QueueError::InvalidParameterValue(format!(
                "MessageBody exceeds {} bytes",
                self.config.max_body_bytes
            )));
        }
        if delay_seconds > self.config.max_delay_seconds {
            return Err(QueueError::InvalidParameterValue(format!(
                "DelaySeconds must be between 0 and {}",
                self.config.max_delay_seconds
            )));
        }
        Ok(())
    }

    /// Enqueue a message, returning its id
    pub async fn send_message(
        &self,
        body: String,
        attributes: MessageAttributes,
        delay_seconds: u32,
    ) -> QueueResult<String> {
        self.validate(&body, delay_seconds)?;

        let now = self.clock.now_millis();
        let message = QueueMessage::new(body, attributes, delay_seconds, now);
        let id = message.id.clone();
        let member = serde_json::to_string(&Envelope::new(message))
            .map_err(crate::store::StoreError::from)?;

        if delay_seconds > 0 {
            let visible_at = now + i64::from(delay_seconds) * 1000;
            self.store.zadd(&self.delayed_key, member, visible_at).await?;
        } else {
            self.store.rpush(&self.ready_key, vec![member]).await?;
        }

        debug!(queue = %self.name, message_id = %id, delay_seconds, "message enqueued");
        Ok(id)
    }

    /// Enqueue several messages; each entry succeeds or fails on its own
    pub async fn send_message_batch(&self, entries: Vec<BatchEntry>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for entry in entries {
            match self
                .send_message(entry.body, entry.attributes, entry.delay_seconds)
                .await
            {
                Ok(message_id) => outcome.successful.push((entry.id, message_id)),
                Err(e) => {
                    warn!(queue = %self.name, entry_id = %entry.id, error = %e, "batch entry rejected");
                    outcome.failed.push((entry.id, e));
                }
            }
        }
        outcome
    }

    /// Move every delayed message whose time has come to the ready list
    pub async fn promote_delayed(&self) -> QueueResult<usize> {
        let now = self.clock.now_millis();
        let due = self
            .store
            .zrange_by_score(&self.delayed_key, i64::MIN, now)
            .await?;

        let mut promoted = 0;
        for (member, visible_at) in due {
            if !self.store.zrem(&self.delayed_key, &member).await? {
                continue;
            }
            if let Err(e) = self.store.rpush(&self.ready_key, vec![member.clone()]).await {
                self.restore_claimed(&self.delayed_key, member, visible_at, "promote")
                    .await;
                return Err(e.into());
            }
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Receive up to `max_messages` messages, hiding them for `visibility_timeout`
    pub async fn receive_message(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> QueueResult<Vec<ReceivedMessage>> {
        self.promote_delayed().await?;

        let count = max_messages.clamp(1, MAX_BATCH_ENTRIES);
        let popped = self.store.lpop(&self.ready_key, count).await?;

        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(millis(visibility_timeout));
        let mut received = Vec::with_capacity(popped.len());

        for (index, raw) in popped.iter().enumerate() {
            let mut envelope: Envelope = match serde_json::from_str(raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // Dropped, not dead-lettered: the raw entry is already off the list
                    warn!(queue = %self.name, error = %e, "dropping malformed queue entry");
                    continue;
                }
            };
            envelope.receive_count += 1;
            envelope.first_received_at.get_or_insert(now);

            let entry = InFlightEntry {
                receipt_handle: Uuid::new_v4().to_string(),
                envelope,
            };
            let member = serde_json::to_string(&entry).map_err(crate::store::StoreError::from)?;

            if let Err(e) = self.store.zadd(&self.inflight_key, member, expires_at).await {
                // Put back what this call popped but could not track
                let rest: Vec<String> = popped[index..].to_vec();
                let ids = message_ids(&rest);
                if let Err(put_back) = self
                    .store
                    .lpush(&self.ready_key, rest.into_iter().rev().collect())
                    .await
                {
                    error!(
                        queue = %self.name,
                        message_ids = ?ids,
                        error = %put_back,
                        "popped messages could not be returned to ready"
                    );
                }
                return Err(e.into());
            }
            received.push(ReceivedMessage::from_entry(&entry));
        }

        if !received.is_empty() {
            debug!(queue = %self.name, count = received.len(), "messages received");
        }
        Ok(received)
    }

    /// Find the in-flight member carrying `receipt_handle`
    async fn find_in_flight(&self, receipt_handle: &str) -> QueueResult<Option<(String, InFlightEntry)>> {
        let members = self.store.zrange(&self.inflight_key, 0, -1).await?;
        Ok(members.into_iter().find_map(|(member, _)| {
            serde_json::from_str::<InFlightEntry>(&member)
                .ok()
                .filter(|entry| entry.receipt_handle == receipt_handle)
                .map(|entry| (member, entry))
        }))
    }

    /// Return a member claimed with `zrem` to the set it came from after the
    /// onward push failed, so the next sweep retries the move
    async fn restore_claimed(&self, key: &str, member: String, score: i64, step: &'static str) {
        let ids = message_ids(std::slice::from_ref(&member));
        if let Err(e) = self.store.zadd(key, member, score).await {
            error!(
                queue = %self.name,
                step,
                message_ids = ?ids,
                error = %e,
                "claimed message lost: onward push and restore both failed"
            );
        } else {
            warn!(queue = %self.name, step, message_ids = ?ids, "onward push failed, message restored");
        }
    }

    /// Acknowledge a message. Unknown or stale handles are a no-op returning false.
    pub async fn delete_message(&self, receipt_handle: &str) -> QueueResult<bool> {
        match self.find_in_flight(receipt_handle).await? {
            Some((member, entry)) => {
                let removed = self.store.zrem(&self.inflight_key, &member).await?;
                if removed {
                    debug!(queue = %self.name, message_id = %entry.envelope.message.id, "message deleted");
                }
                Ok(removed)
            }
            None => Ok(false),
        }
    }

    /// Reset the visibility window of an in-flight message to `now + timeout`
    pub async fn change_message_visibility(
        &self,
        receipt_handle: &str,
        visibility_timeout: Duration,
    ) -> QueueResult<bool> {
        let Some((member, _)) = self.find_in_flight(receipt_handle).await? else {
            return Ok(false);
        };

        let expires_at = self
            .clock
            .now_millis()
            .saturating_add(millis(visibility_timeout));
        // Only rescore if the sweeper has not already claimed it
        if self.store.zrem(&self.inflight_key, &member).await? {
            self.store.zadd(&self.inflight_key, member, expires_at).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Return expired in-flight messages to ready and promote due delayed ones
    pub async fn cleanup_expired_messages(&self) -> QueueResult<CleanupReport> {
        let promoted = self.promote_delayed().await?;

        let now = self.clock.now_millis();
        let expired = self
            .store
            .zrange_by_score(&self.inflight_key, i64::MIN, now)
            .await?;

        let mut redelivered = 0;
        for (member, expired_at) in expired {
            if !self.store.zrem(&self.inflight_key, &member).await? {
                continue;
            }
            match serde_json::from_str::<InFlightEntry>(&member) {
                Ok(entry) => {
                    let envelope = serde_json::to_string(&entry.envelope)
                        .map_err(crate::store::StoreError::from)?;
                    if let Err(e) = self.store.rpush(&self.ready_key, vec![envelope]).await {
                        self.restore_claimed(&self.inflight_key, member, expired_at, "redeliver")
                            .await;
                        return Err(e.into());
                    }
                    redelivered += 1;
                }
                Err(e) => {
                    warn!(queue = %self.name, error = %e, "dropping malformed in-flight entry");
                }
            }
        }

        if redelivered > 0 {
            warn!(queue = %self.name, redelivered, "visibility timeout expired, messages redelivered");
        }
        Ok(CleanupReport {
            promoted,
            redelivered,
        })
    }

    /// Message counts per state
    pub async fn get_queue_stats(&self) -> QueueResult<QueueStats> {
        Ok(QueueStats {
            ready: self.store.llen(&self.ready_key).await?,
            in_flight: self.store.zcard(&self.inflight_key).await?,
            delayed: self.store.zcard(&self.delayed_key).await?,
        })
    }

    /// Drop every message in every state
    pub async fn purge(&self) -> QueueResult<()> {
        self.store.del(&self.ready_key).await?;
        self.store.del(&self.delayed_key).await?;
        self.store.del(&self.inflight_key).await?;
        Ok(())
    }
}

/// Best-effort message ids of raw ready or in-flight members, for logging
fn message_ids(members: &[String]) -> Vec<String> {
    members
        .iter()
        .filter_map(|raw| serde_json::from_str::<Envelope>(raw).ok())
        .map(|envelope| envelope.message.id)
        .collect()
}

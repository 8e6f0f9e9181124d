//! # Subscriptions
//!
//! Each subscription owns an unbounded queue and one worker task. The
//! listener pushes matching messages onto the queue in publish order and
//! the worker runs the handler one message at a time, so a subscription sees
//! messages in publish order even while a failed message is being retried.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

use super::analytics::Analytics;
use super::errors::HandlerError;
use super::message::{DeadLetter, PubSubMessage};
use super::pattern::ChannelMatcher;
use crate::clock::SharedClock;
use crate::store::SharedStore;

/// Boxed handler future
pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// Message handler
pub type MessageHandler = Arc<dyn Fn(PubSubMessage) -> HandlerFuture + Send + Sync>;

/// Called once a message has failed for good
pub type ErrorHandler = Arc<dyn Fn(&HandlerError, &PubSubMessage) + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(PubSubMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Store key of a dead-letter list
pub fn dead_letter_key(queue: &str) -> String {
    format!("pubsub:dlq:{}", queue)
}

/// Options for `subscribe`
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Treat the channel as a glob
    pub pattern: bool,
    /// Redeliveries after the first failure; `None` uses the broker default
    pub max_retries: Option<u32>,
    /// Dead-letter list for messages that exhaust their retries
    pub dead_letter_queue: Option<String>,
    /// Messages drained from the queue per worker wake-up
    pub batch_size: usize,
}

impl SubscribeOptions {
    pub fn pattern() -> Self {
        Self {
            pattern: true,
            ..Default::default()
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_dead_letter_queue(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }
}

/// Delivery counters of one subscription, written only by its worker
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    received: AtomicU64,
    errors: AtomicU64,
    last_message_at: AtomicI64,
}

impl SubscriptionStats {
    pub fn snapshot(&self) -> SubscriptionStatsSnapshot {
        let last = self.last_message_at.load(Ordering::Relaxed);
        SubscriptionStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_message_at: (last > 0).then_some(last),
        }
    }
}

/// Point-in-time copy of [`SubscriptionStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatsSnapshot {
    pub received: u64,
    pub errors: u64,
    pub last_message_at: Option<i64>,
}

/// Public description of a subscription
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: String,
    pub channel: String,
    pub is_pattern: bool,
    pub max_retries: u32,
    pub dead_letter_queue: Option<String>,
    pub stats: SubscriptionStatsSnapshot,
}

/// Resolved retry behavior
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub dead_letter_queue: Option<String>,
}

impl RetryPolicy {
    /// Delay before redelivery number `retry + 1`
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Services a worker needs from the broker
#[derive(Debug, Clone)]
pub(crate) struct DeliveryContext {
    pub store: SharedStore,
    pub clock: SharedClock,
    pub analytics: Arc<Analytics>,
}

/// A live subscription as held by the broker
pub(crate) struct Subscription {
    pub id: String,
    pub matcher: ChannelMatcher,
    pub retry: RetryPolicy,
    pub stats: Arc<SubscriptionStats>,
    pub active: Arc<AtomicBool>,
    pub sender: mpsc::UnboundedSender<PubSubMessage>,
}

impl Subscription {
    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            channel: self.matcher.source().to_string(),
            is_pattern: self.matcher.is_pattern(),
            max_retries: self.retry.max_retries,
            dead_letter_queue: self.retry.dead_letter_queue.clone(),
            stats: self.stats.snapshot(),
        }
    }
}

/// Everything the worker task owns
pub(crate) struct Worker {
    pub subscription_id: String,
    pub receiver: mpsc::UnboundedReceiver<PubSubMessage>,
    pub handler: MessageHandler,
    pub error_handler: Option<ErrorHandler>,
    pub retry: RetryPolicy,
    pub batch_size: usize,
    pub stats: Arc<SubscriptionStats>,
    pub active: Arc<AtomicBool>,
    pub context: DeliveryContext,
}

impl Worker {
    /// Run until the subscription is dropped
    pub async fn run(mut self) {
        let batch_size = self.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);

        while let Some(first) = self.receiver.recv().await {
            batch.push(first);
            while batch.len() < batch_size {
                match self.receiver.try_recv() {
                    Ok(next) => batch.push(next),
                    Err(_) => break,
                }
            }

            for message in batch.drain(..) {
                if !self.active.load(Ordering::Acquire) {
                    return;
                }
                self.deliver(message).await;
            }
        }
    }

    async fn invoke(&self, message: PubSubMessage) -> Result<(), HandlerError> {
        match AssertUnwindSafe((self.handler)(message)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::new("handler panicked")),
        }
    }

    async fn deliver(&self, mut message: PubSubMessage) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        loop {
            self.stats
                .last_message_at
                .store(self.context.clock.now_millis(), Ordering::Relaxed);

            let error = match self.invoke(message.clone()).await {
                Ok(()) => {
                    self.context.analytics.record_delivered();
                    return;
                }
                Err(e) => e,
            };
            self.stats.errors.fetch_add(1, Ordering::Relaxed);

            if message.retry_count < self.retry.max_retries {
                let delay = self.retry.delay_for(message.retry_count);
                warn!(
                    subscription_id = %self.subscription_id,
                    message_id = %message.id,
                    retry = message.retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "handler failed, retrying"
                );
                self.context.analytics.record_retry();
                tokio::time::sleep(delay).await;
                if !self.active.load(Ordering::Acquire) {
                    return;
                }
                message.retry_count += 1;
                continue;
            }

            self.give_up(message, error).await;
            return;
        }
    }

    async fn give_up(&self, message: PubSubMessage, error: HandlerError) {
        if let Some(on_error) = &self.error_handler {
            on_error(&error, &message);
        }
        self.context.analytics.record_dropped(1);

        let Some(queue) = &self.retry.dead_letter_queue else {
            warn!(
                subscription_id = %self.subscription_id,
                message_id = %message.id,
                channel = %message.channel,
                error = %error,
                "handler failed and no dead-letter queue is configured; message dropped"
            );
            return;
        };

        let letter = DeadLetter {
            message,
            error: error.to_string(),
            subscription_id: self.subscription_id.clone(),
            failed_at: self.context.clock.now_millis(),
        };
        let result = match serde_json::to_string(&letter) {
            Ok(json) => self
                .context
                .store
                .rpush(&dead_letter_key(queue), vec![json])
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(()) => {
                self.context.analytics.record_dead_lettered();
                warn!(
                    subscription_id = %self.subscription_id,
                    message_id = %letter.message.id,
                    dead_letter_queue = %queue,
                    "message dead-lettered"
                );
            }
            Err(e) => error!(
                subscription_id = %self.subscription_id,
                message_id = %letter.message.id,
                error = %e,
                "failed to write dead letter"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            dead_letter_queue: None,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_stats_snapshot_empty() {
        let stats = SubscriptionStats::default();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 0);
        assert_eq!(snapshot.last_message_at, None);
    }

    #[test]
    fn test_subscribe_options_builders() {
        let options = SubscribeOptions::pattern()
            .with_retries(2)
            .with_dead_letter_queue("failed");
        assert!(options.pattern);
        assert_eq!(options.max_retries, Some(2));
        assert_eq!(options.dead_letter_queue.as_deref(), Some("failed"));
    }
}

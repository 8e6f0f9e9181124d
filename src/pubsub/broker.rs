//! # Pub/Sub Broker
//!
//! Fan-out broker on top of the shared store.
//!
//! `publish` never calls handlers directly. It writes the message (or a
//! whole batch) to the store channel `pubsub:<channel>`; every broker
//! instance sharing the store has a listener task that decodes what arrives
//! and queues it on each matching subscription. Two brokers in different
//! processes therefore see the same messages in the same order.
//!
//! ## Ordering
//!
//! Emissions are serialized by the pending-batch lock, the store channel
//! preserves emission order, and each subscription has a single worker. A
//! non-batched publish first flushes anything still buffered for the same
//! channel so batching never reorders a channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::analytics::{Analytics, AnalyticsSnapshot};
use super::errors::{PubSubError, PubSubResult};
use super::message::{DeadLetter, PubSubMessage, PublishEntry, PublishOptions, WirePayload};
use super::pattern::ChannelMatcher;
use super::subscription::{
    dead_letter_key, DeliveryContext, ErrorHandler, MessageHandler, RetryPolicy, SubscribeOptions,
    Subscription, SubscriptionInfo, SubscriptionStats, Worker,
};
use crate::clock::SharedClock;
use crate::store::{ChannelMessage, SharedStore, StoreError};

/// Store channel prefix for broker traffic
const CHANNEL_PREFIX: &str = "pubsub:";

fn store_channel(channel: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, channel)
}

/// Store key of a channel's history list
pub fn history_key(channel: &str) -> String {
    format!("pubsub:history:{}", channel)
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Longest a partial batch waits before it is emitted
    pub batch_flush_interval: Duration,
    /// Messages kept per channel history
    pub history_limit: usize,
    /// First retry delay; doubles per retry
    pub retry_base_delay: Duration,
    /// Retries for subscriptions that do not set their own
    pub default_max_retries: u32,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            batch_flush_interval: Duration::from_millis(100),
            history_limit: 1000,
            retry_base_delay: Duration::from_secs(1),
            default_max_retries: 0,
        }
    }
}

/// Per-entry outcome of `publish_batch`
#[derive(Debug, Default)]
pub struct BatchPublishResult {
    /// `(entry index, message id)`
    pub successful: Vec<(usize, String)>,
    /// `(entry index, error)`
    pub failed: Vec<(usize, PubSubError)>,
}

/// Publish/subscribe broker
pub struct PubSubBroker {
    store: SharedStore,
    clock: SharedClock,
    config: PubSubConfig,
    analytics: Arc<Analytics>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    pending: Mutex<HashMap<String, Vec<PubSubMessage>>>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PubSubBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubBroker")
            .field("config", &self.config)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl PubSubBroker {
    /// Create the broker and start its listener task
    pub fn start(store: SharedStore, clock: SharedClock, config: PubSubConfig) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let broker = Arc::new(Self {
            store,
            clock,
            config,
            analytics: Arc::new(Analytics::default()),
            subscriptions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            shutdown_tx,
            closed: AtomicBool::new(false),
        });

        // Subscribe before returning so nothing published afterwards is missed
        let receiver = broker.store.subscribe();
        let shutdown = broker.shutdown_tx.subscribe();
        tokio::spawn(Self::listen(Arc::downgrade(&broker), receiver, shutdown));

        broker
    }

    fn ensure_open(&self) -> PubSubResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(PubSubError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    // ==================
    // Listener
    // ==================

    async fn listen(
        broker: Weak<Self>,
        mut receiver: broadcast::Receiver<ChannelMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Ok(message) => {
                        let Some(broker) = broker.upgrade() else { break };
                        broker.on_channel_message(message);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "broker listener lagged; messages skipped");
                        if let Some(broker) = broker.upgrade() {
                            broker.analytics.record_dropped(skipped);
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.recv() => {
                    // Deliver what was already emitted before stopping
                    if let Some(broker) = broker.upgrade() {
                        while let Ok(message) = receiver.try_recv() {
                            broker.on_channel_message(message);
                        }
                    }
                    break;
                }
            }
        }
        debug!("broker listener stopped");
    }

    fn on_channel_message(&self, raw: ChannelMessage) {
        let Some(channel) = raw.channel.strip_prefix(CHANNEL_PREFIX) else {
            return;
        };
        let payload: WirePayload = match serde_json::from_str(&raw.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel, error = %e, "dropping malformed broker payload");
                self.analytics.record_malformed();
                return;
            }
        };
        for message in payload.into_messages() {
            self.dispatch(channel, message);
        }
    }

    /// Queue a message on every matching subscription
    fn dispatch(&self, channel: &str, message: PubSubMessage) -> usize {
        let Ok(subscriptions) = self.subscriptions.read() else {
            return 0;
        };
        let mut matched = 0;
        for subscription in subscriptions.values() {
            if subscription.matcher.matches(channel)
                && subscription.sender.send(message.clone()).is_ok()
            {
                matched += 1;
            }
        }
        matched
    }

    // ==================
    // Publishing
    // ==================

    async fn emit(&self, channel: &str, payload: WirePayload) -> PubSubResult<usize> {
        let json = serde_json::to_string(&payload).map_err(StoreError::from)?;
        Ok(self.store.publish(&store_channel(channel), json).await?)
    }

    async fn persist(&self, message: &PubSubMessage) -> PubSubResult<()> {
        let key = history_key(&message.channel);
        let json = serde_json::to_string(message).map_err(StoreError::from)?;
        self.store.lpush(&key, vec![json]).await?;
        let keep = self.config.history_limit.max(1) as isize;
        self.store.ltrim(&key, 0, keep - 1).await?;
        Ok(())
    }

    /// Publish `data` on `channel`, returning the message id
    pub async fn publish(
        self: &Arc<Self>,
        channel: &str,
        data: Value,
        options: PublishOptions,
    ) -> PubSubResult<String> {
        self.ensure_open()?;
        if channel.is_empty() {
            return Err(PubSubError::InvalidChannel("channel must not be empty".into()));
        }

        // History is written under the same lock as emission so both keep
        // publish order
        let mut pending = self.pending.lock().await;
        let message = PubSubMessage::new(channel, data, &options, self.clock.now_millis());
        let id = message.id.clone();
        if options.persist {
            self.persist(&message).await?;
        }

        if options.batch_size > 1 {
            let buffer = pending.entry(channel.to_string()).or_default();
            buffer.push(message);
            let buffered = buffer.len();

            if buffered >= options.batch_size {
                let messages = pending.remove(channel).unwrap_or_default();
                self.emit_batch(channel, messages).await?;
            } else if buffered == 1 {
                self.arm_flush_timer(channel);
            }
        } else {
            if let Some(buffered) = pending.remove(channel) {
                self.emit_batch(channel, buffered).await?;
            }
            self.emit(channel, WirePayload::Single { message }).await?;
        }
        drop(pending);

        self.analytics.record_published();
        debug!(channel, message_id = %id, "message published");
        Ok(id)
    }

    async fn emit_batch(&self, channel: &str, messages: Vec<PubSubMessage>) -> PubSubResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let count = messages.len() as u64;
        if let Err(e) = self.emit(channel, WirePayload::Batch { messages }).await {
            self.analytics.record_dropped(count);
            return Err(e);
        }
        Ok(())
    }

    fn arm_flush_timer(self: &Arc<Self>, channel: &str) {
        let broker = Arc::downgrade(self);
        let channel = channel.to_string();
        let interval = self.config.batch_flush_interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(broker) = broker.upgrade() {
                if let Err(e) = broker.flush_channel(&channel).await {
                    error!(channel = %channel, error = %e, "batch flush failed");
                }
            }
        });
    }

    /// Emit whatever is buffered for one channel
    pub async fn flush_channel(&self, channel: &str) -> PubSubResult<()> {
        let mut pending = self.pending.lock().await;
        let messages = pending.remove(channel).unwrap_or_default();
        self.emit_batch(channel, messages).await
    }

    /// Emit every buffered batch
    pub async fn flush(&self) -> PubSubResult<()> {
        let mut pending = self.pending.lock().await;
        let channels: Vec<String> = pending.keys().cloned().collect();
        let mut first_error = None;
        for channel in channels {
            let messages = pending.remove(&channel).unwrap_or_default();
            if let Err(e) = self.emit_batch(&channel, messages).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Publish several messages; each entry succeeds or fails on its own
    pub async fn publish_batch(self: &Arc<Self>, entries: Vec<PublishEntry>) -> BatchPublishResult {
        let mut result = BatchPublishResult::default();
        for (index, entry) in entries.into_iter().enumerate() {
            match self.publish(&entry.channel, entry.data, entry.options).await {
                Ok(id) => result.successful.push((index, id)),
                Err(e) => {
                    warn!(index, channel = %entry.channel, error = %e, "batch publish entry failed");
                    result.failed.push((index, e));
                }
            }
        }
        result
    }

    // ==================
    // Subscriptions
    // ==================

    /// Subscribe a handler to a channel or glob pattern
    pub fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
        options: SubscribeOptions,
        error_handler: Option<ErrorHandler>,
    ) -> PubSubResult<String> {
        self.ensure_open()?;
        let matcher = ChannelMatcher::new(channel, options.pattern)?;
        let retry = RetryPolicy {
            max_retries: options.max_retries.unwrap_or(self.config.default_max_retries),
            base_delay: self.config.retry_base_delay,
            dead_letter_queue: options.dead_letter_queue.clone(),
        };

        let id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(SubscriptionStats::default());
        let active = Arc::new(AtomicBool::new(true));

        let worker = Worker {
            subscription_id: id.clone(),
            receiver,
            handler,
            error_handler,
            retry: retry.clone(),
            batch_size: options.batch_size,
            stats: Arc::clone(&stats),
            active: Arc::clone(&active),
            context: DeliveryContext {
                store: Arc::clone(&self.store),
                clock: Arc::clone(&self.clock),
                analytics: Arc::clone(&self.analytics),
            },
        };

        let mut subscriptions = self
            .subscriptions
            .write()
            .map_err(|_| StoreError::Internal("Lock poisoned".into()))?;
        tokio::spawn(worker.run());
        subscriptions.insert(
            id.clone(),
            Subscription {
                id: id.clone(),
                matcher,
                retry,
                stats,
                active,
                sender,
            },
        );

        info!(subscription_id = %id, channel, pattern = options.pattern, "subscribed");
        Ok(id)
    }

    /// Remove a subscription; false if the id is unknown
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = self
            .subscriptions
            .write()
            .ok()
            .and_then(|mut subs| subs.remove(subscription_id));

        match removed {
            Some(subscription) => {
                subscription.active.store(false, Ordering::Release);
                info!(subscription_id, "unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .read()
            .map(|subs| subs.values().map(Subscription::info).collect())
            .unwrap_or_default()
    }

    // ==================
    // History and replay
    // ==================

    /// Persisted messages of a channel, newest first
    pub async fn get_history(
        &self,
        channel: &str,
        limit: usize,
        offset: usize,
    ) -> PubSubResult<Vec<PubSubMessage>> {
        let Some((start, stop)) = list_window(offset, limit) else {
            return Ok(Vec::new());
        };
        let raw = self.store.lrange(&history_key(channel), start, stop).await?;
        Ok(decode_all(&raw, channel))
    }

    /// Feed persisted messages at or after `from_timestamp` to `handler`,
    /// oldest first. Returns how many the handler accepted.
    pub async fn replay_messages(
        &self,
        channel: &str,
        from_timestamp: i64,
        handler: MessageHandler,
    ) -> PubSubResult<usize> {
        let raw = self.store.lrange(&history_key(channel), 0, -1).await?;
        let mut messages: Vec<PubSubMessage> = decode_all(&raw, channel)
            .into_iter()
            .filter(|m| m.timestamp >= from_timestamp)
            .collect();
        messages.reverse();

        let mut replayed = 0;
        for message in messages {
            let id = message.id.clone();
            match handler(message).await {
                Ok(()) => replayed += 1,
                Err(e) => warn!(channel, message_id = %id, error = %e, "replay handler failed"),
            }
        }
        info!(channel, replayed, "history replayed");
        Ok(replayed)
    }

    /// Oldest-first dead letters of a queue
    pub async fn get_dead_letters(&self, queue: &str, limit: usize) -> PubSubResult<Vec<DeadLetter>> {
        let Some((start, stop)) = list_window(0, limit) else {
            return Ok(Vec::new());
        };
        let raw = self
            .store
            .lrange(&dead_letter_key(queue), start, stop)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect())
    }

    pub fn analytics(&self) -> AnalyticsSnapshot {
        self.analytics.snapshot(self.subscription_count())
    }

    /// Flush buffered batches, stop the listener and drop all subscriptions
    pub async fn shutdown(&self) {
        if let Err(e) = self.flush().await {
            error!(error = %e, "flush during shutdown failed");
        }
        self.closed.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());

        // Let the listener hand over what it already holds before workers stop
        tokio::task::yield_now().await;
        if let Ok(mut subscriptions) = self.subscriptions.write() {
            for subscription in subscriptions.values() {
                subscription.active.store(false, Ordering::Release);
            }
            subscriptions.clear();
        }
        info!("broker shut down");
    }
}

fn decode_all(raw: &[String], channel: &str) -> Vec<PubSubMessage> {
    raw.iter()
        .filter_map(|json| match serde_json::from_str(json) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(channel, error = %e, "skipping malformed history entry");
                None
            }
        })
        .collect()
}

/// Inclusive `lrange` bounds for `limit` entries from `offset`; `None` when
/// the window is empty or starts past any addressable index
fn list_window(offset: usize, limit: usize) -> Option<(isize, isize)> {
    if limit == 0 {
        return None;
    }
    let start = isize::try_from(offset).ok()?;
    let stop = offset.saturating_add(limit - 1).min(isize::MAX as usize) as isize;
    Some((start, stop))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pubsub::{handler, HandlerError};
    use crate::store::{MemoryStore, Store};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn broker(config: PubSubConfig) -> (Arc<PubSubBroker>, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = ManualClock::new(1_000);
        let store = MemoryStore::shared(clock.clone());
        let broker = PubSubBroker::start(store.clone(), clock.clone(), config);
        (broker, store, clock)
    }

    fn collector() -> (MessageHandler, Arc<StdMutex<Vec<PubSubMessage>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let h = handler(move |m| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(m);
                Ok(())
            }
        });
        (h, seen)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_literal_fan_out_in_order() {
        let (broker, _, _) = broker(PubSubConfig::default());
        let (h1, seen1) = collector();
        let (h2, seen2) = collector();
        broker.subscribe("reports", h1, SubscribeOptions::default(), None).unwrap();
        broker.subscribe("reports", h2, SubscribeOptions::default(), None).unwrap();

        for i in 0..5 {
            broker
                .publish("reports", json!({ "n": i }), PublishOptions::default())
                .await
                .unwrap();
        }

        wait_for(|| seen1.lock().unwrap().len() == 5 && seen2.lock().unwrap().len() == 5).await;
        for seen in [&seen1, &seen2] {
            let order: Vec<i64> = seen
                .lock()
                .unwrap()
                .iter()
                .map(|m| m.data["n"].as_i64().unwrap())
                .collect();
            assert_eq!(order, vec![0, 1, 2, 3, 4]);
        }
        assert_eq!(broker.analytics().delivered, 10);
    }

    #[tokio::test]
    async fn test_pattern_subscription() {
        let (broker, _, _) = broker(PubSubConfig::default());
        let (matching, seen) = collector();
        let (other, unseen) = collector();
        broker.subscribe("events:*", matching, SubscribeOptions::pattern(), None).unwrap();
        broker.subscribe("audit:*", other, SubscribeOptions::pattern(), None).unwrap();

        broker
            .publish("events:report", json!("x"), PublishOptions::default())
            .await
            .unwrap();

        wait_for(|| seen.lock().unwrap().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(unseen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        let config = PubSubConfig {
            retry_base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let (broker, _, _) = broker(config);
        let attempts = Arc::new(StdMutex::new(0u32));
        let counter = Arc::clone(&attempts);
        let failing = handler(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock().unwrap() += 1;
                Err(HandlerError::from("nope"))
            }
        });
        let reported = Arc::new(StdMutex::new(Vec::new()));
        let report_sink = Arc::clone(&reported);
        let on_error: ErrorHandler = Arc::new(move |e, m| {
            report_sink.lock().unwrap().push((e.to_string(), m.retry_count));
        });

        broker
            .subscribe(
                "jobs",
                failing,
                SubscribeOptions::default()
                    .with_retries(2)
                    .with_dead_letter_queue("jobs-dlq"),
                Some(on_error),
            )
            .unwrap();
        broker.publish("jobs", json!(1), PublishOptions::default()).await.unwrap();

        wait_for(|| broker.analytics().dead_lettered == 1).await;
        assert_eq!(*attempts.lock().unwrap(), 3);
        assert_eq!(reported.lock().unwrap().as_slice(), &[("nope".to_string(), 2)]);

        let letters = broker.get_dead_letters("jobs-dlq", 10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].error, "nope");
        assert_eq!(letters[0].message.retry_count, 2);

        let info = &broker.list_subscriptions()[0];
        assert_eq!(info.stats.received, 1);
        assert_eq!(info.stats.errors, 3);
    }

    #[tokio::test]
    async fn test_failure_without_dead_letter_is_dropped() {
        let (broker, store, _) = broker(PubSubConfig::default());
        let failing = handler(|_| async { Err(HandlerError::from("bad")) });
        broker
            .subscribe("c", failing, SubscribeOptions::default(), None)
            .unwrap();
        broker.publish("c", json!(1), PublishOptions::default()).await.unwrap();

        wait_for(|| broker.analytics().dropped == 1).await;
        let analytics = broker.analytics();
        assert_eq!(analytics.dead_lettered, 0);
        assert!((analytics.error_rate - 1.0).abs() < f64::EPSILON);
        assert!(store.keys("pubsub:dlq:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batching_by_size() {
        let config = PubSubConfig {
            batch_flush_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let (broker, _, _) = broker(config);
        let (h, seen) = collector();
        broker.subscribe("b", h, SubscribeOptions::default(), None).unwrap();

        broker.publish("b", json!(1), PublishOptions::batched(3)).await.unwrap();
        broker.publish("b", json!(2), PublishOptions::batched(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().unwrap().is_empty());

        broker.publish("b", json!(3), PublishOptions::batched(3)).await.unwrap();
        wait_for(|| seen.lock().unwrap().len() == 3).await;
    }

    #[tokio::test]
    async fn test_batch_flushed_by_timer() {
        let config = PubSubConfig {
            batch_flush_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (broker, _, _) = broker(config);
        let (h, seen) = collector();
        broker.subscribe("t", h, SubscribeOptions::default(), None).unwrap();

        broker.publish("t", json!(1), PublishOptions::batched(50)).await.unwrap();
        wait_for(|| seen.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn test_unbatched_publish_flushes_pending_first() {
        let config = PubSubConfig {
            batch_flush_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let (broker, _, _) = broker(config);
        let (h, seen) = collector();
        broker.subscribe("o", h, SubscribeOptions::default(), None).unwrap();

        broker.publish("o", json!(1), PublishOptions::batched(10)).await.unwrap();
        broker.publish("o", json!(2), PublishOptions::default()).await.unwrap();

        wait_for(|| seen.lock().unwrap().len() == 2).await;
        let order: Vec<Value> = seen.lock().unwrap().iter().map(|m| m.data.clone()).collect();
        assert_eq!(order, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_history_and_replay() {
        let config = PubSubConfig {
            history_limit: 3,
            ..Default::default()
        };
        let (broker, _, clock) = broker(config);
        for i in 0..5 {
            clock.advance(Duration::from_millis(10));
            broker
                .publish("h", json!(i), PublishOptions::persisted())
                .await
                .unwrap();
        }

        let history = broker.get_history("h", 10, 0).await.unwrap();
        let values: Vec<Value> = history.iter().map(|m| m.data.clone()).collect();
        assert_eq!(values, vec![json!(4), json!(3), json!(2)]);

        let page = broker.get_history("h", 1, 1).await.unwrap();
        assert_eq!(page[0].data, json!(3));

        let cutoff = history[1].timestamp;
        let (h, seen) = collector();
        let replayed = broker.replay_messages("h", cutoff, h).await.unwrap();
        assert_eq!(replayed, 2);
        let order: Vec<Value> = seen.lock().unwrap().iter().map(|m| m.data.clone()).collect();
        assert_eq!(order, vec![json!(3), json!(4)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_history_matches_delivery_order_under_concurrent_publishers() {
        let (broker, _, _) = broker(PubSubConfig::default());
        let (h, seen) = collector();
        broker.subscribe("orders", h, SubscribeOptions::default(), None).unwrap();

        let publishers: Vec<_> = (0..24)
            .map(|i| {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    broker
                        .publish("orders", json!(i), PublishOptions::persisted())
                        .await
                        .unwrap()
                })
            })
            .collect();
        for publisher in publishers {
            publisher.await.unwrap();
        }

        wait_for(|| seen.lock().unwrap().len() == 24).await;
        let delivered: Vec<String> = seen.lock().unwrap().iter().map(|m| m.id.clone()).collect();
        let mut persisted: Vec<String> = broker
            .get_history("orders", 100, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        // History is newest first
        persisted.reverse();
        assert_eq!(persisted, delivered);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (broker, _, _) = broker(PubSubConfig::default());
        let (h, seen) = collector();
        let id = broker.subscribe("u", h, SubscribeOptions::default(), None).unwrap();

        assert!(broker.unsubscribe(&id));
        assert!(!broker.unsubscribe(&id));
        assert!(!broker.unsubscribe("unknown"));

        broker.publish("u", json!(1), PublishOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let (broker, store, _) = broker(PubSubConfig::default());
        let (h, seen) = collector();
        broker.subscribe("m", h, SubscribeOptions::default(), None).unwrap();

        store.publish("pubsub:m", "{garbage".into()).await.unwrap();
        broker.publish("m", json!("ok"), PublishOptions::default()).await.unwrap();

        wait_for(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(broker.analytics().malformed, 1);
    }

    #[tokio::test]
    async fn test_publish_batch_independent_entries() {
        let (broker, _, _) = broker(PubSubConfig::default());
        let result = broker
            .publish_batch(vec![
                PublishEntry {
                    channel: "a".into(),
                    data: json!(1),
                    options: PublishOptions::default(),
                },
                PublishEntry {
                    channel: String::new(),
                    data: json!(2),
                    options: PublishOptions::default(),
                },
            ])
            .await;
        assert_eq!(result.successful.len(), 1);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].0, 1);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let (broker, _, _) = broker(PubSubConfig::default());
        broker.shutdown().await;
        assert!(matches!(
            broker.publish("x", json!(1), PublishOptions::default()).await,
            Err(PubSubError::ShuttingDown)
        ));
    }

    #[test]
    fn test_list_window_bounds() {
        assert_eq!(list_window(0, 0), None);
        assert_eq!(list_window(5, 10), Some((5, 14)));
        assert_eq!(list_window(usize::MAX, 1), None);
        assert_eq!(list_window(10, usize::MAX), Some((10, isize::MAX)));
    }

    #[tokio::test]
    async fn test_history_with_huge_window_is_empty_not_a_panic() {
        let (broker, _, _) = broker(PubSubConfig::default());
        broker
            .publish("audit", json!(1), PublishOptions::persisted())
            .await
            .unwrap();

        assert!(broker.get_history("audit", 10, usize::MAX).await.unwrap().is_empty());
        assert_eq!(broker.get_history("audit", usize::MAX, 0).await.unwrap().len(), 1);
        assert!(broker.get_dead_letters("audit-dlq", usize::MAX).await.unwrap().is_empty());
    }
}

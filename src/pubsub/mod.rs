//! # Pub/Sub
//!
//! Channel and pattern fan-out over the shared store with optional
//! publisher-side batching, per-subscription retries, dead-letter lists and
//! bounded per-channel history.
//!
//! Delivery is at-least-once per subscription. A handler error is retried
//! with a doubling delay while the subscription's queue waits behind it; once
//! retries run out the message is dead-lettered when a dead-letter queue is
//! configured and dropped with a warning otherwise.

mod analytics;
mod broker;
mod errors;
mod message;
mod pattern;
mod subscription;

pub use analytics::{error_rate, Analytics, AnalyticsSnapshot};
pub use broker::{history_key, BatchPublishResult, PubSubBroker, PubSubConfig};
pub use errors::{HandlerError, PubSubError, PubSubResult};
pub use message::{DeadLetter, MessagePriority, PubSubMessage, PublishEntry, PublishOptions};
pub use pattern::ChannelMatcher;
pub use subscription::{
    dead_letter_key, handler, ErrorHandler, HandlerFuture, MessageHandler, SubscribeOptions,
    SubscriptionInfo, SubscriptionStats, SubscriptionStatsSnapshot,
};

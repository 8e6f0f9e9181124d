//! # Shared Store
//!
//! Atomic data-store primitives that all queue and broker state lives in.
//!
//! The queue and the broker never coordinate through anything but this
//! trait: exclusivity of a ready message comes from the atomic multi-pop,
//! sweeper races are settled by the boolean returned from `zrem`, and
//! rate-limit windows rely on `incr_below` being a single step.
//!
//! ## Primitives
//!
//! - **Lists**: FIFO ready queues, history and dead-letter lists
//! - **Sorted sets**: delayed and in-flight messages scored by time
//! - **Counters with TTL**: fixed-window rate limiting
//! - **Values with TTL**: per-process monitor snapshots
//! - **Channels**: ordered fan-out of published payloads

mod errors;
mod memory;

pub use errors::{StoreError, StoreResult};
pub use memory::{MemoryStore, DEFAULT_CHANNEL_CAPACITY};

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// A payload published on a store channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Channel the payload was published on
    pub channel: String,
    /// Raw payload
    pub payload: String,
}

/// Shared store handle
pub type SharedStore = Arc<dyn Store>;

/// Atomic store operations
///
/// Every method is a single atomic step against the store. Indices for
/// `lrange`/`ltrim`/`zrange` are inclusive and negative values count from
/// the end, as in Redis.
#[async_trait]
pub trait Store: Send + Sync + Debug {
    /// Append values to the tail of a list, returning the new length
    async fn rpush(&self, key: &str, values: Vec<String>) -> StoreResult<usize>;

    /// Prepend values to the head of a list, returning the new length
    async fn lpush(&self, key: &str, values: Vec<String>) -> StoreResult<usize>;

    /// Atomically pop up to `count` values from the head of a list
    async fn lpop(&self, key: &str, count: usize) -> StoreResult<Vec<String>>;

    /// Read a range of a list
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    /// Keep only the given range of a list
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> StoreResult<()>;

    /// List length (0 for a missing key)
    async fn llen(&self, key: &str) -> StoreResult<usize>;

    /// Add or rescore a sorted-set member; true if it was newly added
    async fn zadd(&self, key: &str, member: String, score: i64) -> StoreResult<bool>;

    /// Remove a sorted-set member; true if this call removed it
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Members with `min <= score <= max`, ascending by score
    async fn zrange_by_score(&self, key: &str, min: i64, max: i64)
        -> StoreResult<Vec<(String, i64)>>;

    /// Members by rank, ascending by score
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<(String, i64)>>;

    /// Sorted-set cardinality
    async fn zcard(&self, key: &str) -> StoreResult<usize>;

    /// Increment a counter unless it already reached `max`.
    ///
    /// Creating the counter sets its TTL to `ttl`. Returns the new value, or
    /// `None` when the counter is at `max` (in which case it is untouched).
    async fn incr_below(&self, key: &str, max: u64, ttl: Duration) -> StoreResult<Option<u64>>;

    /// Current counter value (0 for a missing key)
    async fn get_counter(&self, key: &str) -> StoreResult<u64>;

    /// Remaining time to live of a key in milliseconds
    async fn ttl_millis(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Set a string value with a TTL
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()>;

    /// Get a string value
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Live keys starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Delete a key of any type
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Publish a payload, returning the number of live channel receivers
    async fn publish(&self, channel: &str, payload: String) -> StoreResult<usize>;

    /// Receive every payload published after this call, in publish order
    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage>;
}

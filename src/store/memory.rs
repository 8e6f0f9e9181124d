//! # In-Memory Store
//!
//! Process-local implementation of [`Store`]. Every call takes one lock, so
//! every call is atomic with respect to every other call, which is the only
//! property the queue and broker rely on.
//!
//! Expiry is lazy: a key past its TTL is dropped the next time anything
//! touches it.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::errors::{StoreError, StoreResult};
use super::{ChannelMessage, Store};
use crate::clock::{millis, SharedClock, SystemClock};

/// Default capacity of the channel fan-out buffer.
///
/// A subscriber that falls this many messages behind loses the oldest ones
/// and sees `RecvError::Lagged` with the count. The broker listener logs
/// that and adds it to the dropped counter of its analytics.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Sorted set keeping both score lookup and score order
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: String, score: i64) -> bool {
        match self.scores.insert(member.clone(), score) {
            Some(old) => {
                self.ordered.remove(&(old, member.clone()));
                self.ordered.insert((score, member));
                false
            }
            None => {
                self.ordered.insert((score, member));
                true
            }
        }
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

#[derive(Debug)]
enum Value {
    List(VecDeque<String>),
    ZSet(SortedSet),
    Counter(u64),
    Str(String),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

/// Resolve Redis-style inclusive indices against a length
fn normalize_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// In-memory shared store
#[derive(Debug)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    channel: broadcast::Sender<ChannelMessage>,
    clock: SharedClock,
    offline: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(SystemClock::shared())
    }
}

impl MemoryStore {
    /// Create a store driven by the given clock
    pub fn new(clock: SharedClock) -> Self {
        Self::with_channel_capacity(clock, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a store whose channel fan-out keeps up to `capacity` messages
    /// per lagging subscriber
    pub fn with_channel_capacity(clock: SharedClock, capacity: usize) -> Self {
        let (channel, _) = broadcast::channel(capacity.max(1));
        Self {
            data: Mutex::new(HashMap::new()),
            channel,
            clock,
            offline: AtomicBool::new(false),
        }
    }

    /// Create a shared handle
    pub fn shared(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    /// Simulate losing (or regaining) the connection to the store
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".into()));
        }
        self.data
            .lock()
            .map_err(|_| StoreError::Internal("Lock poisoned".into()))
    }

    /// Drop the key if its TTL has passed
    fn expire_if_due(&self, data: &mut HashMap<String, Entry>, key: &str) {
        let now = self.clock.now_millis();
        let expired = data
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at <= now)
            .unwrap_or(false);
        if expired {
            data.remove(key);
        }
    }

    fn list_mut<'a>(
        &self,
        data: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> StoreResult<&'a mut VecDeque<String>> {
        self.expire_if_due(data, key);
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
        match &mut entry.value {
            Value::List(list) => Ok(list),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn zset_mut<'a>(
        &self,
        data: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> StoreResult<&'a mut SortedSet> {
        self.expire_if_due(data, key);
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::ZSet(SortedSet::default())));
        match &mut entry.value {
            Value::ZSet(set) => Ok(set),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn read<'a>(&self, data: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a Value> {
        self.expire_if_due(data, key);
        data.get(key).map(|e| &e.value)
    }

    /// Remove empty containers so `keys` only reports live data
    fn drop_if_empty(data: &mut HashMap<String, Entry>, key: &str) {
        let empty = match data.get(key).map(|e| &e.value) {
            Some(Value::List(list)) => list.is_empty(),
            Some(Value::ZSet(set)) => set.len() == 0,
            _ => false,
        };
        if empty {
            data.remove(key);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn rpush(&self, key: &str, values: Vec<String>) -> StoreResult<usize> {
        let mut data = self.lock()?;
        let list = self.list_mut(&mut data, key)?;
        list.extend(values);
        Ok(list.len())
    }

    async fn lpush(&self, key: &str, values: Vec<String>) -> StoreResult<usize> {
        let mut data = self.lock()?;
        let list = self.list_mut(&mut data, key)?;
        for value in values {
            list.push_front(value);
        }
        Ok(list.len())
    }

    async fn lpop(&self, key: &str, count: usize) -> StoreResult<Vec<String>> {
        let mut data = self.lock()?;
        let list = self.list_mut(&mut data, key)?;
        let take = count.min(list.len());
        let popped: Vec<String> = list.drain(..take).collect();
        Self::drop_if_empty(&mut data, key);
        Ok(popped)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut data = self.lock()?;
        match self.read(&mut data, key) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(normalize_range(list.len(), start, stop)
                .map(|(s, e)| list.range(s..=e).cloned().collect())
                .unwrap_or_default()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> StoreResult<()> {
        let mut data = self.lock()?;
        let list = self.list_mut(&mut data, key)?;
        match normalize_range(list.len(), start, stop) {
            Some((s, e)) => {
                list.truncate(e + 1);
                list.drain(..s);
            }
            None => list.clear(),
        }
        Self::drop_if_empty(&mut data, key);
        Ok(())
    }

    async fn llen(&self, key: &str) -> StoreResult<usize> {
        let mut data = self.lock()?;
        match self.read(&mut data, key) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn zadd(&self, key: &str, member: String, score: i64) -> StoreResult<bool> {
        let mut data = self.lock()?;
        let set = self.zset_mut(&mut data, key)?;
        Ok(set.insert(member, score))
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut data = self.lock()?;
        let removed = match data.get_mut(key).map(|e| &mut e.value) {
            None => false,
            Some(Value::ZSet(set)) => set.remove(member),
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
        };
        Self::drop_if_empty(&mut data, key);
        Ok(removed)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> StoreResult<Vec<(String, i64)>> {
        let mut data = self.lock()?;
        match self.read(&mut data, key) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(set)) => Ok(set
                .ordered
                .iter()
                .skip_while(|(score, _)| *score < min)
                .take_while(|(score, _)| *score <= max)
                .map(|(score, member)| (member.clone(), *score))
                .collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<(String, i64)>> {
        let mut data = self.lock()?;
        match self.read(&mut data, key) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(set)) => Ok(normalize_range(set.len(), start, stop)
                .map(|(s, e)| {
                    set.ordered
                        .iter()
                        .skip(s)
                        .take(e - s + 1)
                        .map(|(score, member)| (member.clone(), *score))
                        .collect()
                })
                .unwrap_or_default()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        let mut data = self.lock()?;
        match self.read(&mut data, key) {
            None => Ok(0),
            Some(Value::ZSet(set)) => Ok(set.len()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn incr_below(&self, key: &str, max: u64, ttl: Duration) -> StoreResult<Option<u64>> {
        let now = self.clock.now_millis();
        let mut data = self.lock()?;
        self.expire_if_due(&mut data, key);
        let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Counter(0),
            expires_at: Some(now + millis(ttl)),
        });
        match &mut entry.value {
            Value::Counter(count) if *count >= max => Ok(None),
            Value::Counter(count) => {
                *count += 1;
                Ok(Some(*count))
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn get_counter(&self, key: &str) -> StoreResult<u64> {
        let mut data = self.lock()?;
        match self.read(&mut data, key) {
            None => Ok(0),
            Some(Value::Counter(count)) => Ok(*count),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn ttl_millis(&self, key: &str) -> StoreResult<Option<i64>> {
        let now = self.clock.now_millis();
        let mut data = self.lock()?;
        self.expire_if_due(&mut data, key);
        Ok(data
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| (at - now).max(0)))
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let mut data = self.lock()?;
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at: Some(now + millis(ttl)),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut data = self.lock()?;
        match self.read(&mut data, key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now_millis();
        let mut data = self.lock()?;
        data.retain(|_, e| e.expires_at.map(|at| at > now).unwrap_or(true));
        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut data = self.lock()?;
        self.expire_if_due(&mut data, key);
        Ok(data.remove(key).is_some())
    }

    async fn publish(&self, channel: &str, payload: String) -> StoreResult<usize> {
        // Hold the data lock so concurrent publishers are serialized in one order
        let _guard = self.lock()?;
        let message = ChannelMessage {
            channel: channel.to_string(),
            payload,
        };
        // No receivers is not an error: nobody is listening yet
        Ok(self.channel.send(message).unwrap_or(0))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.channel.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (MemoryStore, Arc<ManualClock>) {
        let clock = ManualClock::new(1_000_000);
        (MemoryStore::new(clock.clone()), clock)
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_list_fifo() {
        let (store, _) = store();
        store.rpush("q", strings(&["a", "b", "c"])).await.unwrap();

        assert_eq!(store.lpop("q", 2).await.unwrap(), strings(&["a", "b"]));
        assert_eq!(store.llen("q").await.unwrap(), 1);
        assert_eq!(store.lpop("q", 5).await.unwrap(), strings(&["c"]));
        assert!(store.lpop("q", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lpush_ltrim_newest_first() {
        let (store, _) = store();
        for v in ["1", "2", "3", "4"] {
            store.lpush("h", vec![v.to_string()]).await.unwrap();
            store.ltrim("h", 0, 2).await.unwrap();
        }
        assert_eq!(store.lrange("h", 0, -1).await.unwrap(), strings(&["4", "3", "2"]));
        assert_eq!(store.lrange("h", 1, 1).await.unwrap(), strings(&["3"]));
        assert!(store.lrange("h", 5, 9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sorted_set_ordering() {
        let (store, _) = store();
        store.zadd("z", "late".into(), 30).await.unwrap();
        store.zadd("z", "early".into(), 10).await.unwrap();
        store.zadd("z", "mid".into(), 20).await.unwrap();

        let due = store.zrange_by_score("z", i64::MIN, 20).await.unwrap();
        assert_eq!(due, vec![("early".to_string(), 10), ("mid".to_string(), 20)]);

        // Rescore
        assert!(!store.zadd("z", "early".into(), 40).await.unwrap());
        let all = store.zrange("z", 0, -1).await.unwrap();
        assert_eq!(all.last().unwrap().0, "early");
    }

    #[tokio::test]
    async fn test_zrem_is_a_claim() {
        let (store, _) = store();
        store.zadd("z", "m".into(), 1).await.unwrap();
        assert!(store.zrem("z", "m").await.unwrap());
        assert!(!store.zrem("z", "m").await.unwrap());
        assert_eq!(store.zcard("z").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_incr_below_stops_at_max() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.incr_below("c", 2, ttl).await.unwrap(), Some(1));
        assert_eq!(store.incr_below("c", 2, ttl).await.unwrap(), Some(2));
        assert_eq!(store.incr_below("c", 2, ttl).await.unwrap(), None);
        assert_eq!(store.get_counter("c").await.unwrap(), 2);

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.get_counter("c").await.unwrap(), 0);
        assert_eq!(store.incr_below("c", 2, ttl).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_set_ex_expires() {
        let (store, clock) = store();
        store
            .set_ex("snap:a", "x".into(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("snap:a").await.unwrap(), Some("x".to_string()));
        assert_eq!(store.keys("snap:").await.unwrap(), vec!["snap:a".to_string()]);

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("snap:a").await.unwrap(), None);
        assert!(store.keys("snap:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let (store, _) = store();
        store.rpush("k", strings(&["a"])).await.unwrap();
        assert!(matches!(
            store.zadd("k", "m".into(), 1).await,
            Err(StoreError::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_store_fails() {
        let (store, _) = store();
        store.set_offline(true);
        assert!(matches!(
            store.llen("q").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_offline(false);
        assert_eq!(store.llen("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_in_order() {
        let (store, _) = store();
        assert_eq!(store.publish("c", "lost".into()).await.unwrap(), 0);

        let mut rx = store.subscribe();
        store.publish("c", "1".into()).await.unwrap();
        store.publish("d", "2".into()).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.channel.as_str(), first.payload.as_str()), ("c", "1"));
        assert_eq!((second.channel.as_str(), second.payload.as_str()), ("d", "2"));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_told_how_many_it_missed() {
        use tokio::sync::broadcast::error::RecvError;

        let store = MemoryStore::with_channel_capacity(ManualClock::new(0), 2);
        let mut rx = store.subscribe();
        for n in 1..=3 {
            store.publish("c", n.to_string()).await.unwrap();
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(1))));
        assert_eq!(rx.recv().await.unwrap().payload, "2");
        assert_eq!(rx.recv().await.unwrap().payload, "3");
    }

    #[test]
    fn test_zero_channel_capacity_is_raised_to_one() {
        let store = MemoryStore::with_channel_capacity(ManualClock::new(0), 0);
        let _rx = store.subscribe();
    }
}

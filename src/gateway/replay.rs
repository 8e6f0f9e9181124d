//! # Replay Buffer
//!
//! Bounded in-memory log of recently delivered events. Clients on the pull
//! transport read it with a timestamp cursor; push clients that reconnect
//! can use it to catch up.
//!
//! Entries leave the buffer two ways: the oldest is dropped once capacity is
//! exceeded, and anything older than the retention window is evicted.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::clock::{millis, SharedClock};

/// Replay buffer configuration
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Maximum number of events kept
    pub capacity: usize,
    /// Maximum age of a kept event
    pub retention: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            retention: Duration::from_secs(300),
        }
    }
}

/// Who an event is for. No filter at all means everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
}

impl EventTarget {
    pub fn broadcast() -> Self {
        Self::default()
    }

    pub fn users<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_ids: Some(users.into_iter().map(Into::into).collect()),
            roles: None,
        }
        .normalized()
    }

    pub fn roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_ids: None,
            roles: Some(roles.into_iter().map(Into::into).collect()),
        }
        .normalized()
    }

    /// Empty lists select nobody in particular, so they become "no filter"
    pub fn normalized(mut self) -> Self {
        if self.user_ids.as_ref().is_some_and(|u| u.is_empty()) {
            self.user_ids = None;
        }
        if self.roles.as_ref().is_some_and(|r| r.is_empty()) {
            self.roles = None;
        }
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.user_ids.is_none() && self.roles.is_none()
    }

    /// Whether a client with this identity is selected
    pub fn matches(&self, user_id: &str, role: Option<&str>) -> bool {
        if self.is_broadcast() {
            return true;
        }
        let by_user = self
            .user_ids
            .as_ref()
            .is_some_and(|users| users.iter().any(|u| u == user_id));
        let by_role = match (role, &self.roles) {
            (Some(role), Some(roles)) => roles.iter().any(|r| r == role),
            _ => false,
        };
        by_user || by_role
    }
}

/// A buffered event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    /// Epoch ms when buffered
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_roles: Option<Vec<String>>,
}

impl StoredEvent {
    pub fn target(&self) -> EventTarget {
        EventTarget {
            user_ids: self.target_user_ids.clone(),
            roles: self.target_roles.clone(),
        }
    }
}

/// Buffered events plus the newest stamp handed out, which outlives
/// eviction
#[derive(Debug, Default)]
struct Log {
    events: VecDeque<StoredEvent>,
    watermark: i64,
}

/// Ring buffer of recent events
#[derive(Debug)]
pub struct ReplayBuffer {
    config: ReplayConfig,
    clock: SharedClock,
    log: RwLock<Log>,
}

impl ReplayBuffer {
    pub fn new(config: ReplayConfig, clock: SharedClock) -> Self {
        let log = Log {
            events: VecDeque::with_capacity(config.capacity),
            watermark: i64::MIN,
        };
        Self {
            config,
            clock,
            log: RwLock::new(log),
        }
    }

    /// Buffer a new event, dropping the oldest past capacity.
    ///
    /// The stamp is taken under the write lock and never goes below the
    /// previous one, so buffer order is timestamp order and a cursor that
    /// has passed an event's stamp has seen every earlier event.
    pub fn record(&self, event_type: &str, data: Value, target: EventTarget) -> StoredEvent {
        let target = target.normalized();
        let mut event = StoredEvent {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            data,
            timestamp: 0,
            target_user_ids: target.user_ids,
            target_roles: target.roles,
        };

        match self.log.write() {
            Ok(mut log) => {
                event.timestamp = self.clock.now_millis().max(log.watermark);
                log.watermark = event.timestamp;
                log.events.push_back(event.clone());
                while log.events.len() > self.config.capacity {
                    log.events.pop_front();
                }
            }
            Err(_) => {
                event.timestamp = self.clock.now_millis();
                warn!(event_id = %event.id, "replay buffer lock poisoned; event not buffered");
            }
        }
        event
    }

    /// Lowest stamp the next recorded event can get
    pub fn watermark(&self) -> i64 {
        let now = self.clock.now_millis();
        self.log.read().map(|log| now.max(log.watermark)).unwrap_or(now)
    }

    fn cutoff(&self) -> i64 {
        self.clock.now_millis() - millis(self.config.retention)
    }

    /// Events after `since` visible to this user, oldest first
    pub fn get_events_for_user(
        &self,
        user_id: &str,
        since: i64,
        role: Option<&str>,
    ) -> Vec<StoredEvent> {
        let cutoff = self.cutoff();
        self.log
            .read()
            .map(|log| {
                log.events
                    .iter()
                    .filter(|e| e.timestamp > since && e.timestamp >= cutoff)
                    .filter(|e| e.target().matches(user_id, role))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop events past the retention window; returns how many
    pub fn evict_expired(&self) -> usize {
        let cutoff = self.cutoff();
        let Ok(mut log) = self.log.write() else {
            return 0;
        };
        let before = log.events.len();
        // Stamps are monotonic so expired events sit at the front
        while log.events.front().is_some_and(|e| e.timestamp < cutoff) {
            log.events.pop_front();
        }
        before - log.events.len()
    }

    pub fn len(&self) -> usize {
        self.log.read().map(|log| log.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    fn buffer(capacity: usize) -> (ReplayBuffer, Arc<ManualClock>) {
        let clock = ManualClock::new(10_000);
        let config = ReplayConfig {
            capacity,
            retention: Duration::from_secs(60),
        };
        (ReplayBuffer::new(config, clock.clone()), clock)
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let (buffer, clock) = buffer(3);
        for i in 0..5 {
            clock.advance(Duration::from_millis(1));
            buffer.record("tick", json!(i), EventTarget::broadcast());
        }
        let events = buffer.get_events_for_user("u", 0, None);
        let values: Vec<_> = events.iter().map(|e| e.data.clone()).collect();
        assert_eq!(values, vec![json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn test_cursor_is_exclusive() {
        let (buffer, clock) = buffer(10);
        let first = buffer.record("a", json!(1), EventTarget::broadcast());
        clock.advance(Duration::from_millis(5));
        buffer.record("b", json!(2), EventTarget::broadcast());

        let after = buffer.get_events_for_user("u", first.timestamp, None);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].event_type, "b");
    }

    #[test]
    fn test_target_filters() {
        let (buffer, clock) = buffer(10);
        buffer.record("all", json!(null), EventTarget::broadcast());
        clock.advance(Duration::from_millis(1));
        buffer.record("mine", json!(null), EventTarget::users(["alice"]));
        clock.advance(Duration::from_millis(1));
        buffer.record("managers", json!(null), EventTarget::roles(["manager"]));

        let types = |user: &str, role: Option<&str>| -> Vec<String> {
            buffer
                .get_events_for_user(user, 0, role)
                .into_iter()
                .map(|e| e.event_type)
                .collect()
        };
        assert_eq!(types("alice", None), vec!["all", "mine"]);
        assert_eq!(types("bob", Some("manager")), vec!["all", "managers"]);
        assert_eq!(types("carol", Some("staff")), vec!["all"]);
    }

    #[test]
    fn test_empty_target_lists_are_broadcast() {
        let target = EventTarget {
            user_ids: Some(vec![]),
            roles: Some(vec![]),
        }
        .normalized();
        assert!(target.is_broadcast());
        assert!(target.matches("anyone", None));
    }

    #[test]
    fn test_age_eviction() {
        let (buffer, clock) = buffer(10);
        buffer.record("old", json!(null), EventTarget::broadcast());
        clock.advance(Duration::from_secs(30));
        buffer.record("new", json!(null), EventTarget::broadcast());

        clock.advance(Duration::from_secs(31));
        assert_eq!(buffer.get_events_for_user("u", 0, None).len(), 1);
        assert_eq!(buffer.evict_expired(), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_stamps_never_go_backwards() {
        let (buffer, clock) = buffer(10);
        let first = buffer.record("a", json!(1), EventTarget::broadcast());
        clock.set(9_000);
        let second = buffer.record("b", json!(2), EventTarget::broadcast());

        assert_eq!(second.timestamp, first.timestamp);
        assert_eq!(buffer.watermark(), first.timestamp);
        let types: Vec<String> = buffer
            .get_events_for_user("u", 0, None)
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec!["a", "b"]);
    }

    #[test]
    fn test_watermark_survives_eviction() {
        let (buffer, clock) = buffer(10);
        clock.advance(Duration::from_secs(5));
        let old = buffer.record("old", json!(null), EventTarget::broadcast());
        clock.advance(Duration::from_secs(120));
        assert_eq!(buffer.evict_expired(), 1);

        clock.set(old.timestamp - 1);
        let late = buffer.record("late", json!(null), EventTarget::broadcast());
        assert_eq!(late.timestamp, old.timestamp);
    }

    #[test]
    fn test_concurrent_records_stay_in_stamp_order() {
        let (buffer, clock) = buffer(1_000);
        let buffer = Arc::new(buffer);
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let buffer = Arc::clone(&buffer);
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        clock.advance(Duration::from_millis(1));
                        buffer.record("tick", json!([w, i]), EventTarget::broadcast());
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let stamps: Vec<i64> = buffer
            .get_events_for_user("u", 0, None)
            .into_iter()
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(stamps.len(), 400);
        assert!(stamps.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}

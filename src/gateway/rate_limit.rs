//! # Rate Limiter
//!
//! Fixed-window counters in the shared store, one per
//! `(limit type, scope)`. The first request of a window creates the counter
//! with a TTL equal to the window; the `(max + 1)`-th request is rejected
//! without touching the count.
//!
//! A rejected key is remembered locally until its window ends so a client
//! hammering a closed window does not hit the store on every request. When
//! the store is unreachable the limiter allows the request.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::errors::{GatewayError, GatewayResult};
use crate::clock::{millis, SharedClock};
use crate::store::SharedStore;

/// Which budget a request draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    Poll,
    Stream,
    Publish,
    Api,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Poll => "poll",
            LimitType::Stream => "stream",
            LimitType::Publish => "publish",
            LimitType::Api => "api",
        }
    }
}

/// Who is being limited
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LimitScope {
    User(String),
    Ip(String),
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitScope::User(id) => write!(f, "user:{}", id),
            LimitScope::Ip(addr) => write!(f, "ip:{}", addr),
        }
    }
}

/// One budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u64,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// Budgets per limit type
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub poll: RateLimit,
    pub stream: RateLimit,
    pub publish: RateLimit,
    pub api: RateLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            poll: RateLimit::new(60, Duration::from_secs(60)),
            stream: RateLimit::new(10, Duration::from_secs(60)),
            publish: RateLimit::new(100, Duration::from_secs(60)),
            api: RateLimit::new(300, Duration::from_secs(60)),
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, limit_type: LimitType) -> RateLimit {
        match limit_type {
            LimitType::Poll => self.poll,
            LimitType::Stream => self.stream,
            LimitType::Publish => self.publish,
            LimitType::Api => self.api,
        }
    }
}

/// Outcome of a check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u64 },
    Throttled { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

/// Store-backed fixed-window limiter
#[derive(Debug)]
pub struct RateLimiter {
    store: SharedStore,
    clock: SharedClock,
    config: RateLimitConfig,
    /// key -> epoch ms when its window closes
    blocked: Mutex<HashMap<String, i64>>,
}

impl RateLimiter {
    pub fn new(store: SharedStore, clock: SharedClock, config: RateLimitConfig) -> Self {
        Self {
            store,
            clock,
            config,
            blocked: Mutex::new(HashMap::new()),
        }
    }

    fn key(scope: &LimitScope, limit_type: LimitType) -> String {
        format!("ratelimit:{}:{}", limit_type.as_str(), scope)
    }

    fn locally_blocked(&self, key: &str, now: i64) -> Option<Duration> {
        let mut blocked = self.blocked.lock().ok()?;
        match blocked.get(key) {
            Some(&until) if until > now => Some(Duration::from_millis((until - now) as u64)),
            Some(_) => {
                blocked.remove(key);
                None
            }
            None => None,
        }
    }

    fn block(&self, key: String, until: i64, now: i64) {
        if let Ok(mut blocked) = self.blocked.lock() {
            blocked.retain(|_, &mut u| u > now);
            blocked.insert(key, until);
        }
    }

    /// Count one request against the budget
    pub async fn check(&self, scope: &LimitScope, limit_type: LimitType) -> RateLimitDecision {
        let limit = self.config.limit_for(limit_type);
        let key = Self::key(scope, limit_type);
        let now = self.clock.now_millis();

        if let Some(retry_after) = self.locally_blocked(&key, now) {
            return RateLimitDecision::Throttled { retry_after };
        }

        match self.store.incr_below(&key, limit.max_requests, limit.window).await {
            Ok(Some(count)) => RateLimitDecision::Allowed {
                remaining: limit.max_requests.saturating_sub(count),
            },
            Ok(None) => {
                let remaining_ms = match self.store.ttl_millis(&key).await {
                    Ok(Some(ttl)) if ttl > 0 => ttl,
                    _ => millis(limit.window),
                };
                self.block(key.clone(), now + remaining_ms, now);
                debug!(key = %key, retry_after_ms = remaining_ms, "request throttled");
                RateLimitDecision::Throttled {
                    retry_after: Duration::from_millis(remaining_ms as u64),
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "rate limiter store unavailable; allowing request");
                RateLimitDecision::Allowed {
                    remaining: limit.max_requests,
                }
            }
        }
    }

    /// [`check`](Self::check) as a `Result` for request handlers
    pub async fn enforce(&self, scope: &LimitScope, limit_type: LimitType) -> GatewayResult<()> {
        match self.check(scope, limit_type).await {
            RateLimitDecision::Allowed { .. } => Ok(()),
            RateLimitDecision::Throttled { retry_after } => Err(GatewayError::RateLimited {
                retry_after_ms: retry_after.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;

    fn limiter(max: u64) -> (RateLimiter, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = ManualClock::new(0);
        let store = MemoryStore::shared(clock.clone());
        let limit = RateLimit::new(max, Duration::from_secs(10));
        let config = RateLimitConfig {
            poll: limit,
            stream: limit,
            publish: limit,
            api: limit,
        };
        (RateLimiter::new(store.clone(), clock.clone(), config), store, clock)
    }

    #[tokio::test]
    async fn test_k_plus_one_rejected_then_window_resets() {
        let (limiter, store, clock) = limiter(3);
        let alice = LimitScope::User("alice".into());

        for _ in 0..3 {
            assert!(limiter.check(&alice, LimitType::Poll).await.is_allowed());
        }
        clock.advance(Duration::from_secs(4));
        assert_eq!(
            limiter.check(&alice, LimitType::Poll).await,
            RateLimitDecision::Throttled {
                retry_after: Duration::from_secs(6)
            }
        );
        assert_eq!(store.get_counter("ratelimit:poll:user:alice").await.unwrap(), 3);

        clock.advance(Duration::from_secs(6));
        assert_eq!(
            limiter.check(&alice, LimitType::Poll).await,
            RateLimitDecision::Allowed { remaining: 2 }
        );
    }

    #[tokio::test]
    async fn test_scopes_and_types_are_independent() {
        let (limiter, _, _) = limiter(1);
        let user = LimitScope::User("u".into());
        let ip = LimitScope::Ip("10.0.0.1".into());

        assert!(limiter.check(&user, LimitType::Poll).await.is_allowed());
        assert!(limiter.check(&user, LimitType::Publish).await.is_allowed());
        assert!(limiter.check(&ip, LimitType::Poll).await.is_allowed());
        assert!(!limiter.check(&user, LimitType::Poll).await.is_allowed());
    }

    #[tokio::test]
    async fn test_blocked_key_skips_store() {
        let (limiter, store, _) = limiter(1);
        let user = LimitScope::User("u".into());
        limiter.check(&user, LimitType::Api).await;
        assert!(!limiter.check(&user, LimitType::Api).await.is_allowed());

        // Served from the local cache even with the store down
        store.set_offline(true);
        assert!(!limiter.check(&user, LimitType::Api).await.is_allowed());
    }

    #[tokio::test]
    async fn test_fails_open_when_store_down() {
        let (limiter, store, _) = limiter(1);
        store.set_offline(true);
        let user = LimitScope::User("u".into());
        for _ in 0..5 {
            assert!(limiter.enforce(&user, LimitType::Stream).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_enforce_reports_retry_after() {
        let (limiter, _, _) = limiter(1);
        let ip = LimitScope::Ip("1.2.3.4".into());
        limiter.enforce(&ip, LimitType::Publish).await.unwrap();
        match limiter.enforce(&ip, LimitType::Publish).await {
            Err(GatewayError::RateLimited { retry_after_ms }) => assert_eq!(retry_after_ms, 10_000),
            other => panic!("expected throttling, got {:?}", other),
        }
    }
}

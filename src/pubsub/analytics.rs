//! # Broker Analytics
//!
//! Counters only; the error rate is derived on every read so it can never be
//! stale relative to the counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Broker-wide delivery counters
#[derive(Debug, Default)]
pub struct Analytics {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    malformed: AtomicU64,
}

impl Analytics {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// A payload from the store that could not be decoded
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_subscriptions: usize) -> AnalyticsSnapshot {
        let published = self.published.load(Ordering::Relaxed);
        let delivered = self.delivered.load(Ordering::Relaxed);
        let dropped = self.dropped.load(Ordering::Relaxed);
        AnalyticsSnapshot {
            published,
            delivered,
            dropped,
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            active_subscriptions,
            error_rate: error_rate(dropped, published, delivered),
        }
    }
}

/// `dropped / (published + delivered)`, 0 when nothing happened yet
pub fn error_rate(dropped: u64, published: u64, delivered: u64) -> f64 {
    let denominator = published + delivered;
    if denominator == 0 {
        0.0
    } else {
        dropped as f64 / denominator as f64
    }
}

/// Point-in-time analytics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub malformed: u64,
    pub active_subscriptions: usize,
    pub error_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rate_recomputed_on_read() {
        let analytics = Analytics::default();
        assert_eq!(analytics.snapshot(0).error_rate, 0.0);

        analytics.record_published();
        analytics.record_published();
        analytics.record_delivered();
        analytics.record_dropped(1);
        assert!((analytics.snapshot(0).error_rate - 1.0 / 3.0).abs() < f64::EPSILON);

        analytics.record_delivered();
        assert!((analytics.snapshot(0).error_rate - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_malformed_counts_as_dropped() {
        let analytics = Analytics::default();
        analytics.record_malformed();
        let snapshot = analytics.snapshot(2);
        assert_eq!(snapshot.malformed, 1);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.active_subscriptions, 2);
    }
}

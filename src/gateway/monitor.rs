//! # Connection Monitor
//!
//! Per-process counters for the delivery gateway:
//! - connections: total opened, currently active, peak active
//! - events: sent, received, errors by class
//! - a rolling latency sample, oldest dropped past the cap
//!
//! Percentiles are computed by sorting the sample on read.
//!
//! Each process publishes its snapshot under `monitor:instance:<id>` with a
//! TTL. The snapshots can be summed for a cluster view, but the monitor is
//! not a shared connection registry: a client connected to another process
//! is only reachable through the broker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::SharedClock;
use crate::store::{SharedStore, StoreResult};

/// Store key prefix of instance snapshots
pub const INSTANCE_KEY_PREFIX: &str = "monitor:instance:";

/// Error classes tracked separately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Connection,
    Message,
    Timeout,
}

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Key under which this process publishes
    pub instance_id: String,
    /// Latency samples kept
    pub latency_sample_size: usize,
    /// Lifetime of a published snapshot
    pub snapshot_ttl: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            latency_sample_size: 1000,
            snapshot_ttl: Duration::from_secs(60),
        }
    }
}

/// Gateway metrics
#[derive(Debug)]
pub struct ConnectionMonitor {
    config: MonitorConfig,
    clock: SharedClock,
    started_at: i64,

    total_connections: AtomicU64,
    active_connections: AtomicU64,
    peak_connections: AtomicU64,

    events_sent: AtomicU64,
    events_received: AtomicU64,
    connection_errors: AtomicU64,
    message_errors: AtomicU64,
    timeout_errors: AtomicU64,

    latencies: Mutex<VecDeque<u64>>,
}

impl ConnectionMonitor {
    pub fn new(config: MonitorConfig, clock: SharedClock) -> Self {
        let started_at = clock.now_millis();
        let capacity = config.latency_sample_size;
        Self {
            config,
            clock,
            started_at,
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            peak_connections: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            message_errors: AtomicU64::new(0),
            timeout_errors: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    // Connections

    pub fn record_connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        let active = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_connections.fetch_max(active, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        // Saturating so a stray double close cannot wrap the gauge
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    // Events

    /// A frame was written; `latency_ms` is time since the event was created
    pub fn record_sent(&self, latency_ms: Option<u64>) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = latency_ms {
            self.record_latency(latency);
        }
    }

    pub fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, class: ErrorClass) {
        let counter = match class {
            ErrorClass::Connection => &self.connection_errors,
            ErrorClass::Message => &self.message_errors,
            ErrorClass::Timeout => &self.timeout_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency_ms: u64) {
        if let Ok(mut sample) = self.latencies.lock() {
            sample.push_back(latency_ms);
            while sample.len() > self.config.latency_sample_size {
                sample.pop_front();
            }
        }
    }

    fn latency_stats(&self) -> LatencyStats {
        let mut sorted: Vec<u64> = self
            .latencies
            .lock()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        sorted.sort_unstable();

        let average_ms = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
        };
        LatencyStats {
            samples: sorted.len(),
            average_ms,
            p95_ms: percentile(&sorted, 95),
            p99_ms: percentile(&sorted, 99),
        }
    }

    /// Current metrics
    pub fn snapshot(&self) -> MonitorSnapshot {
        let connection_errors = self.connection_errors.load(Ordering::Relaxed);
        let message_errors = self.message_errors.load(Ordering::Relaxed);
        let timeout_errors = self.timeout_errors.load(Ordering::Relaxed);
        let now = self.clock.now_millis();

        MonitorSnapshot {
            instance_id: self.config.instance_id.clone(),
            timestamp: now,
            uptime_ms: (now - self.started_at).max(0) as u64,
            connections: ConnectionCounts {
                total: self.total_connections.load(Ordering::Relaxed),
                active: self.active_connections.load(Ordering::Relaxed),
                peak: self.peak_connections.load(Ordering::Relaxed),
            },
            events: EventCounts {
                sent: self.events_sent.load(Ordering::Relaxed),
                received: self.events_received.load(Ordering::Relaxed),
                errors: connection_errors + message_errors + timeout_errors,
                connection_errors,
                message_errors,
                timeout_errors,
            },
            latency: self.latency_stats(),
        }
    }

    /// Write this process's snapshot to the store
    pub async fn publish_snapshot(&self, store: &SharedStore) -> StoreResult<()> {
        let snapshot = self.snapshot();
        let json = serde_json::to_string(&snapshot)?;
        store
            .set_ex(
                &format!("{}{}", INSTANCE_KEY_PREFIX, self.config.instance_id),
                json,
                self.config.snapshot_ttl,
            )
            .await
    }
}

/// Nearest-rank percentile of an ascending sample
pub fn percentile(sorted: &[u64], pct: u32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct as usize * sorted.len()).div_ceil(100);
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCounts {
    pub total: u64,
    pub active: u64,
    pub peak: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCounts {
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub connection_errors: u64,
    pub message_errors: u64,
    pub timeout_errors: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub samples: usize,
    pub average_ms: f64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// One process's metrics at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub instance_id: String,
    pub timestamp: i64,
    pub uptime_ms: u64,
    pub connections: ConnectionCounts,
    pub events: EventCounts,
    pub latency: LatencyStats,
}

/// Sum of all live instance snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStats {
    pub instances: Vec<String>,
    pub connections: ConnectionCounts,
    pub events: EventCounts,
    /// Worst p99 across instances
    pub max_p99_ms: u64,
}

/// Aggregate snapshots from every process sharing the store
pub async fn cluster_stats(store: &SharedStore) -> StoreResult<ClusterStats> {
    let mut snapshots = Vec::new();
    for key in store.keys(INSTANCE_KEY_PREFIX).await? {
        // A key can expire between listing and reading
        let Some(json) = store.get(&key).await? else {
            continue;
        };
        match serde_json::from_str::<MonitorSnapshot>(&json) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => warn!(key = %key, error = %e, "skipping malformed snapshot"),
        }
    }
    Ok(aggregate(&snapshots))
}

/// Sum counters over snapshots
pub fn aggregate(snapshots: &[MonitorSnapshot]) -> ClusterStats {
    let mut stats = ClusterStats::default();
    for s in snapshots {
        stats.instances.push(s.instance_id.clone());
        stats.connections.total += s.connections.total;
        stats.connections.active += s.connections.active;
        stats.connections.peak += s.connections.peak;
        stats.events.sent += s.events.sent;
        stats.events.received += s.events.received;
        stats.events.errors += s.events.errors;
        stats.events.connection_errors += s.events.connection_errors;
        stats.events.message_errors += s.events.message_errors;
        stats.events.timeout_errors += s.events.timeout_errors;
        stats.max_p99_ms = stats.max_p99_ms.max(s.latency.p99_ms);
    }
    stats.instances.sort();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn monitor(instance: &str, samples: usize) -> (ConnectionMonitor, Arc<ManualClock>) {
        let clock = ManualClock::new(0);
        let config = MonitorConfig {
            instance_id: instance.to_string(),
            latency_sample_size: samples,
            snapshot_ttl: Duration::from_secs(30),
        };
        (ConnectionMonitor::new(config, clock.clone()), clock)
    }

    #[test]
    fn test_connection_counts_and_peak() {
        let (monitor, _) = monitor("a", 10);
        monitor.record_connection_opened();
        monitor.record_connection_opened();
        monitor.record_connection_closed();
        monitor.record_connection_opened();
        monitor.record_connection_closed();
        monitor.record_connection_closed();
        monitor.record_connection_closed();

        let counts = monitor.snapshot().connections;
        assert_eq!(counts.total, 3);
        assert_eq!(counts.active, 0);
        assert_eq!(counts.peak, 2);
    }

    #[test]
    fn test_error_classes() {
        let (monitor, _) = monitor("a", 10);
        monitor.record_error(ErrorClass::Message);
        monitor.record_error(ErrorClass::Message);
        monitor.record_error(ErrorClass::Timeout);

        let events = monitor.snapshot().events;
        assert_eq!(events.errors, 3);
        assert_eq!(events.message_errors, 2);
        assert_eq!(events.timeout_errors, 1);
        assert_eq!(events.connection_errors, 0);
    }

    #[test]
    fn test_latency_sample_is_capped() {
        let (monitor, _) = monitor("a", 100);
        for latency in 1..=200 {
            monitor.record_sent(Some(latency));
        }
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.events.sent, 200);
        assert_eq!(snapshot.latency.samples, 100);
        // Only 101..=200 remain
        assert_eq!(snapshot.latency.p95_ms, 195);
        assert_eq!(snapshot.latency.p99_ms, 199);
    }

    #[test]
    fn test_percentile_edges() {
        assert_eq!(percentile(&[], 99), 0);
        assert_eq!(percentile(&[7], 95), 7);
        assert_eq!(percentile(&[1, 2, 3, 4], 50), 2);
    }

    #[tokio::test]
    async fn test_snapshots_aggregate_across_instances() {
        let clock = ManualClock::new(0);
        let store: SharedStore = MemoryStore::shared(clock.clone());

        let (a, _) = monitor("a", 10);
        let (b, _) = monitor("b", 10);
        a.record_connection_opened();
        b.record_connection_opened();
        b.record_connection_opened();
        b.record_sent(Some(40));
        a.publish_snapshot(&store).await.unwrap();
        b.publish_snapshot(&store).await.unwrap();

        let stats = cluster_stats(&store).await.unwrap();
        assert_eq!(stats.instances, vec!["a", "b"]);
        assert_eq!(stats.connections.active, 3);
        assert_eq!(stats.events.sent, 1);
        assert_eq!(stats.max_p99_ms, 40);

        clock.advance(Duration::from_secs(31));
        assert!(cluster_stats(&store).await.unwrap().instances.is_empty());
    }
}

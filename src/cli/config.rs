//! Configuration file
//!
//! One JSON document with a section per service. Every field has a default,
//! so `{}` is a valid config. Durations are whole seconds or milliseconds
//! as the field name says.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{CliError, CliResult};
use crate::gateway::{
    GatewayConfig, MonitorConfig, RateLimit, RateLimitConfig, ReplayConfig,
    DEFAULT_BRIDGE_PATTERN,
};
use crate::http_server::HttpServerConfig;
use crate::pubsub::PubSubConfig;
use crate::queue::QueueConfig;
use crate::store::DEFAULT_CHANNEL_CAPACITY;
use crate::subsystems::SubsystemsConfig;

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: HttpServerConfig,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub pubsub: PubSubSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Channel messages kept for a lagging subscriber before the oldest
    /// are dropped
    pub channel_capacity: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Queue registered at startup
    pub name: Option<String>,
    pub default_visibility_timeout_secs: u64,
    pub max_delay_secs: u32,
    pub cleanup_interval_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            name: None,
            default_visibility_timeout_secs: 30,
            max_delay_secs: 900,
            cleanup_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubSection {
    pub batch_flush_interval_ms: u64,
    pub history_limit: usize,
    pub retry_base_delay_ms: u64,
    pub default_max_retries: u32,
    /// Broker pattern delivered by the gateway; null disables the bridge
    pub bridge_pattern: Option<String>,
}

impl Default for PubSubSection {
    fn default() -> Self {
        Self {
            batch_flush_interval_ms: 100,
            history_limit: 1000,
            retry_base_delay_ms: 1000,
            default_max_retries: 0,
            bridge_pattern: Some(DEFAULT_BRIDGE_PATTERN.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub channel_capacity: usize,
    pub inactivity_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub replay: ReplaySection,
    pub rate_limits: RateLimitsSection,
    pub monitor: MonitorSection,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            inactivity_timeout_secs: 300,
            sweep_interval_secs: 60,
            heartbeat_interval_secs: 30,
            replay: ReplaySection::default(),
            rate_limits: RateLimitsSection::default(),
            monitor: MonitorSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySection {
    pub capacity: usize,
    pub retention_secs: u64,
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            capacity: 1000,
            retention_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitSection {
    pub max_requests: u64,
    pub window_secs: u64,
}

impl LimitSection {
    fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    fn to_limit(self) -> RateLimit {
        RateLimit::new(self.max_requests, Duration::from_secs(self.window_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsSection {
    pub poll: LimitSection,
    pub stream: LimitSection,
    pub publish: LimitSection,
    pub api: LimitSection,
}

impl Default for RateLimitsSection {
    fn default() -> Self {
        Self {
            poll: LimitSection::new(60, 60),
            stream: LimitSection::new(10, 60),
            publish: LimitSection::new(100, 60),
            api: LimitSection::new(300, 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    /// Generated per start when absent
    pub instance_id: Option<String>,
    pub latency_sample_size: usize,
    pub snapshot_interval_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            instance_id: None,
            latency_sample_size: 1000,
            snapshot_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter; `RUST_LOG` wins when set
    pub level: String,
    /// One JSON object per line instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read config: {}", e)))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| CliError::config_error(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Reject zero durations and capacities
    pub fn validate(&self) -> CliResult<()> {
        self.server
            .bind_addr()
            .map_err(|e| CliError::config_error(format!("Invalid server address: {}", e)))?;

        let checks: [(&str, u64); 13] = [
            ("queue.default_visibility_timeout_secs", self.queue.default_visibility_timeout_secs),
            ("queue.cleanup_interval_secs", self.queue.cleanup_interval_secs),
            ("pubsub.batch_flush_interval_ms", self.pubsub.batch_flush_interval_ms),
            ("pubsub.history_limit", self.pubsub.history_limit as u64),
            ("pubsub.retry_base_delay_ms", self.pubsub.retry_base_delay_ms),
            ("gateway.channel_capacity", self.gateway.channel_capacity as u64),
            ("gateway.inactivity_timeout_secs", self.gateway.inactivity_timeout_secs),
            ("gateway.sweep_interval_secs", self.gateway.sweep_interval_secs),
            ("gateway.heartbeat_interval_secs", self.gateway.heartbeat_interval_secs),
            ("gateway.replay.capacity", self.gateway.replay.capacity as u64),
            ("gateway.replay.retention_secs", self.gateway.replay.retention_secs),
            ("gateway.monitor.snapshot_interval_secs", self.gateway.monitor.snapshot_interval_secs),
            ("store.channel_capacity", self.store.channel_capacity as u64),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(CliError::config_error(format!("{} must be > 0", field)));
            }
        }
        if self.gateway.monitor.latency_sample_size == 0 {
            return Err(CliError::config_error(
                "gateway.monitor.latency_sample_size must be > 0",
            ));
        }

        let limits = &self.gateway.rate_limits;
        for (name, limit) in [
            ("poll", limits.poll),
            ("stream", limits.stream),
            ("publish", limits.publish),
            ("api", limits.api),
        ] {
            if limit.max_requests == 0 || limit.window_secs == 0 {
                return Err(CliError::config_error(format!(
                    "gateway.rate_limits.{} needs max_requests and window_secs > 0",
                    name
                )));
            }
        }

        if let Some(name) = &self.queue.name {
            crate::queue::queue_name_from_url(name)
                .map_err(|e| CliError::config_error(format!("queue.name: {}", e)))?;
        }
        if let Some(pattern) = &self.pubsub.bridge_pattern {
            if pattern.trim().is_empty() {
                return Err(CliError::config_error("pubsub.bridge_pattern must not be empty"));
            }
        }
        Ok(())
    }

    /// Runtime settings for [`Subsystems`](crate::subsystems::Subsystems)
    pub fn subsystems_config(&self) -> SubsystemsConfig {
        let gateway = &self.gateway;
        let monitor_defaults = MonitorConfig::default();
        let snapshot_interval = Duration::from_secs(gateway.monitor.snapshot_interval_secs);

        SubsystemsConfig {
            queue: QueueConfig {
                default_visibility_timeout: Duration::from_secs(
                    self.queue.default_visibility_timeout_secs,
                ),
                max_delay_seconds: self.queue.max_delay_secs,
                ..QueueConfig::default()
            },
            default_queue: self.queue.name.clone(),
            cleanup_interval: Duration::from_secs(self.queue.cleanup_interval_secs),
            pubsub: PubSubConfig {
                batch_flush_interval: Duration::from_millis(self.pubsub.batch_flush_interval_ms),
                history_limit: self.pubsub.history_limit,
                retry_base_delay: Duration::from_millis(self.pubsub.retry_base_delay_ms),
                default_max_retries: self.pubsub.default_max_retries,
            },
            bridge_pattern: self.pubsub.bridge_pattern.clone(),
            gateway: GatewayConfig {
                channel_capacity: gateway.channel_capacity,
                inactivity_timeout: Duration::from_secs(gateway.inactivity_timeout_secs),
                sweep_interval: Duration::from_secs(gateway.sweep_interval_secs),
                heartbeat_interval: Duration::from_secs(gateway.heartbeat_interval_secs),
                snapshot_interval,
                replay: ReplayConfig {
                    capacity: gateway.replay.capacity,
                    retention: Duration::from_secs(gateway.replay.retention_secs),
                },
                rate_limits: RateLimitConfig {
                    poll: gateway.rate_limits.poll.to_limit(),
                    stream: gateway.rate_limits.stream.to_limit(),
                    publish: gateway.rate_limits.publish.to_limit(),
                    api: gateway.rate_limits.api.to_limit(),
                },
                monitor: MonitorConfig {
                    instance_id: gateway
                        .monitor
                        .instance_id
                        .clone()
                        .unwrap_or(monitor_defaults.instance_id),
                    latency_sample_size: gateway.monitor.latency_sample_size,
                    // Outlive a few missed publishes
                    snapshot_ttl: snapshot_interval * 4,
                },
            },
        }
    }
}

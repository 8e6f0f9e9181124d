//! # Delivery Gateway
//!
//! Server side of event delivery to browser clients:
//! - push streams with a per-process connection registry
//! - a bounded replay buffer backing the pull transport
//! - store-backed fixed-window rate limiting
//! - connection and latency monitoring
//! - the broker bridge that carries events between processes
//!
//! ## Deployment constraint
//!
//! Connections, the limiter's local cache and the monitor counters belong
//! to one process. Only the monitor snapshot is shared (through the store),
//! and only events sent through the broker reach other processes' clients.

mod bridge;
mod connection;
mod delivery;
mod errors;
mod frame;
mod monitor;
mod notifier;
mod rate_limit;
mod replay;
mod tasks;

pub use bridge::{
    attach_bridge, event_channel, publish_event, BridgedEvent, DEFAULT_BRIDGE_PATTERN,
    EVENT_CHANNEL_PREFIX,
};
pub use connection::{ConnectRequest, Connection, ConnectionInfo, SendHandle};
pub use delivery::{
    ConnectionGuard, DeliveryGateway, DeliveryReport, GatewayConfig, PollResponse, PolledEvent,
};
pub use errors::{GatewayError, GatewayResult};
pub use frame::{
    format_frame, FrameDecoder, GatewayEvent, CONNECTED_EVENT, EVENT_STREAM_CONTENT_TYPE,
    HEARTBEAT_EVENT,
};
pub use monitor::{
    aggregate, cluster_stats, percentile, ClusterStats, ConnectionCounts, ConnectionMonitor,
    ErrorClass, EventCounts, LatencyStats, MonitorConfig, MonitorSnapshot, INSTANCE_KEY_PREFIX,
};
pub use notifier::{
    DispatchReport, NotificationDispatcher, NotificationEvent, NotificationSink, RecipientResolver,
};
pub use rate_limit::{
    LimitScope, LimitType, RateLimit, RateLimitConfig, RateLimitDecision, RateLimiter,
};
pub use replay::{EventTarget, ReplayBuffer, ReplayConfig, StoredEvent};
pub use tasks::spawn_gateway_tasks;

//! # Delivery Gateway
//!
//! Registry of live push connections plus the paths that put frames on
//! them. Every delivered event is also written to the replay buffer so a
//! client without a live stream can pick it up by polling; a send count of
//! zero is therefore normal, not an error.
//!
//! The registry is per process. An event only reaches clients on other
//! processes when it travels through the broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{ConnectRequest, Connection, ConnectionInfo, SendHandle};
use super::errors::{GatewayError, GatewayResult};
use super::frame::{format_frame, GatewayEvent, CONNECTED_EVENT, HEARTBEAT_EVENT};
use super::monitor::{ConnectionMonitor, ErrorClass, MonitorConfig};
use super::rate_limit::RateLimitConfig;
use super::replay::{EventTarget, ReplayBuffer, ReplayConfig, StoredEvent};
use crate::clock::{millis, SharedClock};

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Frames buffered per connection before sends start failing
    pub channel_capacity: usize,
    /// Idle time after which the sweep drops a connection
    pub inactivity_timeout: Duration,
    /// How often the inactivity sweep runs
    pub sweep_interval: Duration,
    /// How often heartbeat frames go out
    pub heartbeat_interval: Duration,
    /// How often the monitor snapshot is published
    pub snapshot_interval: Duration,
    pub replay: ReplayConfig,
    pub rate_limits: RateLimitConfig,
    pub monitor: MonitorConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            inactivity_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            snapshot_interval: Duration::from_secs(15),
            replay: ReplayConfig::default(),
            rate_limits: RateLimitConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Removes its connection when dropped
#[derive(Debug)]
pub struct ConnectionGuard {
    client_id: String,
    gateway: Weak<DeliveryGateway>,
}

impl ConnectionGuard {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(gateway) = self.gateway.upgrade() {
            gateway.remove_client(&self.client_id);
        }
    }
}

/// Result of [`DeliveryGateway::deliver`]
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub event: StoredEvent,
    /// Live connections written to
    pub sent: usize,
}

/// One event in a poll response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolledEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: i64,
}

/// Pull transport response; `timestamp` is the next cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub events: Vec<PolledEvent>,
    pub timestamp: i64,
}

/// Push delivery and pull fallback for connected clients
#[derive(Debug)]
pub struct DeliveryGateway {
    config: GatewayConfig,
    clock: SharedClock,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    monitor: ConnectionMonitor,
    replay: ReplayBuffer,
    /// Held across buffering and pushing an event, and across a heartbeat,
    /// so a heartbeat's timestamp is never ahead of an event still to be
    /// pushed
    ordering: Mutex<()>,
}

impl DeliveryGateway {
    pub fn new(config: GatewayConfig, clock: SharedClock) -> Arc<Self> {
        let monitor = ConnectionMonitor::new(config.monitor.clone(), Arc::clone(&clock));
        let replay = ReplayBuffer::new(config.replay.clone(), Arc::clone(&clock));
        Arc::new(Self {
            config,
            clock,
            connections: RwLock::new(HashMap::new()),
            monitor,
            replay,
            ordering: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn replay(&self) -> &ReplayBuffer {
        &self.replay
    }

    // ==================
    // Connection lifecycle
    // ==================

    /// Register a client and send its `connected` frame.
    ///
    /// Dropping the returned guard removes the client, so the guard should
    /// live exactly as long as the stream it belongs to.
    pub fn handle_connection(
        self: &Arc<Self>,
        request: ConnectRequest,
        sender: SendHandle,
    ) -> GatewayResult<ConnectionGuard> {
        if request.user_id.is_empty() {
            return Err(GatewayError::InvalidEvent("userId is required".into()));
        }
        let client_id = Uuid::new_v4().to_string();
        let now = self.clock.now_millis();
        let connection = Arc::new(Connection::new(client_id.clone(), request, sender, now));

        self.connections
            .write()
            .map_err(|_| GatewayError::Internal("Lock poisoned".into()))?
            .insert(client_id.clone(), Arc::clone(&connection));
        self.monitor.record_connection_opened();
        let guard = ConnectionGuard {
            client_id: client_id.clone(),
            gateway: Arc::downgrade(self),
        };

        let hello = json!({
            "clientId": client_id,
            "userId": connection.user_id,
            "connectedAt": now,
        });
        if !self.send_frame(&connection, format_frame(CONNECTED_EVENT, &hello), None) {
            return Err(GatewayError::ConnectionClosed(client_id));
        }

        info!(client_id = %client_id, user_id = %connection.user_id, "client connected");
        Ok(guard)
    }

    /// Create the frame channel and register a client on it
    pub fn open_stream(
        self: &Arc<Self>,
        request: ConnectRequest,
    ) -> GatewayResult<(ConnectionGuard, mpsc::Receiver<String>)> {
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let guard = self.handle_connection(request, sender)?;
        Ok((guard, receiver))
    }

    /// Drop a client; false if it was already gone
    pub fn remove_client(&self, client_id: &str) -> bool {
        let removed = self
            .connections
            .write()
            .ok()
            .and_then(|mut connections| connections.remove(client_id));

        match removed {
            Some(connection) => {
                self.monitor.record_connection_closed();
                info!(client_id, user_id = %connection.user_id, "client disconnected");
                true
            }
            None => false,
        }
    }

    /// Drop every client, ending their streams
    pub fn close_all(&self) -> usize {
        let ids: Vec<String> = self.matching(|_| true).iter().map(|c| c.id.clone()).collect();
        ids.iter().filter(|id| self.remove_client(id)).count()
    }

    pub fn get_connection(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .ok()
            .and_then(|connections| connections.get(client_id).cloned())
    }

    pub fn connections_for_user(&self, user_id: &str) -> Vec<String> {
        self.matching(|c| c.user_id == user_id)
            .into_iter()
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.matching(|_| true).iter().map(|c| c.info()).collect()
    }

    /// Drop connections idle past the inactivity timeout or already closed
    pub fn cleanup_inactive_connections(&self) -> usize {
        let cutoff = self.clock.now_millis() - millis(self.config.inactivity_timeout);
        let stale: Vec<Arc<Connection>> =
            self.matching(|c| c.last_activity() < cutoff || c.is_closed());

        let mut removed = 0;
        for connection in stale {
            if !connection.is_closed() {
                self.monitor.record_error(ErrorClass::Timeout);
            }
            if self.remove_client(&connection.id) {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "inactive connections cleaned up");
        }
        removed
    }

    // ==================
    // Sending
    // ==================

    fn matching(&self, predicate: impl Fn(&Connection) -> bool) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .map(|connections| {
                connections
                    .values()
                    .filter(|c| predicate(c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Write one frame. Never panics; failures are counted and a closed
    /// connection is removed.
    fn send_frame(&self, connection: &Connection, frame: String, created_at: Option<i64>) -> bool {
        match connection.try_send(frame) {
            Ok(()) => {
                let now = self.clock.now_millis();
                connection.touch(now);
                self.monitor
                    .record_sent(created_at.map(|at| (now - at).max(0) as u64));
                true
            }
            Err(TrySendError::Full(_)) => {
                self.monitor.record_error(ErrorClass::Message);
                warn!(client_id = %connection.id, "client channel full; frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.monitor.record_error(ErrorClass::Message);
                debug!(client_id = %connection.id, "write to closed connection");
                self.remove_client(&connection.id);
                false
            }
        }
    }

    /// Push one event to one connection
    pub fn send_event(&self, connection: &Connection, event: &GatewayEvent) -> bool {
        self.send_frame(connection, event.to_frame(), None)
    }

    fn send_where(
        &self,
        event_type: &str,
        data: &Value,
        created_at: Option<i64>,
        predicate: impl Fn(&Connection) -> bool,
    ) -> usize {
        let frame = format_frame(event_type, data);
        self.matching(predicate)
            .iter()
            .filter(|c| self.send_frame(c, frame.clone(), created_at))
            .count()
    }

    /// Push to every connection of a user; 0 means the user must poll
    pub fn send_event_to_user(&self, user_id: &str, event_type: &str, data: Value) -> usize {
        self.send_where(event_type, &data, None, |c| c.user_id == user_id)
    }

    /// Push to every connection whose role matches
    pub fn send_event_to_role(&self, role: &str, event_type: &str, data: Value) -> usize {
        self.send_where(event_type, &data, None, |c| c.role.as_deref() == Some(role))
    }

    /// Push to every connection
    pub fn broadcast_event(&self, event_type: &str, data: Value) -> usize {
        self.send_where(event_type, &data, None, |_| true)
    }

    /// Keep-alive frame to every connection; successful writes count as
    /// activity
    ///
    /// The timestamp is the replay watermark: every event buffered before
    /// it has already been pushed, and every later one gets a stamp at or
    /// above it.
    pub fn heartbeat(&self) -> usize {
        let _ordering = self.ordering.lock();
        let data = json!({ "timestamp": self.replay.watermark() });
        self.send_where(HEARTBEAT_EVENT, &data, None, |_| true)
    }

    /// Buffer an event for replay and push it to the live connections it
    /// targets
    pub fn deliver(&self, event_type: &str, data: Value, target: EventTarget) -> DeliveryReport {
        let _ordering = self.ordering.lock();
        let event = self.replay.record(event_type, data, target);
        let target = event.target();
        let sent = self.send_where(&event.event_type, &event.data, Some(event.timestamp), |c| {
            target.matches(&c.user_id, c.role.as_deref())
        });
        debug!(event_id = %event.id, event_type = %event.event_type, sent, "event delivered");
        DeliveryReport { event, sent }
    }

    // ==================
    // Pull transport
    // ==================

    /// Buffered events after `since` for this user. The response timestamp
    /// is the newest returned event's, or `since` when there is none.
    pub fn poll(&self, user_id: &str, since: i64, role: Option<&str>) -> PollResponse {
        self.monitor.record_received();
        let events: Vec<PolledEvent> = self
            .replay
            .get_events_for_user(user_id, since, role)
            .into_iter()
            .map(|e| PolledEvent {
                id: e.id,
                event_type: e.event_type,
                data: e.data,
                timestamp: e.timestamp,
            })
            .collect();
        let timestamp = events.iter().map(|e| e.timestamp).max().unwrap_or(since);
        PollResponse { events, timestamp }
    }
}

//! # Connections
//!
//! A connection is one open push stream. The gateway holds the sending half
//! of a bounded channel; whoever serves the stream holds the receiving half
//! and writes frames to the client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Sending half of a connection's outbound frame channel
pub type SendHandle = mpsc::Sender<String>;

/// What a client presents when it opens a stream
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub user_id: String,
    #[serde(default)]
    pub role: Option<String>,
    /// Peer address, used for per-IP limits
    #[serde(skip)]
    pub remote_addr: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ConnectRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// A live push connection
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub role: Option<String>,
    pub connected_at: i64,
    pub metadata: HashMap<String, String>,
    last_activity: AtomicI64,
    sender: SendHandle,
}

impl Connection {
    pub(crate) fn new(id: String, request: ConnectRequest, sender: SendHandle, now: i64) -> Self {
        Self {
            id,
            user_id: request.user_id,
            role: request.role,
            connected_at: now,
            metadata: request.metadata,
            last_activity: AtomicI64::new(now),
            sender,
        }
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, now: i64) {
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }

    /// Queue a frame without waiting
    pub(crate) fn try_send(&self, frame: String) -> Result<(), TrySendError<String>> {
        self.sender.try_send(frame)
    }

    /// The stream side has gone away
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            client_id: self.id.clone(),
            user_id: self.user_id.clone(),
            role: self.role.clone(),
            connected_at: self.connected_at,
            last_activity: self.last_activity(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Serializable view of a connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub client_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub connected_at: i64,
    pub last_activity: i64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

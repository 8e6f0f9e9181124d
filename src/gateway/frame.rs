//! # Push Frames
//!
//! Wire format of the push transport (`text/event-stream`):
//!
//! ```text
//! event: <type>
//! data: <json>
//!
//! ```
//!
//! One frame per event. JSON is written compactly so `data` never spans
//! lines.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Content type of the push transport
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Event type of the first frame on every connection
pub const CONNECTED_EVENT: &str = "connected";

/// Event type of keep-alive frames
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// An event as pushed to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

impl GatewayEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    /// Render as one push frame
    pub fn to_frame(&self) -> String {
        format_frame(&self.event_type, &self.data)
    }
}

/// Render one push frame. Line breaks in the type would end the field
/// early, so they are replaced.
pub fn format_frame(event_type: &str, data: &Value) -> String {
    let event_type: String = event_type
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    format!("event: {}\ndata: {}\n\n", event_type, data)
}

/// Incremental parser for a push stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every frame completed by it
    pub fn push(&mut self, chunk: &str) -> Vec<GatewayEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<GatewayEvent> {
    let mut event_type = None;
    let mut data = None;
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_type = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data = Some(rest.trim().to_string());
        }
    }

    let event_type = event_type.unwrap_or_else(|| "message".to_string());
    let data = data?;
    match serde_json::from_str(&data) {
        Ok(data) => Some(GatewayEvent { event_type, data }),
        Err(e) => {
            warn!(event_type = %event_type, error = %e, "dropping frame with malformed data");
            None
        }
    }
}

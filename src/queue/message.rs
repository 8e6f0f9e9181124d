//! # Queue Messages
//!
//! A message is stored as JSON in exactly one of three places: the delayed
//! sorted set, the ready list, or the in-flight sorted set. The serialized
//! form is the store member, so the same bytes move between states.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Typed message attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageAttributeValue {
    /// `String`, `Number` or `Binary`
    pub data_type: String,
    /// Value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
}

impl MessageAttributeValue {
    /// String attribute
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data_type: "String".to_string(),
            string_value: Some(value.into()),
        }
    }
}

/// User attributes by name
pub type MessageAttributes = BTreeMap<String, MessageAttributeValue>;

/// A message as sent by a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// Message id
    pub id: String,
    /// Opaque body
    pub body: String,
    /// User attributes
    #[serde(default)]
    pub attributes: MessageAttributes,
    /// Enqueue time (epoch ms)
    pub enqueued_at: i64,
    /// Requested delay
    #[serde(default)]
    pub delay_seconds: u32,
}

impl QueueMessage {
    /// Create a message with a fresh id
    pub fn new(body: String, attributes: MessageAttributes, delay_seconds: u32, now: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            body,
            attributes,
            enqueued_at: now,
            delay_seconds,
        }
    }
}

/// Message plus delivery bookkeeping, as stored in the ready list and the
/// delayed set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// The message
    pub message: QueueMessage,
    /// Times the message has been received
    #[serde(default)]
    pub receive_count: u32,
    /// First receive time (epoch ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_received_at: Option<i64>,
}

impl Envelope {
    /// Wrap a never-received message
    pub fn new(message: QueueMessage) -> Self {
        Self {
            message,
            receive_count: 0,
            first_received_at: None,
        }
    }
}

/// Envelope tagged with the receipt handle of its current receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightEntry {
    /// Receipt handle for this receive
    pub receipt_handle: String,
    /// The delivered envelope
    #[serde(flatten)]
    pub envelope: Envelope,
}

/// A message handed to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Message id
    pub message_id: String,
    /// Handle used to acknowledge or change visibility
    pub receipt_handle: String,
    /// Body
    pub body: String,
    /// System attributes
    pub attributes: HashMap<String, String>,
    /// User attributes
    pub message_attributes: MessageAttributes,
}

impl ReceivedMessage {
    pub(crate) fn from_entry(entry: &InFlightEntry) -> Self {
        let envelope = &entry.envelope;
        let mut attributes = HashMap::new();
        attributes.insert(
            "SentTimestamp".to_string(),
            envelope.message.enqueued_at.to_string(),
        );
        attributes.insert(
            "ApproximateReceiveCount".to_string(),
            envelope.receive_count.to_string(),
        );
        if let Some(first) = envelope.first_received_at {
            attributes.insert(
                "ApproximateFirstReceiveTimestamp".to_string(),
                first.to_string(),
            );
        }

        Self {
            message_id: envelope.message.id.clone(),
            receipt_handle: entry.receipt_handle.clone(),
            body: envelope.message.body.clone(),
            attributes,
            message_attributes: envelope.message.attributes.clone(),
        }
    }
}

/// Message counts per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Messages in the ready list
    pub ready: usize,
    /// Received, not yet deleted
    pub in_flight: usize,
    /// Waiting for their delay to pass
    pub delayed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_entry_flattens_envelope() {
        let message = QueueMessage::new("hello".into(), MessageAttributes::new(), 0, 10);
        let entry = InFlightEntry {
            receipt_handle: "rh-1".into(),
            envelope: Envelope {
                message,
                receive_count: 2,
                first_received_at: Some(20),
            },
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["receiptHandle"], "rh-1");
        assert_eq!(json["receiveCount"], 2);
        assert_eq!(json["message"]["body"], "hello");

        let back: InFlightEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_received_message_attributes() {
        let message = QueueMessage::new("b".into(), MessageAttributes::new(), 0, 99);
        let entry = InFlightEntry {
            receipt_handle: "rh".into(),
            envelope: Envelope {
                message,
                receive_count: 1,
                first_received_at: Some(100),
            },
        };

        let received = ReceivedMessage::from_entry(&entry);
        assert_eq!(received.attributes["SentTimestamp"], "99");
        assert_eq!(received.attributes["ApproximateReceiveCount"], "1");
        assert_eq!(received.attributes["ApproximateFirstReceiveTimestamp"], "100");
    }
}

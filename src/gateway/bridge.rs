//! # Broker Bridge
//!
//! Events published through the broker on `events:<type>` reach every
//! process's gateway: each gateway holds one pattern subscription and hands
//! what arrives to [`DeliveryGateway::deliver`]. This is the only path by
//! which an event published in one process is pushed to clients connected
//! to another.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::delivery::DeliveryGateway;
use super::replay::EventTarget;
use crate::store::StoreError;
use crate::pubsub::{
    handler, HandlerError, PubSubBroker, PubSubResult, PublishOptions, SubscribeOptions,
};

/// Channel prefix for gateway events
pub const EVENT_CHANNEL_PREFIX: &str = "events:";

/// Default bridge subscription pattern
pub const DEFAULT_BRIDGE_PATTERN: &str = "events:*";

/// Broker channel carrying one event type
pub fn event_channel(event_type: &str) -> String {
    format!("{}{}", EVENT_CHANNEL_PREFIX, event_type)
}

/// Payload of a bridged broker message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, flatten)]
    pub target: EventTarget,
}

/// Publish an event for delivery by every gateway
pub async fn publish_event(broker: &Arc<PubSubBroker>, event: BridgedEvent) -> PubSubResult<String> {
    let channel = event_channel(&event.event_type);
    let data = serde_json::to_value(&event).map_err(StoreError::from)?;
    broker.publish(&channel, data, PublishOptions::default()).await
}

/// Subscribe the gateway to bridged events; returns the subscription id
pub fn attach_bridge(
    broker: &PubSubBroker,
    gateway: Arc<DeliveryGateway>,
    pattern: &str,
) -> PubSubResult<String> {
    let deliver = handler(move |message| {
        let gateway = Arc::clone(&gateway);
        async move {
            let event: BridgedEvent = serde_json::from_value(message.data)
                .map_err(|e| HandlerError::new(format!("malformed bridged event: {}", e)))?;
            gateway.deliver(&event.event_type, event.data, event.target);
            Ok(())
        }
    });

    let id = broker.subscribe(pattern, deliver, SubscribeOptions::pattern(), None)?;
    info!(pattern, subscription_id = %id, "broker bridge attached");
    Ok(id)
}

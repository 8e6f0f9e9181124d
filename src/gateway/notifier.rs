//! # Notification Dispatch
//!
//! The only two calls made into the business data layer: who should
//! receive an event, and persisting one notification record per recipient.
//! Both are treated as opaque and fallible. Their errors are logged and
//! delivery carries on with what is known.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use super::delivery::DeliveryGateway;
use super::errors::GatewayResult;
use super::replay::EventTarget;

/// An application event that should become a user notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    /// Explicit target; used when no resolver answer is available
    #[serde(default, flatten)]
    pub target: EventTarget,
}

/// Resolves recipient user ids for an event
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    async fn resolve_recipients(&self, event: &NotificationEvent) -> GatewayResult<Vec<String>>;
}

/// Persists one notification record per recipient
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn persist(&self, user_id: &str, event: &NotificationEvent) -> GatewayResult<()>;
}

/// What one dispatch did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub recipients: usize,
    pub persisted: usize,
    /// Live connections written to
    pub pushed: usize,
}

/// Resolve, persist, buffer, push
pub struct NotificationDispatcher {
    gateway: Arc<DeliveryGateway>,
    resolver: Arc<dyn RecipientResolver>,
    sink: Arc<dyn NotificationSink>,
}

impl NotificationDispatcher {
    pub fn new(
        gateway: Arc<DeliveryGateway>,
        resolver: Arc<dyn RecipientResolver>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            gateway,
            resolver,
            sink,
        }
    }

    pub async fn dispatch(&self, event: NotificationEvent) -> DispatchReport {
        let recipients = match self.resolver.resolve_recipients(&event).await {
            Ok(recipients) => recipients,
            Err(e) => {
                error!(event_type = %event.event_type, error = %e, "recipient resolution failed");
                event.target.user_ids.clone().unwrap_or_default()
            }
        };

        let mut persisted = 0;
        for user_id in &recipients {
            match self.sink.persist(user_id, &event).await {
                Ok(()) => persisted += 1,
                Err(e) => warn!(
                    event_type = %event.event_type,
                    user_id = %user_id,
                    error = %e,
                    "failed to persist notification"
                ),
            }
        }

        let target = if recipients.is_empty() {
            event.target.clone()
        } else {
            EventTarget {
                user_ids: Some(recipients.clone()),
                roles: event.target.roles.clone(),
            }
        };
        let report = self.gateway.deliver(&event.event_type, event.data, target);

        info!(
            event_type = %report.event.event_type,
            recipients = recipients.len(),
            persisted,
            pushed = report.sent,
            "notification dispatched"
        );
        DispatchReport {
            recipients: recipients.len(),
            persisted,
            pushed: report.sent,
        }
    }
}

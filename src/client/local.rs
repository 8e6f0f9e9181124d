//! # In-Process Transports
//!
//! Push and pull transports that talk to a [`DeliveryGateway`] in the same
//! process. Used by embedded clients and tests; an HTTP client would
//! implement the same traits over the network.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::errors::ClientResult;
use super::hybrid::PushTransport;
use super::poller::PollTransport;
use crate::gateway::{
    ConnectRequest, DeliveryGateway, FrameDecoder, GatewayEvent, LimitScope, LimitType,
    PollResponse, RateLimiter,
};

/// Push over the gateway's frame channel
pub struct GatewayPushTransport {
    gateway: Arc<DeliveryGateway>,
    request: ConnectRequest,
}

impl GatewayPushTransport {
    pub fn new(gateway: Arc<DeliveryGateway>, request: ConnectRequest) -> Self {
        Self { gateway, request }
    }
}

#[async_trait]
impl PushTransport for GatewayPushTransport {
    async fn connect(&self) -> ClientResult<mpsc::Receiver<GatewayEvent>> {
        let (guard, mut frames) = self.gateway.open_stream(self.request.clone())?;
        let (tx, rx) = mpsc::channel(self.gateway.config().channel_capacity.max(1));

        tokio::spawn(async move {
            // The connection lives as long as this reader
            let mut decoder = FrameDecoder::new();
            while let Some(frame) = frames.recv().await {
                for event in decoder.push(&frame) {
                    if tx.send(event).await.is_err() {
                        debug!(client_id = %guard.client_id(), "push reader dropped");
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Pull over the gateway's replay buffer, optionally rate limited
pub struct GatewayPollTransport {
    gateway: Arc<DeliveryGateway>,
    user_id: String,
    role: Option<String>,
    limiter: Option<Arc<RateLimiter>>,
}

impl GatewayPollTransport {
    pub fn new(gateway: Arc<DeliveryGateway>, user_id: impl Into<String>) -> Self {
        Self {
            gateway,
            user_id: user_id.into(),
            role: None,
            limiter: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }
}

#[async_trait]
impl PollTransport for GatewayPollTransport {
    async fn poll(&self, since: i64) -> ClientResult<PollResponse> {
        if let Some(limiter) = &self.limiter {
            let scope = LimitScope::User(self.user_id.clone());
            limiter.enforce(&scope, LimitType::Poll).await?;
        }
        Ok(self.gateway.poll(&self.user_id, since, self.role.as_deref()))
    }
}

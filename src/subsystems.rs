//! # Subsystems
//!
//! Explicitly constructed services of one process. The entry point builds
//! them, starts their background work and shuts them down; HTTP handlers
//! receive them as router state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::gateway::{
    attach_bridge, spawn_gateway_tasks, DeliveryGateway, GatewayConfig, RateLimiter,
};
use crate::pubsub::{PubSubBroker, PubSubConfig, PubSubError};
use crate::queue::{spawn_sweeper, QueueClient, QueueConfig, QueueError};
use crate::store::SharedStore;

/// Errors while bringing services up
#[derive(Debug, Error)]
pub enum BootError {
    #[error("Queue setup failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Broker setup failed: {0}")]
    PubSub(#[from] PubSubError),
}

/// Runtime settings of every service
#[derive(Debug, Clone)]
pub struct SubsystemsConfig {
    pub queue: QueueConfig,
    /// Queue registered at startup so the sweeper covers it before traffic
    pub default_queue: Option<String>,
    pub cleanup_interval: Duration,
    pub pubsub: PubSubConfig,
    /// Broker pattern the gateway delivers from; `None` disables the bridge
    pub bridge_pattern: Option<String>,
    pub gateway: GatewayConfig,
}

impl Default for SubsystemsConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            default_queue: None,
            cleanup_interval: Duration::from_secs(1),
            pubsub: PubSubConfig::default(),
            bridge_pattern: Some(crate::gateway::DEFAULT_BRIDGE_PATTERN.to_string()),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Every service of the process
pub struct Subsystems {
    pub clock: SharedClock,
    pub store: SharedStore,
    pub queues: Arc<QueueClient>,
    pub broker: Arc<PubSubBroker>,
    pub gateway: Arc<DeliveryGateway>,
    pub limiter: Arc<RateLimiter>,
    cleanup_interval: Duration,
    bridge_id: Option<String>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Subsystems {
    /// Build every service over `store`. Must run inside a tokio runtime;
    /// periodic tasks wait for [`spawn_background`](Self::spawn_background).
    pub fn start(
        config: SubsystemsConfig,
        store: SharedStore,
        clock: SharedClock,
    ) -> Result<Self, BootError> {
        let queues = Arc::new(QueueClient::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.queue,
        ));
        if let Some(name) = &config.default_queue {
            queues.queue(name)?;
        }

        let broker = PubSubBroker::start(Arc::clone(&store), Arc::clone(&clock), config.pubsub);
        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.gateway.rate_limits.clone(),
        ));
        let gateway = DeliveryGateway::new(config.gateway, Arc::clone(&clock));

        let bridge_id = match &config.bridge_pattern {
            Some(pattern) => Some(attach_bridge(&broker, Arc::clone(&gateway), pattern)?),
            None => None,
        };

        let (shutdown, _) = broadcast::channel(1);
        info!(
            instance_id = %gateway.monitor().instance_id(),
            bridge = bridge_id.is_some(),
            "subsystems ready"
        );

        Ok(Self {
            clock,
            store,
            queues,
            broker,
            gateway,
            limiter,
            cleanup_interval: config.cleanup_interval,
            bridge_id,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the queue sweeper and the gateway maintenance tasks
    pub fn spawn_background(&self) {
        let mut handles = vec![spawn_sweeper(
            Arc::clone(&self.queues),
            self.cleanup_interval,
            self.shutdown.subscribe(),
        )];
        handles.extend(spawn_gateway_tasks(
            Arc::clone(&self.gateway),
            Arc::clone(&self.store),
            &self.shutdown,
        ));
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.extend(handles),
            Err(_) => warn!("task registry poisoned; background tasks will not be awaited"),
        }
    }

    pub fn bridge_id(&self) -> Option<&str> {
        self.bridge_id.as_deref()
    }

    /// Stop background tasks and flush the broker
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        if let Some(id) = &self.bridge_id {
            self.broker.unsubscribe(id);
        }
        self.broker.shutdown().await;

        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }
        info!("subsystems stopped");
    }
}

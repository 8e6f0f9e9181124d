//! # Gateway Background Tasks
//!
//! - inactivity sweep
//! - heartbeat frames
//! - replay-buffer age eviction
//! - monitor snapshot publishing
//!
//! Each runs on its own interval until the shutdown signal fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::delivery::DeliveryGateway;
use crate::store::SharedStore;

fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        debug!(task = name, interval_ms = interval.as_millis() as u64, "gateway task started");

        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                _ = shutdown.recv() => {
                    info!(task = name, "gateway task stopping");
                    break;
                }
            }
        }
    })
}

/// Start every gateway maintenance task
pub fn spawn_gateway_tasks(
    gateway: Arc<DeliveryGateway>,
    store: SharedStore,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let config = gateway.config().clone();
    let mut handles = Vec::with_capacity(4);

    let g = Arc::clone(&gateway);
    handles.push(spawn_periodic(
        "inactivity-sweep",
        config.sweep_interval,
        shutdown.subscribe(),
        move || {
            g.cleanup_inactive_connections();
            async {}
        },
    ));

    let g = Arc::clone(&gateway);
    handles.push(spawn_periodic(
        "heartbeat",
        config.heartbeat_interval,
        shutdown.subscribe(),
        move || {
            let sent = g.heartbeat();
            debug!(sent, "heartbeat sent");
            async {}
        },
    ));

    let g = Arc::clone(&gateway);
    handles.push(spawn_periodic(
        "replay-eviction",
        config.sweep_interval,
        shutdown.subscribe(),
        move || {
            let evicted = g.replay().evict_expired();
            if evicted > 0 {
                debug!(evicted, "replay events evicted");
            }
            async {}
        },
    ));

    let g = Arc::clone(&gateway);
    handles.push(spawn_periodic(
        "monitor-snapshot",
        config.snapshot_interval,
        shutdown.subscribe(),
        move || {
            let g = Arc::clone(&g);
            let store = Arc::clone(&store);
            async move {
                if let Err(e) = g.monitor().publish_snapshot(&store).await {
                    warn!(error = %e, "failed to publish monitor snapshot");
                }
            }
        },
    ));

    handles
}

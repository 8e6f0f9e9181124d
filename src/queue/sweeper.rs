//! # Visibility Sweeper
//!
//! Background task returning expired in-flight messages to ready on a fixed
//! interval. It runs whether or not anyone is calling `receive_message`,
//! which is what bounds redelivery latency for a crashed consumer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::api::QueueClient;

/// Spawn the sweeper; it stops when `shutdown` fires or its sender is dropped
pub fn spawn_sweeper(
    queues: Arc<QueueClient>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "queue sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match queues.cleanup_all().await {
                        Ok(report) => debug!(
                            promoted = report.promoted,
                            redelivered = report.redelivered,
                            "queue sweep complete"
                        ),
                        Err(e) => error!(error = %e, "queue sweep failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("queue sweeper stopping");
                    break;
                }
            }
        }
    })
}

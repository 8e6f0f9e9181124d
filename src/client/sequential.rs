//! # Sequential Execution
//!
//! Operations under the same key run one at a time in call order. Every
//! call runs; it just never overlaps a sibling. Ordering comes from
//! `tokio::sync::Mutex`, which grants the lock first-come first-served.
//!
//! Each call runs under a child of its lane's [`CancellationToken`], so
//! [`SequentialExecutor::cancel`] stops the running call and every queued
//! one behind it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use super::cancel::{cancellable, CancellationToken};
use super::errors::ClientResult;

#[derive(Debug, Default)]
struct Lane {
    turn: AsyncMutex<()>,
    token: CancellationToken,
}

/// Per-key FIFO execution
#[derive(Debug, Default)]
pub struct SequentialExecutor {
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
}

impl SequentialExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, key: &str) -> Option<Arc<Lane>> {
        let mut lanes = self.lanes.lock().ok()?;
        Some(Arc::clone(lanes.entry(key.to_string()).or_default()))
    }

    fn release(&self, key: &str, lane: Arc<Lane>) {
        if let Ok(mut lanes) = self.lanes.lock() {
            // Only the map and this caller still hold it: nobody is queued
            let current = lanes.get(key).is_some_and(|l| Arc::ptr_eq(l, &lane));
            if current && Arc::strong_count(&lane) == 2 {
                lanes.remove(key);
            }
        }
    }

    /// Run `operation` after every earlier call under `key` has finished
    pub async fn run<F, Fut, T>(&self, key: &str, operation: F) -> ClientResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let Some(lane) = self.lane(key) else {
            // Poisoned registry: run unordered rather than never
            let token = CancellationToken::new();
            return cancellable(&token, operation(token.clone())).await;
        };
        let token = lane.token.child_token();
        // Waiting for the turn is cancellable too
        let output = cancellable(&token, async {
            let _turn = lane.turn.lock().await;
            operation(token.clone()).await
        })
        .await;
        self.release(key, lane);
        output
    }

    /// Cancel the running and queued calls for `key`; false if there were none
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.lanes.lock().ok().and_then(|mut l| l.remove(key));
        match removed {
            Some(lane) => {
                lane.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Keys with a running or queued operation
    pub fn active_keys(&self) -> usize {
        self.lanes.lock().map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::errors::ClientError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_runs_in_call_order_without_overlap() {
        let executor = SequentialExecutor::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let call = |n: u64| {
            let log = Arc::clone(&log);
            executor.run("save", move |_| async move {
                log.lock().unwrap().push(format!("start {}", n));
                // Later calls finish faster; order must still hold
                tokio::time::sleep(Duration::from_millis(30 - n * 10)).await;
                log.lock().unwrap().push(format!("end {}", n));
                Ok(n)
            })
        };
        let (a, b, c) = tokio::join!(call(0), call(1), call(2));

        assert_eq!((a, b, c), (Ok(0), Ok(1), Ok(2)));
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
        );
        assert_eq!(executor.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_overlap() {
        let executor = SequentialExecutor::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let call = |key: &'static str, delay: u64| {
            let log = Arc::clone(&log);
            executor.run(key, move |_| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().unwrap().push(key);
                Ok(())
            })
        };
        let (slow, fast) = tokio::join!(call("slow", 40), call("fast", 5));

        assert!(slow.is_ok() && fast.is_ok());
        assert_eq!(log.lock().unwrap().as_slice(), &["fast", "slow"]);
    }

    #[tokio::test]
    async fn test_cancel_stops_running_and_queued_calls() {
        let executor = SequentialExecutor::new();
        let started = Arc::new(Mutex::new(Vec::new()));

        let call = |n: u32| {
            let started = Arc::clone(&started);
            executor.run("upload", move |token| async move {
                started.lock().unwrap().push(n);
                token.cancelled().await;
                Ok(n)
            })
        };
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(executor.cancel("upload"));
        };
        let (first, second, ()) = tokio::join!(call(0), call(1), canceller);

        assert_eq!(first, Err(ClientError::Cancelled));
        assert_eq!(second, Err(ClientError::Cancelled));
        assert_eq!(started.lock().unwrap().as_slice(), &[0]);
        assert_eq!(executor.active_keys(), 0);
        assert!(!executor.cancel("upload"));

        // A fresh lane is not affected by the earlier cancel
        let next = executor.run("upload", |_| async { Ok(7) }).await;
        assert_eq!(next, Ok(7));
    }
}

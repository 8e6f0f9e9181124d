//! # Debounce
//!
//! Calls under one key that arrive within `delay` of each other collapse
//! into a single execution with the most recent arguments. Every collapsed
//! caller receives that execution's result.
//!
//! The trailing execution runs on its own task, so a caller that stops
//! waiting does not strand the others. A call arriving while an execution
//! is running cancels it: its callers see [`ClientError::Cancelled`] and
//! the new batch runs after its own quiet period.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::oneshot;

use super::cancel::{cancellable, CancellationToken};
use super::errors::{ClientError, ClientResult};

type Operation<A, T> =
    Box<dyn FnOnce(A, CancellationToken) -> BoxFuture<'static, ClientResult<T>> + Send>;

struct Pending<A, T> {
    generation: u64,
    call: Option<(A, Operation<A, T>)>,
    waiters: Vec<oneshot::Sender<ClientResult<T>>>,
}

struct Running {
    generation: u64,
    token: CancellationToken,
}

struct Keys<A, T> {
    next_generation: u64,
    pending: HashMap<String, Pending<A, T>>,
    running: HashMap<String, Running>,
}

/// Per-key trailing-edge debouncer
pub struct Debouncer<A, T> {
    delay: Duration,
    keys: Arc<Mutex<Keys<A, T>>>,
}

impl<A, T> Debouncer<A, T>
where
    A: Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            keys: Arc::new(Mutex::new(Keys {
                next_generation: 0,
                pending: HashMap::new(),
                running: HashMap::new(),
            })),
        }
    }

    /// Register a call; the last caller in a quiet window supplies the
    /// `operation` and arguments that run
    pub async fn call<F, Fut>(&self, key: &str, args: A, operation: F) -> ClientResult<T>
    where
        F: FnOnce(A, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ClientResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut keys = self.keys.lock().map_err(|_| ClientError::Closed)?;
            if let Some(stale) = keys.running.remove(key) {
                stale.token.cancel();
            }
            keys.next_generation += 1;
            let generation = keys.next_generation;
            let entry = keys.pending.entry(key.to_string()).or_insert_with(|| Pending {
                generation,
                call: None,
                waiters: Vec::new(),
            });
            entry.generation = generation;
            let operation: Operation<A, T> = Box::new(move |a, t| operation(a, t).boxed());
            entry.call = Some((args, operation));
            entry.waiters.push(tx);
            generation
        };

        tokio::spawn(fire(
            Arc::clone(&self.keys),
            key.to_string(),
            generation,
            self.delay,
        ));

        // Dropped without a result means the key was torn down
        rx.await.unwrap_or(Err(ClientError::Cancelled))
    }

    /// Keys with calls waiting out their delay
    pub fn pending_keys(&self) -> usize {
        self.keys.lock().map(|k| k.pending.len()).unwrap_or(0)
    }

    /// Keys with an execution in progress
    pub fn running_keys(&self) -> usize {
        self.keys.lock().map(|k| k.running.len()).unwrap_or(0)
    }
}

/// Run the batch for `key` if `generation` is still its newest call once
/// the quiet period is over
async fn fire<A, T>(keys: Arc<Mutex<Keys<A, T>>>, key: String, generation: u64, delay: Duration)
where
    T: Clone,
{
    tokio::time::sleep(delay).await;

    let token = CancellationToken::new();
    let batch = {
        let Ok(mut guard) = keys.lock() else {
            return;
        };
        if !guard.pending.get(&key).is_some_and(|p| p.generation == generation) {
            return;
        }
        guard.running.insert(
            key.clone(),
            Running {
                generation,
                token: token.clone(),
            },
        );
        guard.pending.remove(&key)
    };
    let Some(batch) = batch else {
        return;
    };

    let result = match batch.call {
        Some((args, operation)) => cancellable(&token, operation(args, token.clone())).await,
        None => Err(ClientError::Cancelled),
    };

    if let Ok(mut guard) = keys.lock() {
        if guard.running.get(&key).is_some_and(|r| r.generation == generation) {
            guard.running.remove(&key);
        }
    }
    for waiter in batch.waiters {
        let _ = waiter.send(result.clone());
    }
}

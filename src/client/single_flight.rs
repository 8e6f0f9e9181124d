//! # Single-Flight
//!
//! At most one execution per key. A caller arriving while an execution is
//! pending gets the same result instead of starting another. The entry is
//! released when the execution finishes.
//!
//! [`SingleFlight::run_latest`] inverts the rule: the newest call wins, the
//! pending one is cancelled and its waiters see [`ClientError::Cancelled`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures_util::future::{BoxFuture, FutureExt, Shared};

use super::cancel::{cancellable, CancellationToken};
use super::errors::{ClientError, ClientResult};

type SharedResult<T> = Shared<BoxFuture<'static, ClientResult<T>>>;

struct Flight<T: Clone> {
    id: u64,
    future: SharedResult<T>,
    token: CancellationToken,
}

/// Per-key operation deduplication
pub struct SingleFlight<T: Clone> {
    flights: Mutex<HashMap<String, Flight<T>>>,
    next_id: AtomicU64,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn start<F, Fut>(&self, make: F) -> Flight<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ClientResult<T>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let operation = make(token.clone());
        let guard = token.clone();
        let future = async move { cancellable(&guard, operation).await }
            .boxed()
            .shared();
        Flight {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            future,
            token,
        }
    }

    async fn finish(&self, key: &str, id: u64, future: SharedResult<T>) -> ClientResult<T> {
        let result = future.await;
        if let Ok(mut flights) = self.flights.lock() {
            if flights.get(key).is_some_and(|f| f.id == id) {
                flights.remove(key);
            }
        }
        result
    }

    /// Join the pending execution for `key`, or start one
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> ClientResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ClientResult<T>> + Send + 'static,
    {
        let (id, future) = {
            let mut flights = self.flights.lock().map_err(|_| ClientError::Closed)?;
            match flights.get(key) {
                Some(flight) => (flight.id, flight.future.clone()),
                None => {
                    let flight = self.start(make);
                    let joined = (flight.id, flight.future.clone());
                    flights.insert(key.to_string(), flight);
                    joined
                }
            }
        };
        self.finish(key, id, future).await
    }

    /// Cancel the pending execution for `key` and start this one instead
    pub async fn run_latest<F, Fut>(&self, key: &str, make: F) -> ClientResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ClientResult<T>> + Send + 'static,
    {
        let (id, future) = {
            let mut flights = self.flights.lock().map_err(|_| ClientError::Closed)?;
            let flight = self.start(make);
            let joined = (flight.id, flight.future.clone());
            if let Some(previous) = flights.insert(key.to_string(), flight) {
                previous.token.cancel();
            }
            joined
        };
        self.finish(key, id, future).await
    }

    /// Cancel the pending execution for `key`; false if there was none
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self
            .flights
            .lock()
            .ok()
            .and_then(|mut flights| flights.remove(key));
        match removed {
            Some(flight) => {
                flight.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.flights.lock().map(|f| f.len()).unwrap_or(0)
    }
}

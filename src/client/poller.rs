//! # Poller
//!
//! Pull-transport client. Keeps the `since` cursor and advances it to each
//! response's `timestamp`. Overlapping polls share one request.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::errors::ClientResult;
use super::single_flight::SingleFlight;
use crate::gateway::{PollResponse, PolledEvent};

/// Fetches buffered events after a cursor
#[async_trait]
pub trait PollTransport: Send + Sync {
    async fn poll(&self, since: i64) -> ClientResult<PollResponse>;
}

const POLL_KEY: &str = "poll";

/// Cursor-keeping pull client
pub struct Poller {
    transport: Arc<dyn PollTransport>,
    cursor: Arc<AtomicI64>,
    flights: SingleFlight<Vec<PolledEvent>>,
}

impl Poller {
    pub fn new(transport: Arc<dyn PollTransport>, since: i64) -> Self {
        Self {
            transport,
            cursor: Arc::new(AtomicI64::new(since)),
            flights: SingleFlight::new(),
        }
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Move the cursor forward; never backwards
    pub fn advance_cursor(&self, to: i64) {
        self.cursor.fetch_max(to, Ordering::AcqRel);
    }

    /// Fetch everything after the cursor
    pub async fn poll_once(&self) -> ClientResult<Vec<PolledEvent>> {
        let transport = Arc::clone(&self.transport);
        let cursor = Arc::clone(&self.cursor);
        self.flights
            .run(POLL_KEY, move |_| async move {
                let since = cursor.load(Ordering::Acquire);
                let response = transport.poll(since).await?;
                cursor.fetch_max(response.timestamp, Ordering::AcqRel);
                Ok(response.events)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedTransport {
        seen: Mutex<Vec<i64>>,
        delay: Duration,
    }

    #[async_trait]
    impl PollTransport for ScriptedTransport {
        async fn poll(&self, since: i64) -> ClientResult<PollResponse> {
            self.seen.lock().unwrap().push(since);
            tokio::time::sleep(self.delay).await;
            if since < 0 {
                return Err(ClientError::Transport("bad cursor".into()));
            }
            Ok(PollResponse {
                events: vec![PolledEvent {
                    id: format!("e{}", since),
                    event_type: "tick".into(),
                    data: json!(since),
                    timestamp: since + 10,
                }],
                timestamp: since + 10,
            })
        }
    }

    #[tokio::test]
    async fn test_cursor_follows_response_timestamp() {
        let transport = Arc::new(ScriptedTransport::default());
        let poller = Poller::new(transport.clone(), 0);

        poller.poll_once().await.unwrap();
        poller.poll_once().await.unwrap();
        assert_eq!(poller.cursor(), 20);
        assert_eq!(transport.seen.lock().unwrap().as_slice(), &[0, 10]);
    }

    #[tokio::test]
    async fn test_overlapping_polls_share_request() {
        let transport = Arc::new(ScriptedTransport {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let poller = Poller::new(transport.clone(), 5);

        let (a, b) = tokio::join!(poller.poll_once(), poller.poll_once());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
        assert_eq!(poller.cursor(), 15);
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_cursor() {
        let transport = Arc::new(ScriptedTransport::default());
        let poller = Poller::new(transport, -1);
        assert!(poller.poll_once().await.is_err());
        assert_eq!(poller.cursor(), -1);
    }
}

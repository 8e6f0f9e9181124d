//! # Hybrid Client
//!
//! One background task that keeps a client receiving events, over push when
//! it can and over pull when it must. The task owns the transports; the
//! [`HybridClient`] handle reads state and asks for method switches.
//!
//! Every push session starts with one catch-up poll from the pull cursor,
//! so events buffered while no session was live are fetched. Once that poll
//! succeeds, each heartbeat moves the cursor to just below its `timestamp`;
//! the hello frame's `connectedAt` never moves it. Events may arrive twice (catch-up and
//! push, or push and the first poll after a fallback); none are skipped.
//!
//! Only application events reach the output channel. `connected` and
//! `heartbeat` frames are consumed by the task.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cancel::CancellationToken;
use super::errors::{ClientError, ClientResult};
use super::poller::{PollTransport, Poller};
use super::reconnect::{ConnectionManager, ConnectionMethod, ReconnectDecision, ReconnectPolicy};
use crate::gateway::{GatewayEvent, CONNECTED_EVENT, HEARTBEAT_EVENT};

/// Opens push streams
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open a stream; it ends when the receiver yields `None`
    async fn connect(&self) -> ClientResult<mpsc::Receiver<GatewayEvent>>;
}

/// Hybrid client tuning
#[derive(Debug, Clone)]
pub struct HybridConfig {
    pub policy: ReconnectPolicy,
    pub poll_interval: Duration,
    /// Initial pull cursor (epoch ms)
    pub since: i64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            poll_interval: Duration::from_secs(5),
            since: 0,
        }
    }
}

/// Handle to a running hybrid client
pub struct HybridClient {
    manager: Arc<Mutex<ConnectionManager>>,
    poller: Arc<Poller>,
    switch: watch::Sender<u64>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HybridClient {
    /// Spawn the client task. Events arrive on the returned receiver until
    /// the client shuts down.
    pub fn start(
        config: HybridConfig,
        push: Arc<dyn PushTransport>,
        pull: Arc<dyn PollTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let manager = Arc::new(Mutex::new(ConnectionManager::new(config.policy)));
        let poller = Arc::new(Poller::new(pull, config.since));
        let (switch, switch_rx) = watch::channel(0u64);
        let (out, events) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let driver = Driver {
            manager: Arc::clone(&manager),
            push,
            poller: Arc::clone(&poller),
            poll_interval: config.poll_interval,
            out,
            switch: switch_rx,
            token: token.clone(),
        };
        let task = tokio::spawn(driver.run());

        let client = Self {
            manager,
            poller,
            switch,
            token,
            task: Mutex::new(Some(task)),
        };
        (client, events)
    }

    pub fn method(&self) -> ConnectionMethod {
        self.manager
            .lock()
            .map(|m| m.method())
            .unwrap_or(ConnectionMethod::Pull)
    }

    /// Set once push reconnecting has stopped
    pub fn terminal_error(&self) -> Option<ClientError> {
        self.manager
            .lock()
            .ok()
            .and_then(|m| m.terminal_error().cloned())
    }

    /// Current pull cursor
    pub fn cursor(&self) -> i64 {
        self.poller.cursor()
    }

    pub fn force_pull(&self) {
        if let Ok(mut manager) = self.manager.lock() {
            manager.force_pull();
        }
        self.notify_switch();
    }

    /// Return to push; false if push is unsupported
    pub fn force_push(&self) -> bool {
        let switched = self
            .manager
            .lock()
            .map(|mut m| m.force_push())
            .unwrap_or(false);
        if switched {
            self.notify_switch();
        }
        switched
    }

    fn notify_switch(&self) {
        self.switch.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Stop the task and wait for it
    pub async fn shutdown(&self) {
        self.token.cancel();
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for HybridClient {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Why a wait ended early
enum Interrupt {
    Cancelled,
    Switched,
}

struct Driver {
    manager: Arc<Mutex<ConnectionManager>>,
    push: Arc<dyn PushTransport>,
    poller: Arc<Poller>,
    poll_interval: Duration,
    out: mpsc::UnboundedSender<GatewayEvent>,
    switch: watch::Receiver<u64>,
    token: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let step = match self.current() {
                Some((ConnectionMethod::Push, false)) => self.push_step().await,
                // Terminal without pull: idle until forced back to push
                Some((ConnectionMethod::Push, true)) => self.wait(std::future::pending::<()>()).await,
                Some((ConnectionMethod::Pull, _)) => self.pull_step().await,
                None => Err(Interrupt::Cancelled),
            };
            if let Err(Interrupt::Cancelled) = step {
                break;
            }
        }
        debug!("hybrid client stopped");
    }

    fn current(&self) -> Option<(ConnectionMethod, bool)> {
        let manager = self.manager.lock().ok()?;
        Some((manager.method(), manager.terminal_error().is_some()))
    }

    /// Await `fut` unless cancelled or switched first
    async fn wait<F: Future>(&mut self, fut: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupt::Cancelled),
            changed = self.switch.changed() => match changed {
                Ok(()) => Err(Interrupt::Switched),
                Err(_) => Err(Interrupt::Cancelled),
            },
            output = fut => Ok(output),
        }
    }

    fn forward(&self, event: GatewayEvent) -> Result<(), Interrupt> {
        // Consumer gone: nothing left to do
        self.out.send(event).map_err(|_| Interrupt::Cancelled)
    }

    // ==================
    // Push
    // ==================

    async fn push_step(&mut self) -> Result<(), Interrupt> {
        let failure = self.push_session().await?;
        let decision = match self.manager.lock() {
            Ok(mut manager) => manager.record_failure(&failure),
            Err(_) => return Err(Interrupt::Cancelled),
        };
        match decision {
            ReconnectDecision::RetryAfter(delay) => {
                debug!(error = %failure, delay_ms = delay.as_millis() as u64, "push reconnect scheduled");
                self.wait(tokio::time::sleep(delay)).await?;
            }
            ReconnectDecision::FallBackToPull => {
                warn!(error = %failure, "push failing, falling back to pull");
            }
            ReconnectDecision::GiveUp(terminal) => {
                error!(error = %terminal, "push reconnect stopped");
            }
        }
        Ok(())
    }

    /// One push connection from connect to end; returns why it ended
    async fn push_session(&mut self) -> Result<ClientError, Interrupt> {
        let push = Arc::clone(&self.push);
        let mut stream = match self.wait(async move { push.connect().await }).await? {
            Ok(stream) => stream,
            Err(e) => return Ok(e),
        };
        if let Ok(mut manager) = self.manager.lock() {
            manager.record_success();
        }
        let synced = self.catch_up().await?;

        loop {
            match self.wait(stream.recv()).await? {
                Some(event) => self.on_push_event(event, synced)?,
                None => return Ok(ClientError::Transport("push stream ended".into())),
            }
        }
    }

    /// Fetch what was buffered after the cursor while no session was live.
    /// False if the poll failed; the cursor must then stay where it is for
    /// the whole session.
    async fn catch_up(&mut self) -> Result<bool, Interrupt> {
        let poller = Arc::clone(&self.poller);
        match self.wait(async move { poller.poll_once().await }).await? {
            Ok(events) => {
                for event in events {
                    self.forward(GatewayEvent::new(event.event_type, event.data))?;
                }
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "catch-up poll failed, cursor held for this session");
                Ok(false)
            }
        }
    }

    fn on_push_event(&self, event: GatewayEvent, synced: bool) -> Result<(), Interrupt> {
        match event.event_type.as_str() {
            CONNECTED_EVENT => {
                info!(client_id = ?event.data.get("clientId"), "push connected");
                Ok(())
            }
            HEARTBEAT_EVENT => {
                if synced {
                    // Events stamped at the heartbeat's time may still follow it
                    if let Some(ts) = event.data.get("timestamp").and_then(Value::as_i64) {
                        self.poller.advance_cursor(ts.saturating_sub(1));
                    }
                }
                Ok(())
            }
            _ => self.forward(event),
        }
    }

    // ==================
    // Pull
    // ==================

    async fn pull_step(&mut self) -> Result<(), Interrupt> {
        let poller = Arc::clone(&self.poller);
        let pause = match self.wait(async move { poller.poll_once().await }).await? {
            Ok(events) => {
                for event in events {
                    self.forward(GatewayEvent::new(event.event_type, event.data))?;
                }
                self.poll_interval
            }
            Err(ClientError::Throttled { retry_after_ms }) => {
                warn!(retry_after_ms, "poll throttled");
                Duration::from_millis(retry_after_ms).max(self.poll_interval)
            }
            Err(e) => {
                warn!(error = %e, "poll failed");
                self.poll_interval
            }
        };
        self.wait(tokio::time::sleep(pause)).await
    }
}

//! # Reconnection
//!
//! Push/pull state machine with capped exponential backoff.
//!
//! ```text
//!            N failures (pull enabled)
//!   Push ───────────────────────────────► Pull
//!     ▲           force_pull                │
//!     └────────────── force_push ───────────┘
//! ```
//!
//! There is no automatic return to push. After `max_attempts` consecutive
//! push failures reconnecting stops and a terminal error is surfaced; that
//! check wins over the pull threshold.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::ClientError;

/// How the client currently receives events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMethod {
    Push,
    Pull,
}

/// Reconnect tuning
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures after which reconnecting stops
    pub max_attempts: u32,
    /// Consecutive failures after which pull takes over
    pub pull_threshold: u32,
    pub pull_enabled: bool,
    /// Whether a push transport exists at all
    pub push_supported: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            pull_threshold: 3,
            pull_enabled: true,
            push_supported: true,
        }
    }
}

impl ReconnectPolicy {
    /// `base * 2^(attempt - 1)`, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// What to do after a push failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryAfter(Duration),
    FallBackToPull,
    GiveUp(ClientError),
}

/// Connection method state
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    policy: ReconnectPolicy,
    method: ConnectionMethod,
    failures: u32,
    terminal: Option<ClientError>,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let method = if policy.push_supported {
            ConnectionMethod::Push
        } else {
            ConnectionMethod::Pull
        };
        Self {
            policy,
            method,
            failures: 0,
            terminal: None,
        }
    }

    pub fn method(&self) -> ConnectionMethod {
        self.method
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Set once reconnecting has stopped
    pub fn terminal_error(&self) -> Option<&ClientError> {
        self.terminal.as_ref()
    }

    /// Whether another push attempt should be made
    pub fn should_retry_push(&self) -> bool {
        self.method == ConnectionMethod::Push && self.terminal.is_none()
    }

    /// A push connection came up
    pub fn record_success(&mut self) {
        self.failures = 0;
        self.terminal = None;
    }

    /// A push connection failed or dropped
    pub fn record_failure(&mut self, error: &ClientError) -> ReconnectDecision {
        self.failures += 1;

        if self.failures >= self.policy.max_attempts {
            let terminal = ClientError::Terminal {
                attempts: self.failures,
                last_error: error.to_string(),
            };
            self.terminal = Some(terminal.clone());
            if self.policy.pull_enabled {
                self.method = ConnectionMethod::Pull;
            }
            return ReconnectDecision::GiveUp(terminal);
        }

        if self.policy.pull_enabled && self.failures >= self.policy.pull_threshold {
            self.method = ConnectionMethod::Pull;
            return ReconnectDecision::FallBackToPull;
        }

        ReconnectDecision::RetryAfter(self.policy.delay_for(self.failures))
    }

    pub fn force_pull(&mut self) {
        self.method = ConnectionMethod::Pull;
    }

    /// Back to push with a clean slate; false if push is unsupported
    pub fn force_push(&mut self) -> bool {
        if !self.policy.push_supported {
            return false;
        }
        self.method = ConnectionMethod::Push;
        self.failures = 0;
        self.terminal = None;
        true
    }
}

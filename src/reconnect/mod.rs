//! Reconnection policy
//!
//! After an unexpected disconnection the session asks its `Reconnector` what
//! to do before every attempt. The policy combines a backoff strategy with an
//! overall timeout measured from the moment the connection was lost:
//! - while the elapsed time is below the timeout the answer is
//!   `Wait(strategy.delay(attempt))`;
//! - once it reaches the timeout the answer is `Abort` and the session closes.
//!
//! The attempt counter lives in the `Reconnector`, which each session owns
//! exclusively, and resets to zero after a successful reconnection.

pub mod strategy;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

pub use strategy::{ExponentialBackoff, FixedDelay, ReconnectionStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Wait(Duration),
    Abort,
}

#[derive(Clone)]
pub struct ReconnectPolicy {
    strategy: Arc<dyn ReconnectionStrategy>,
    timeout: Duration,
}

impl ReconnectPolicy {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

    pub fn new(strategy: impl ReconnectionStrategy, timeout: Duration) -> Self {
        Self {
            strategy: Arc::new(strategy),
            timeout,
        }
    }

    /// A policy that gives up immediately: the first disconnect closes the session.
    pub fn disabled() -> Self {
        Self::new(FixedDelay(Duration::ZERO), Duration::ZERO)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_strategy(mut self, strategy: impl ReconnectionStrategy) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.strategy.delay(attempt)
    }

    /// What to do before attempt `attempt`, `elapsed` into the outage.
    pub fn decide(&self, attempt: u32, elapsed: Duration) -> ReconnectDecision {
        if elapsed >= self.timeout {
            ReconnectDecision::Abort
        } else {
            ReconnectDecision::Wait(self.strategy.delay(attempt))
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default(), Self::DEFAULT_TIMEOUT)
    }
}

impl fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Per-session reconnection state: the attempt counter and the time the
/// current outage started.
#[derive(Debug)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    attempts: u32,
    lost_at: Option<Instant>,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            lost_at: None,
        }
    }

    /// Mark the start of an outage. Has no effect if one is already running.
    pub fn begin(&mut self) {
        if self.lost_at.is_none() {
            self.lost_at = Some(Instant::now());
        }
    }

    /// Time since the outage started, zero outside one.
    pub fn elapsed(&self) -> Duration {
        self.lost_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Time left before the policy aborts.
    pub fn remaining(&self) -> Duration {
        self.policy.timeout().saturating_sub(self.elapsed())
    }

    /// Decide on the next attempt, counting it unless the answer is `Abort`.
    pub fn next_attempt(&mut self) -> ReconnectDecision {
        let decision = self.policy.decide(self.attempts, self.elapsed());
        if let ReconnectDecision::Wait(_) = decision {
            self.attempts = self.attempts.saturating_add(1);
        }
        decision
    }

    /// Called after a successful reconnection. Clears the attempt counter
    /// and ends the outage.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.lost_at = None;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

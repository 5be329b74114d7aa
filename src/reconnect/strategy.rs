//! Backoff strategies: map an attempt index to the wait before that attempt.

use std::time::Duration;

pub trait ReconnectionStrategy: Send + Sync + 'static {
    fn delay(&self, attempt: u32) -> Duration;
}

impl<F> ReconnectionStrategy for F
where
    F: Fn(u32) -> Duration + Send + Sync + 'static,
{
    fn delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// `min(2^attempt * base, max_interval)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max_interval: Duration,
}

impl ExponentialBackoff {
    pub const DEFAULT_BASE: Duration = Duration::from_millis(100);
    pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new(base: Duration, max_interval: Duration) -> Self {
        Self { base, max_interval }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_MAX_INTERVAL)
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.max_interval.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl ReconnectionStrategy for FixedDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

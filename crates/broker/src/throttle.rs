//! Retry pacing.
//!
//! A [`ThrottlingStrategy`] turns a retry count into a delay; the
//! [`Throttler`] sleeps for it, keeping the message alive on long waits and
//! waking early when the broker shuts down.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::consumer::ConsumerPolicy;
use crate::shutdown::ShutdownSignal;
use crate::worker::{KeepAlive, KeepAliveError};

/// Delay to apply before a retry.
pub trait ThrottlingStrategy: Send + Sync + core::fmt::Debug {
    /// Delay before retry number `retry_count` (1-indexed; 0 means no delay).
    fn delay(&self, retry_count: u32) -> Duration;
}

/// `min(base * 2^(n-1), cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// One second base, doubling up to `cap`.
    pub fn up_to(cap: Duration) -> Self {
        Self::new(Duration::from_secs(1), cap)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

impl ThrottlingStrategy for ExponentialBackoff {
    fn delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        2u32.checked_pow(retry_count - 1)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// The same delay before every retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl ThrottlingStrategy for FixedDelay {
    fn delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            Duration::ZERO
        } else {
            self.0
        }
    }
}

/// Retry immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoThrottling;

impl ThrottlingStrategy for NoThrottling {
    fn delay(&self, _retry_count: u32) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    #[error("throttling interrupted by shutdown")]
    Interrupted,
    #[error("keep-alive during throttling failed: {0}")]
    KeepAlive(#[from] KeepAliveError),
}

/// Executes retry delays for workers.
#[derive(Debug, Clone)]
pub struct Throttler {
    signal: ShutdownSignal,
}

impl Throttler {
    pub(crate) fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }

    /// Interrupt every current and future wait.
    pub(crate) fn interrupt(&self) {
        self.signal.trigger();
    }

    pub fn is_interrupted(&self) -> bool {
        self.signal.is_triggered()
    }

    /// Block for the policy's delay for `retry_count`.
    ///
    /// Waits longer than half the consumer timeout are split into chunks
    /// with a keep-alive between them, so the watcher does not reclaim a
    /// message that is merely backing off.
    pub fn throttle(
        &self,
        retry_count: u32,
        policy: &ConsumerPolicy,
        keep_alive: &KeepAlive,
    ) -> Result<(), ThrottleError> {
        let delay = policy.throttling_strategy().delay(retry_count);
        self.wait(delay, policy.timeout(), keep_alive)
    }

    fn wait(
        &self,
        delay: Duration,
        timeout: Duration,
        keep_alive: &KeepAlive,
    ) -> Result<(), ThrottleError> {
        if self.signal.is_triggered() {
            return Err(ThrottleError::Interrupted);
        }

        let refresh_every = timeout / 2;
        let refresh = delay > refresh_every && !refresh_every.is_zero();
        let deadline = Instant::now() + delay;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let remaining = deadline - now;
            let chunk = if refresh {
                remaining.min(refresh_every)
            } else {
                remaining
            };

            if self.signal.wait_timeout(chunk) {
                return Err(ThrottleError::Interrupted);
            }
            if refresh && Instant::now() < deadline {
                trace!("keeping throttled message alive");
                keep_alive.send()?;
            }
        }
    }
}

//! Bounded polling of asynchronous engine state transitions.
//!
//! Snapshot creation, snapshot removal, transfer initialization and transfer
//! finalization all complete asynchronously on the engine. [`poll_until`]
//! waits for them with a deadline and optional backoff instead of looping
//! forever.

use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};

/// Default pause between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default deadline for a single poll loop (30 minutes).
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30 * 60);

/// How a poll loop paces itself and when it gives up.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Pause before the second attempt.
    pub interval: Duration,
    /// Upper bound for the pause once backoff kicks in.
    pub max_interval: Duration,
    /// Factor applied to the pause after every attempt (1.0 = fixed).
    pub backoff: f64,
    /// Give up once this much time has passed. `None` waits forever.
    pub max_wait: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_interval: Duration::from_secs(10),
            backoff: 1.5,
            max_wait: Some(DEFAULT_MAX_WAIT),
        }
    }
}

impl PollPolicy {
    /// Fixed-interval polling with a deadline.
    pub fn fixed(interval: Duration, max_wait: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            backoff: 1.0,
            max_wait: Some(max_wait),
        }
    }

    /// Fixed one-second polling without a deadline.
    pub fn unbounded() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_interval: DEFAULT_POLL_INTERVAL,
            backoff: 1.0,
            max_wait: None,
        }
    }

    /// Replace the deadline.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        if !self.backoff.is_finite() || self.backoff <= 1.0 {
            return current.min(self.max_interval);
        }
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

/// Call `check` until it yields a value.
///
/// `check` receives the 1-based attempt number and returns `Ok(Some(_))`
/// when the awaited state is reached, `Ok(None)` to keep waiting, or an
/// error to abort. The loop fails with [`Error::Timeout`] when the next
/// pause would overrun the policy's deadline and with [`Error::Cancelled`]
/// when `cancel` fires.
pub fn poll_until<T, F>(
    operation: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut(u32) -> Result<Option<T>>,
{
    let started = Instant::now();
    let mut interval = policy.interval;
    let mut attempt = 0u32;

    loop {
        cancel.check()?;
        attempt += 1;

        if let Some(value) = check(attempt)? {
            return Ok(value);
        }

        let waited = started.elapsed();
        if let Some(max_wait) = policy.max_wait {
            if waited + interval > max_wait {
                return Err(Error::timeout(operation, waited));
            }
        }

        debug!(operation, attempt, ?interval, "still waiting");
        thread::sleep(interval);
        interval = policy.next_interval(interval);
    }
}

//! Restart and retry policies
//!
//! ## Responsibilities
//!
//! - Bound the restart rate (sliding window over successful restarts)
//! - Bound consecutive failed connection attempts
//! - Shape backoff delays (exponential with symmetric jitter)
//! - Let callers decide whether a failed operation retries after a restart

use rand::RngExt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{ClientError, Result};

/// Bounds on how aggressively the slot replaces dead connections.
///
/// Only *successful* restarts consume the sliding-window budget; a
/// persistently unreachable agent is caught by the separate
/// `max_consecutive_failures` cap instead of retrying forever. The two caps
/// are deliberately independent knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Successful restarts allowed inside `window` before the slot faults.
    pub max_restarts_per_window: u32,

    /// Width of the sliding restart-rate window.
    pub window: Duration,

    /// Delay before the second restart attempt in a window; doubles from
    /// there. The first attempt is immediate.
    pub initial_backoff: Duration,

    /// Upper bound on any computed delay.
    pub max_backoff: Duration,

    /// Symmetric jitter fraction applied to each delay (0.2 = ±20%).
    pub jitter: f64,

    /// Consecutive failed connection attempts before the slot faults.
    pub max_consecutive_failures: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts_per_window: 5,
            window: Duration::from_secs(60),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            jitter: 0.2,
            max_consecutive_failures: 5,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart attempt `attempt` (1-based within the current
    /// window): zero for the first, then
    /// `min(max_backoff, initial_backoff * 2^(attempt - 2))` with jitter,
    /// clamped to `[0, max_backoff]`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exp = attempt - 2;
        let factor = if exp >= 31 { u32::MAX } else { 1u32 << exp };
        let base = self
            .initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff));

        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }

        let span = base.as_secs_f64() * self.jitter;
        let mut rng = rand::rng();
        let offset: f64 = rng.random_range(-span..=span);
        let jittered = (base.as_secs_f64() + offset).max(0.0);
        Duration::from_secs_f64(jittered).min(self.max_backoff)
    }
}

/// Everything a retry policy gets to look at after a disconnect.
///
/// By the time the policy runs, the slot has already been asked to restart
/// (when auto-restart is enabled), so a `retry` decision executes against a
/// fresh connection.
#[derive(Debug)]
pub struct RetryContext<'a> {
    /// Which operation failed (the method name for plain calls).
    pub operation: &'a str,
    /// How many times this operation has failed so far (1-based).
    pub attempt: u32,
    /// The disconnect that triggered the consult.
    pub error: &'a ClientError,
}

/// Async hook run just before a retry, e.g. to re-establish higher-level
/// session state on the fresh connection.
pub type BeforeRetry = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Outcome of a retry consult.
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Option<Duration>,
    pub before_retry: Option<BeforeRetry>,
}

impl RetryDecision {
    pub fn give_up() -> Self {
        Self {
            retry: false,
            delay: None,
            before_retry: None,
        }
    }

    pub fn retry() -> Self {
        Self {
            retry: true,
            delay: None,
            before_retry: None,
        }
    }

    pub fn retry_after(delay: Duration) -> Self {
        Self {
            retry: true,
            delay: Some(delay),
            before_retry: None,
        }
    }

    pub fn with_before_retry(mut self, hook: BeforeRetry) -> Self {
        self.before_retry = Some(hook);
        self
    }
}

impl std::fmt::Debug for RetryDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryDecision")
            .field("retry", &self.retry)
            .field("delay", &self.delay)
            .field("before_retry", &self.before_retry.is_some())
            .finish()
    }
}

/// Decides whether a disconnected operation should run again.
pub trait RetryPolicy: Send + Sync {
    fn decide(&self, ctx: &RetryContext<'_>) -> RetryDecision;
}

/// Default policy: never retry. Re-running a side-effecting call is unsafe
/// unless the caller explicitly opts in.
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn decide(&self, _ctx: &RetryContext<'_>) -> RetryDecision {
        RetryDecision::give_up()
    }
}

/// Retry up to `max_attempts` extra times, optionally pausing between.
pub struct RetryLimit {
    max_attempts: u32,
    delay: Option<Duration>,
}

impl RetryLimit {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl RetryPolicy for RetryLimit {
    fn decide(&self, ctx: &RetryContext<'_>) -> RetryDecision {
        if ctx.attempt > self.max_attempts {
            return RetryDecision::give_up();
        }
        match self.delay {
            Some(delay) => RetryDecision::retry_after(delay),
            None => RetryDecision::retry(),
        }
    }
}

// Backoff policy with exponential growth, a delay cap and additive jitter
use std::time::Duration;

use rand::Rng;

use crate::sync::retry::constants::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, DEFAULT_MAX_JITTER,
    MAX_BACKOFF_EXPONENT, MAX_MAX_ATTEMPTS, MIN_MAX_ATTEMPTS,
};
use crate::sync::retry::error::{RetryError, RetryResult};

/// Retry schedule for queued deliveries and failed sync passes.
///
/// Attempt numbers are 1-based: the delay after the first failure is
/// `base_delay`, doubling for every further failure until `max_delay`.
/// Jitter never exceeds the deterministic part of a delay and the sum is
/// clamped to `max_delay`, so each delay is at least the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with validation
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> RetryResult<Self> {
        if !(MIN_MAX_ATTEMPTS..=MAX_MAX_ATTEMPTS).contains(&max_attempts) {
            return Err(RetryError::InvalidAttempts {
                min: MIN_MAX_ATTEMPTS,
                max: MAX_MAX_ATTEMPTS,
                actual: max_attempts,
            });
        }
        if base_delay > max_delay {
            return Err(RetryError::InvalidDelays { base: base_delay, max: max_delay });
        }
        Ok(Self { max_attempts, base_delay, max_delay, max_jitter: DEFAULT_MAX_JITTER })
    }

    /// Set the jitter upper bound (zero disables jitter)
    #[must_use]
    pub const fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Deterministic part of the delay after `attempt` failures.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base_millis = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_millis = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let exponent = (attempt - 1).min(MAX_BACKOFF_EXPONENT);
        let delay_millis = base_millis.saturating_mul(2_u64.saturating_pow(exponent)).min(max_millis);

        Duration::from_millis(delay_millis)
    }

    /// Delay after `attempt` failures with random jitter in `[0, max_jitter)`,
    /// clamped to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            let bound = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
            Duration::from_millis(rand::thread_rng().gen_range(0..bound))
        };
        self.delay_with_jitter(attempt, jitter)
    }

    /// Delay after `attempt` failures with a caller-supplied jitter.
    ///
    /// The jitter is clamped below `max_jitter` and to the deterministic
    /// delay itself; the result never exceeds `max_delay`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let base = self.base_delay_for(attempt);
        let ceiling = self.max_jitter.saturating_sub(Duration::from_millis(1)).min(base);
        (base + jitter.min(ceiling)).min(self.max_delay)
    }

    /// No further attempt is allowed after `attempts` failures.
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

//! Retry decisions and backoff schedules

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponent cap for the exponential schedule.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Delay schedule between successive retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Same delay before every retry. Handy in tests.
    Constant { delay: Duration },
    /// `base * 2^(attempt - 1)`: the first retry waits `base`, doubling on
    /// each further failure.
    Exponential { base: Duration },
}

impl BackoffStrategy {
    /// Delay before re-running a job whose execution number `attempt`
    /// (1-based) just failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant { delay } => *delay,
            Self::Exponential { base } => {
                let exp = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
                base.saturating_mul(1u32 << exp)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
        }
    }
}

/// Retry-vs-fail decision plus the backoff delay for the next attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    strategy: BackoffStrategy,
    /// Additive jitter fraction in `0.0..=1.0`; 0 keeps the schedule exact.
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(strategy: BackoffStrategy, jitter: f64) -> Self {
        Self {
            strategy,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Decides the fate of a job whose execution number `attempts` (1-based)
    /// just failed: `Some(delay)` to reschedule, `None` once the retry budget
    /// is exhausted.
    ///
    /// Jitter only ever adds to the base delay, so the schedule stays
    /// strictly increasing across attempts.
    pub fn next_delay(&self, attempts: u32, max_retries: u32) -> Option<Duration> {
        if attempts > max_retries {
            return None;
        }
        Some(self.apply_jitter(self.strategy.delay(attempts)))
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let frac = rand::rng().random_range(0.0..=self.jitter);
        delay.saturating_add(delay.mul_f64(frac))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(BackoffStrategy::default(), 0.0)
    }
}

//! Queue configuration

use std::time::Duration;

use crate::retry::BackoffStrategy;

/// Tuning knobs for a [`JobQueue`](crate::queue::JobQueue).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// Sleep between claim attempts when nothing is ready. New work wakes
    /// idle workers early.
    pub idle_interval: Duration,
    /// Execution budget for jobs that do not set their own.
    pub default_timeout: Duration,
    /// Retry ceiling for jobs that do not set their own.
    pub default_max_retries: u32,
    /// Backoff schedule between retry attempts.
    pub backoff: BackoffStrategy,
    /// Additive jitter fraction applied to backoff delays, `0.0..=1.0`.
    pub jitter: f64,
    /// Period of the background sweep of aged terminal jobs.
    pub sweep_interval: Duration,
    /// Terminal jobs older than this are removed by the periodic sweep.
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_interval: Duration::from_secs(1),
            default_timeout: Duration::from_secs(30),
            default_max_retries: 3,
            backoff: BackoffStrategy::default(),
            jitter: 0.0,
            sweep_interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = QueueConfig::default();
        assert!(config.workers > 0);
        assert!(config.idle_interval.as_millis() > 0);
        assert!(config.default_timeout.as_secs() > 0);
        assert_eq!(config.jitter, 0.0);
        assert!(config.sweep_interval >= config.idle_interval);
    }

    #[test]
    fn test_builders() {
        let config = QueueConfig::new()
            .with_workers(2)
            .with_idle_interval(Duration::from_millis(10))
            .with_default_timeout(Duration::from_millis(100))
            .with_default_max_retries(0)
            .with_backoff(BackoffStrategy::Constant {
                delay: Duration::ZERO,
            })
            .with_jitter(0.1)
            .with_sweep_interval(Duration::from_secs(5))
            .with_retention(Duration::from_secs(60));

        assert_eq!(config.workers, 2);
        assert_eq!(config.default_max_retries, 0);
        assert_eq!(config.jitter, 0.1);
    }

    #[test]
    fn test_worker_count_floor() {
        let config = QueueConfig::new().with_workers(0);
        assert_eq!(config.workers, 1);
    }
}

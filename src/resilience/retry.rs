// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Two uses:
//! - [`retry()`] wraps an operation in-line (local store connection at startup).
//! - [`RetryConfig::delay_for_attempt()`] schedules the next attempt of a
//!   queued mutation, so the drain loop never sleeps on a single write.
//!
//! # Example
//!
//! ```
//! use care_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Mutation drain: doubles per attempt, capped at 5 minutes
//! let drain = RetryConfig::mutation_drain();
//! assert_eq!(drain.delay_for_attempt(1), Duration::from_secs(1));
//! assert_eq!(drain.delay_for_attempt(3), Duration::from_secs(4));
//! assert_eq!(drain.delay_for_attempt(30), Duration::from_secs(300));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts before giving up (`None` = forever)
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::mutation_drain()
    }
}

impl RetryConfig {
    /// Fast-fail retry for opening local storage.
    /// Attempts 5 times with exponential backoff, giving up after ~3 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Backoff for queued writes against the remote backend.
    /// 8 attempts, 1s doubling to a 5 minute cap; after that the write is
    /// marked failed and left for the user to resolve.
    #[must_use]
    pub fn mutation_drain() -> Self {
        Self {
            max_retries: Some(8),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(63) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Whether `attempts` failures exhaust the budget.
    #[must_use]
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_retries
            .map(|max| attempts as usize >= max)
            .unwrap_or(false)
    }
}

/// Run `operation` until it succeeds or the budget in `config` runs out,
/// sleeping with the same backoff schedule queued mutations use.
///
/// Returns the last error once [`RetryConfig::exhausted`] says stop.
pub async fn retry<F, Fut, T, E>(label: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures: u32 = 0;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if failures > 0 {
                    info!(operation = label, failures, "Recovered after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        failures = failures.saturating_add(1);
        if config.exhausted(failures) {
            warn!(operation = label, failures, error = %err, "Giving up");
            return Err(err);
        }

        let wait = config.delay_for_attempt(failures);
        warn!(operation = label, failures, error = %err, retry_in = ?wait, "Attempt failed");
        sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Operation that fails `fail_first` times, then yields the attempt number.
    async fn flaky(calls: &AtomicU32, fail_first: u32) -> Result<u32, String> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= fail_first {
            Err(format!("attempt {n} refused"))
        } else {
            Ok(n)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_on_backoff_schedule() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result = retry("open", &RetryConfig::startup(), || flaky(&calls, 2)).await;

        assert_eq!(result, Ok(3));
        // 200ms after the first failure, 400ms after the second
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(600) && waited < Duration::from_millis(610), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        };

        let result = retry("open", &config, || flaky(&calls, u32::MAX)).await;

        assert_eq!(result, Err("attempt 3 refused".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_first_success_does_not_sleep() {
        let calls = AtomicU32::new(0);
        let result = retry("open", &RetryConfig::mutation_drain(), || flaky(&calls, 0)).await;
        assert_eq!(result, Ok(1));
    }

    #[test]
    fn test_drain_schedule() {
        let drain = RetryConfig::mutation_drain();
        let schedule: Vec<u64> = (0..=10).map(|n| drain.delay_for_attempt(n).as_secs()).collect();
        assert_eq!(schedule, vec![0, 1, 2, 4, 8, 16, 32, 64, 128, 256, 300]);
    }

    #[test]
    fn test_huge_factor_is_capped() {
        let steep = RetryConfig {
            factor: 1e6,
            ..RetryConfig::startup()
        };
        assert_eq!(steep.delay_for_attempt(2), steep.max_delay);
        assert_eq!(steep.delay_for_attempt(u32::MAX), steep.max_delay);
    }

    #[test]
    fn test_exhausted() {
        let drain = RetryConfig::mutation_drain();
        assert!(!drain.exhausted(7));
        assert!(drain.exhausted(8));

        let forever = RetryConfig {
            max_retries: None,
            ..RetryConfig::startup()
        };
        assert!(!forever.exhausted(u32::MAX));
    }
}

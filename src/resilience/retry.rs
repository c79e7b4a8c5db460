// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! [`Backoff`] produces the delay schedule; [`retry`] drives an operation
//! through it. The connectivity state machine uses [`Backoff`] directly so
//! its waits can be cancelled.
//!
//! # Example
//!
//! ```
//! use satellite::resilience::retry::{Backoff, RetryConfig};
//! use std::time::Duration;
//!
//! let config = RetryConfig {
//!     initial_delay: Duration::from_secs(1),
//!     max_delay: Duration::from_secs(4),
//!     factor: 2.0,
//!     jitter: 0.0,
//!     max_retries: None,
//! };
//!
//! let mut backoff = Backoff::new(&config);
//! let delays: Vec<_> = (0..4).filter_map(|_| backoff.next_delay()).collect();
//! assert_eq!(delays, vec![
//!     Duration::from_secs(1),
//!     Duration::from_secs(2),
//!     Duration::from_secs(4),
//!     Duration::from_secs(4),
//! ]);
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::daemon()`] - Infinite retry for runtime reconnection
/// - [`RetryConfig::query()`] - Quick retry for individual operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Fraction of the nominal delay added at random (0.0 = none)
    pub jitter: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Fast-fail retry for opening the embedded database.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Infinite retry for reconnecting to the sync service.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None, // Infinite
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.1,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
        }
    }
}

/// Delay schedule for consecutive failures.
///
/// Delays grow by `factor` from `initial_delay` and are capped at
/// `max_delay`. Jitter adds up to `jitter * nominal` on top, still capped,
/// and the schedule never decreases.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    nominal: Duration,
    last: Duration,
    attempts: usize,
}

impl Backoff {
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            nominal: config.initial_delay.min(config.max_delay),
            last: Duration::ZERO,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_retries {
            if self.attempts >= max {
                return None;
            }
        }
        self.attempts += 1;

        let mut delay = self.nominal;
        if self.config.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(0.0..=self.config.jitter);
            delay = self.scaled(delay, 1.0 + spread);
        }
        delay = delay.max(self.last);
        self.last = delay;

        self.nominal = self.scaled(self.nominal, self.config.factor);
        Some(delay)
    }

    /// `delay * factor`, capped at `max_delay`. Factors that do not produce
    /// a valid duration (negative, NaN, overflowing) leave `delay` as is.
    fn scaled(&self, delay: Duration, factor: f64) -> Duration {
        match Duration::try_from_secs_f64(delay.as_secs_f64() * factor) {
            Ok(scaled) => scaled.min(self.config.max_delay),
            Err(_) if factor.is_finite() && factor > 1.0 => self.config.max_delay,
            Err(_) => delay.min(self.config.max_delay),
        }
    }

    /// Failures recorded so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Start over after a success.
    pub fn reset(&mut self) {
        *self = Self::new(&self.config);
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    // `max_retries` counts total attempts here, so the schedule needs one
    // delay fewer than that.
    let schedule = RetryConfig {
        max_retries: config.max_retries.map(|m| m.saturating_sub(1)),
        ..config.clone()
    };
    let mut backoff = Backoff::new(&schedule);

    loop {
        match operation().await {
            Ok(val) => {
                if backoff.attempts() > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, backoff.attempts());
                }
                return Ok(val);
            }
            Err(err) => {
                let Some(delay) = backoff.next_delay() else {
                    return Err(err);
                };

                match config.max_retries {
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name,
                        backoff.attempts(),
                        max,
                        err,
                        delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name,
                        backoff.attempts(),
                        err,
                        delay
                    ),
                }

                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> =
            retry("test_op", &RetryConfig::test(), || async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(TestError(format!("fail {}", count)))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(TestError("always fail".to_string()))
            }
        })
        .await;

        assert!(result.unwrap_err().0.contains("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::startup().max_retries, Some(5));
        assert!(RetryConfig::daemon().max_retries.is_none());
        assert_eq!(RetryConfig::query().max_retries, Some(3));
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            factor: 2.0,
            jitter: 0.0,
            max_retries: None,
        };
        let mut backoff = Backoff::new(&config);

        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.attempts(), 4);
    }

    #[test]
    fn test_backoff_stops_after_max_retries() {
        let mut backoff = Backoff::new(&RetryConfig::test());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_backoff_with_jitter_is_monotonic_and_capped() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(3),
            factor: 1.5,
            jitter: 0.5,
            max_retries: None,
        };
        let mut backoff = Backoff::new(&config);
        let mut prev = Duration::ZERO;
        for _ in 0..50 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= prev);
            assert!(delay <= config.max_delay);
            prev = delay;
        }
        assert_eq!(prev, config.max_delay);
    }

    #[test]
    fn test_backoff_survives_unusable_factors() {
        for factor in [-2.0, f64::NAN, f64::INFINITY, 1e300] {
            let config = RetryConfig {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                factor,
                jitter: 0.2,
                max_retries: None,
            };
            let mut backoff = Backoff::new(&config);
            for _ in 0..5 {
                let delay = backoff.next_delay().unwrap();
                assert!(delay <= config.max_delay, "factor {factor}");
            }
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(&RetryConfig::test());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1)));
    }
}

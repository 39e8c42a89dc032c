//! Retry executor with exponential backoff and jitter.

use crate::core::error::{AppError, Result};
use crate::core::metrics::get_metrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Jitter as a fraction of the computed delay (0.25 = ±25%)
    pub jitter: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
            backoff_factor: 2.0,
            jitter: 0.25,
        }
    }
}

/// Decides whether an error is worth another attempt.
pub type RetryCondition = fn(&AppError) -> bool;

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    options: RetryOptions,
    retry_condition: RetryCondition,
}

impl RetryExecutor {
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            retry_condition: AppError::is_retryable,
        }
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self::new(RetryOptions {
            max_attempts,
            ..RetryOptions::default()
        })
    }

    /// Replace the default condition (network errors, timeouts, 5xx).
    #[must_use]
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_condition = condition;
        self
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Delay after the 1-based `attempt` failed:
    /// `min(base * factor^(attempt-1), max)` with jitter, clamped to `[0, max]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max = self.options.max_delay.as_millis() as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = (self.options.base_delay.as_millis() as f64
            * self.options.backoff_factor.powi(exponent))
        .min(max);

        let jitter_range = (delay * self.options.jitter).abs();
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (delay + jitter).clamp(0.0, max);

        Duration::from_millis(final_delay as u64)
    }

    /// Run `operation` until it succeeds, the retry condition rejects the
    /// error, or attempts run out. The last error propagates unchanged.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.options.max_attempts.max(1);
        let metrics = get_metrics();

        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt, "Retry succeeded");
                        metrics.retry_attempts.with_label_values(&["recovered"]).inc();
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !(self.retry_condition)(&error) {
                        return Err(error);
                    }
                    if attempt >= max_attempts {
                        if max_attempts > 1 {
                            metrics.retry_attempts.with_label_values(&["exhausted"]).inc();
                        }
                        return Err(error);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after error"
                    );
                    metrics.retry_attempts.with_label_values(&["retried"]).inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryOptions::default())
    }
}

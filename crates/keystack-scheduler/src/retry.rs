//! Retry logic with exponential backoff for transient errors.

use keystack_core::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Backoff parameters for transient provider failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the given (0-indexed) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Run an operation, retrying transient errors with exponential backoff.
///
/// Non-transient errors are returned immediately. When every attempt fails
/// transiently the last error is escalated to `RetriesExhausted`.
/// `on_retry` receives the 1-indexed attempt that failed, the error and the
/// delay before the next attempt.
pub async fn with_retry<T, F, Fut, R>(config: &RetryConfig, mut on_retry: R, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut(u32, &Error, Duration),
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt + 1 >= max_attempts {
                    return Err(Error::RetriesExhausted {
                        attempts: max_attempts,
                        last: Box::new(e),
                    });
                }

                let delay = config.delay_for_attempt(attempt);
                on_retry(attempt + 1, &e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

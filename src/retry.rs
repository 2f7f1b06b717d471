//! Retry Policy
//!
//! Bounded retries with exponential backoff for the model calls. Every
//! attempt is also capped by a per-call timeout, so the worst case for one
//! call is `max_attempts × (timeout + max_delay)`.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, initial_delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            attempt_timeout,
            ..Self::default()
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    /// Delay after the given zero-based failed attempt.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay_ms = (self.initial_delay.as_millis() as f64)
            * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Run `operation` until it succeeds or attempts run out. Returns the
    /// last error message on exhaustion.
    pub async fn run<F, Fut, T, E>(&self, label: &str, mut operation: F) -> Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut last_error = String::from("no attempts made");

        for attempt in 0..self.max_attempts {
            match tokio::time::timeout(self.attempt_timeout, operation()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("timed out after {:?}", self.attempt_timeout)
                }
            }

            warn!(
                "{} attempt {}/{} failed: {}",
                label,
                attempt + 1,
                self.max_attempts,
                last_error
            );

            if attempt + 1 < self.max_attempts {
                let delay = self.delay_for_attempt(attempt);
                if !delay.is_zero() {
                    // Up to 10% jitter.
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                }
            }
        }

        Err(format!(
            "{} failed after {} attempts: {}",
            label, self.max_attempts, last_error
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_error() {
        let policy = RetryPolicy::immediate(3);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = policy
            .run("probe", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                        Err("temporary error".to_string())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_exhausted_reports_last_error() {
        let policy = RetryPolicy::immediate(2);
        let result: Result<(), String> = policy
            .run("probe", || async { Err::<(), _>("connection refused") })
            .await;

        let message = result.unwrap_err();
        assert!(message.contains("after 2 attempts"));
        assert!(message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_retry_attempt_timeout() {
        let mut policy = RetryPolicy::immediate(1);
        policy.attempt_timeout = Duration::from_millis(10);
        let result: Result<(), String> = policy
            .run("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), String>(())
            })
            .await;
        assert!(result.unwrap_err().contains("timed out"));
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(8));
    }
}

//! Reusable retry policy for backend calls.
//!
//! One [`RetryPolicy`] value describes how a stage retries: the attempt
//! limit, the exponential backoff curve, the per-call timeout, and the
//! predicate that decides which [`BackendError`]s are worth another try.
//! The embedding orchestrator, the vector-store synchronizer, the retrieval
//! engine and the answer composer all run their remote calls through it.
//!
//! Backoff doubles from `initial` and is capped at `max`:
//! `initial, 2×initial, 4×initial, …, max`.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::BackendError;

/// Exponential backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Backoff {
    pub const fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            factor: 1,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 1..retry {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.max {
                return self.max;
            }
        }
        delay.min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Deadline applied to every individual attempt.
    pub timeout: Option<Duration>,
    /// Which failures are retried. Defaults to [`BackendError::is_transient`].
    pub retry_if: fn(&BackendError) -> bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
            timeout: None,
            retry_if: BackendError::is_transient,
        }
    }

    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self::new(1, Backoff::none())
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Backoff {
                initial: Duration::from_millis(config.initial_backoff_ms),
                max: Duration::from_millis(config.max_backoff_ms),
                factor: 2,
            },
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_predicate(mut self, retry_if: fn(&BackendError) -> bool) -> Self {
        self.retry_if = retry_if;
        self
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// attempt limit is reached. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, label: &'static str, mut op: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout {
                        backend: label,
                        elapsed: limit,
                    }),
                },
                None => op().await,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= attempts || !(self.retry_if)(&err) {
                return Err(err);
            }

            let delay = self.backoff.delay(attempt);
            tracing::debug!(
                call = label,
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying backend call"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> BackendError {
        BackendError::Status {
            backend: "test",
            status: 503,
            body: "busy".to_string(),
        }
    }

    fn permanent() -> BackendError {
        BackendError::Status {
            backend: "test",
            status: 400,
            body: "bad input".to_string(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            factor: 2,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(30), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(4, Backoff::none());
        let result = policy
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(transient())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_at_attempt_limit() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Backoff::none());
        let result: Result<(), _> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Backoff::none());
        let result: Result<(), _> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(permanent()) }
            })
            .await;
        assert!(matches!(result, Err(BackendError::Status { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate_retries_everything() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Backoff::none()).with_predicate(|_| true);
        let _: Result<(), _> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(permanent()) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_call_times_out_and_is_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Backoff::none()).with_timeout(Duration::from_millis(10));
        let result: Result<(), _> = policy
            .run("slow", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                }
            })
            .await;
        assert!(matches!(
            result,
            Err(BackendError::Timeout { backend: "slow", .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

use std::future::Future;
use std::time::Duration;
use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use crate::upload::errors::{Result, UploadError};

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Cap for rate-limit backoff, `Retry-After` included
    pub max_rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_rate_limit_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (zero based), or `None` when `err`
    /// must not be retried.
    pub fn delay_for(&self, err: &UploadError, attempt: u32) -> Option<Duration> {
        if !err.is_retryable() {
            return None;
        }

        let delay = match err {
            UploadError::Server { status_code: 429, retry_after: Some(secs), .. } => {
                // 加随机抖动, 避免所有分片同时重试
                let jitter = rand::thread_rng().gen_range(0..1000);
                Duration::from_secs(*secs).min(self.max_rate_limit_delay) + Duration::from_millis(jitter)
            }
            err if err.is_rate_limited() => {
                self.exponential(attempt.saturating_add(2)).min(self.max_rate_limit_delay)
            }
            _ => self.exponential(attempt),
        };

        Some(delay)
    }

    fn exponential(&self, exponent: u32) -> Duration {
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// runs out of retries or `cancel` fires.
    pub async fn run<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                result = operation() => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= self.max_retries {
                return Err(err);
            }
            let Some(delay) = self.delay_for(&err, attempt) else {
                return Err(err);
            };

            warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "retrying request");

            tokio::select! {
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_delays() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(&UploadError::Timeout, 0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(&UploadError::Timeout, 3), Some(Duration::from_secs(8)));

        let limited = UploadError::rate_limited(None);
        assert_eq!(policy.delay_for(&limited, 0), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for(&limited, 2), Some(Duration::from_secs(16)));
        assert_eq!(policy.delay_for(&limited, 3), Some(Duration::from_secs(30)));

        let delay = policy.delay_for(&UploadError::rate_limited(Some(2)), 4).unwrap();
        assert!(delay >= Duration::from_secs(2) && delay < Duration::from_secs(3));

        assert_eq!(policy.delay_for(&UploadError::server_error(413, "too big"), 0), None);
    }

    #[test]
    fn test_retry_after_is_capped() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for(&UploadError::rate_limited(Some(u64::MAX)), 0).unwrap();
        assert!(delay >= Duration::from_secs(30) && delay < Duration::from_secs(31), "{delay:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_honoured() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = policy.run(&cancel, || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(UploadError::rate_limited(Some(2)))
                } else {
                    Ok(42)
                }
            }
        }).await;

        let elapsed = start.elapsed();
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(elapsed >= Duration::from_millis(2000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3000), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = policy.run(&cancel, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UploadError::server_error(400, "Invalid file"))
            }
        }).await;

        assert!(matches!(result, Err(UploadError::Server { status_code: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = policy.run(&cancel, || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(UploadError::Connection(format!("reset {n}")))
            }
        }).await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(UploadError::Connection(message)) => assert_eq!(message, "reset 3"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let run = {
            let cancel = cancel.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                policy.run(&cancel, || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(UploadError::Timeout)
                    }
                }).await
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();

        let result = run.await.unwrap();
        assert!(matches!(result, Err(UploadError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = policy.run(&cancel, || async { Ok(1) }).await;
        assert!(matches!(result, Err(UploadError::Cancelled)));
    }
}

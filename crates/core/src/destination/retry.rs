//! Bounded exponential backoff for destination API calls.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::errors::ClientError;

/// How often and how patiently a call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Transient failures: 429, any 5xx, and transport timeouts or
    /// connection failures. Every other error is permanent.
    pub fn is_retryable(error: &ClientError) -> bool {
        match error {
            ClientError::RateLimited { .. } => true,
            ClientError::Remote { status, .. } => *status >= 500,
            ClientError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            ClientError::Authentication(_)
            | ClientError::Conflict { .. }
            | ClientError::Parse(_)
            | ClientError::RetriesExhausted { .. } => false,
        }
    }

    /// Delay after the `attempt`-th failure (1-based): `base * 2^(attempt-1)`,
    /// or the server's `Retry-After`, capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32, error: &ClientError) -> Duration {
        if let ClientError::RateLimited {
            retry_after_secs: Some(secs),
            ..
        } = error
        {
            return Duration::from_secs(*secs).min(self.max_delay);
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !Self::is_retryable(&e) => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    warn!(operation, attempts = attempt, error = %e, "retries exhausted");
                    return Err(ClientError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_after(attempt, &e);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn remote(status: u16) -> ClientError {
        ClientError::Remote {
            status,
            body: String::new(),
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_classification() {
        assert!(RetryPolicy::is_retryable(&remote(500)));
        assert!(RetryPolicy::is_retryable(&remote(503)));
        assert!(RetryPolicy::is_retryable(&ClientError::RateLimited {
            retry_after_secs: None,
            body: String::new()
        }));
        assert!(!RetryPolicy::is_retryable(&remote(400)));
        assert!(!RetryPolicy::is_retryable(&remote(404)));
        assert!(!RetryPolicy::is_retryable(&ClientError::Conflict {
            email: "a@x.com".into()
        }));
        assert!(!RetryPolicy::is_retryable(&ClientError::Authentication(
            "HTTP 401".into()
        )));
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3_000),
        };
        let err = remote(503);
        assert_eq!(policy.delay_after(1, &err), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2, &err), Duration::from_millis(1_000));
        assert_eq!(policy.delay_after(3, &err), Duration::from_millis(2_000));
        assert_eq!(policy.delay_after(4, &err), Duration::from_millis(3_000));
        assert_eq!(policy.delay_after(40, &err), Duration::from_millis(3_000));
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        };
        let err = ClientError::RateLimited {
            retry_after_secs: Some(2),
            body: String::new(),
        };
        assert_eq!(policy.delay_after(1, &err), Duration::from_secs(2));

        let err = ClientError::RateLimited {
            retry_after_secs: Some(3600),
            body: String::new(),
        };
        assert_eq!(policy.delay_after(1, &err), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_two_transient_failures_then_success() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run("create_user", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(remote(503))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("set_password", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(remote(422))
            })
            .await;
        assert!(matches!(result, Err(ClientError::Remote { status: 422, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("create_user", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(remote(502))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(ClientError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last.status(), Some(502));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_attempts_config_still_tries_once() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 0,
            base_delay_ms: 1,
            max_delay_ms: 1,
        });
        assert_eq!(policy.max_attempts, 1);
    }
}

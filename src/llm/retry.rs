use crate::config::LlmConfig;
use reqwest::StatusCode;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of a single failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// Worth retrying: network error, timeout, 408/429/5xx, empty response
    Transient(String),
    /// Retrying cannot help: other 4xx, malformed request
    Permanent(String),
}

impl AttemptError {
    pub fn message(&self) -> &str {
        match self {
            AttemptError::Transient(m) | AttemptError::Permanent(m) => m,
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body);
        if is_retryable_status(status) {
            AttemptError::Transient(message)
        } else {
            AttemptError::Permanent(message)
        }
    }

    /// Classify a transport error from reqwest.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            AttemptError::Transient(format!("Request timed out: {}", err))
        } else if err.is_connect() || err.is_request() {
            AttemptError::Transient(format!("Network error: {}", err))
        } else if err.is_decode() {
            AttemptError::Permanent(format!("Failed to parse response: {}", err))
        } else {
            AttemptError::Transient(format!("Network error: {}", err))
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Why [`RetryPolicy::run`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Permanent failure, or the last allowed attempt failed
    Failed { attempts: usize, last: AttemptError },
    /// Stopped while waiting for the next attempt
    Cancelled { attempts: usize },
}

impl RetryError {
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Failed { attempts, .. } | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

impl fmt::Display for RetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Failed { attempts, last } => write!(f, "failed after {} attempt(s): {}", attempts, last),
            RetryError::Cancelled { attempts } => write!(f, "cancelled after {} attempt(s)", attempts),
        }
    }
}

/// 408, 429, and every 5xx are retried; other statuses are not.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// Bounded exponential backoff.
///
/// `max_attempts` counts the first call. The delay before attempt `n + 1` is
/// `initial_delay * 2^(n - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(llm: &LlmConfig) -> Self {
        Self {
            max_attempts: llm.max_retries.max(1),
            initial_delay: Duration::from_millis(llm.initial_retry_delay_ms),
            max_delay: Duration::from_millis(llm.max_retry_delay_ms),
        }
    }

    /// Delay after the `failed_attempt`-th failure (1-based).
    pub fn delay_after(&self, failed_attempt: usize) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31) as u32;
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        self.run_until_cancelled(label, &CancellationToken::new(), op).await
    }

    /// Like [`run`](Self::run), but no attempt after the first is started
    /// once `cancel` fires; a pending backoff is cut short.
    pub async fn run_until_cancelled<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let start = std::time::Instant::now();
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    log::debug!("{} succeeded in {:?} (attempt {})", label, start.elapsed(), attempt);
                    return Ok(value);
                }
                Err(AttemptError::Transient(msg)) if attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    log::warn!(
                        "{}: retry {}/{} in {:?} after error: {}",
                        label,
                        attempt,
                        self.max_attempts - 1,
                        delay,
                        msg
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if cancel.is_cancelled() {
                        log::debug!("{} cancelled after {} attempt(s)", label, attempt);
                        return Err(RetryError::Cancelled { attempts: attempt });
                    }
                    attempt += 1;
                }
                Err(last) => {
                    log::debug!("{} failed after {} attempt(s): {}", label, attempt, last);
                    return Err(RetryError::Failed { attempts: attempt, last });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(30_000),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_after(4), Duration::from_millis(16_000));
        assert_eq!(policy.delay_after(5), Duration::from_millis(30_000));
        assert_eq!(policy.delay_after(60), Duration::from_millis(30_000));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_from_status_classification() {
        assert!(matches!(
            AttemptError::from_status(StatusCode::BAD_GATEWAY, "oops"),
            AttemptError::Transient(_)
        ));
        let permanent = AttemptError::from_status(StatusCode::FORBIDDEN, "denied");
        assert!(matches!(permanent, AttemptError::Permanent(_)));
        assert!(permanent.to_string().contains("denied"));
    }

    #[tokio::test]
    async fn test_run_retries_transient_then_succeeds() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = fast_policy(3)
            .run("test", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(AttemptError::Transient("503".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_attempts() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast_policy(3)
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AttemptError::Transient("timeout".into()))
            })
            .await;
        assert_eq!(
            result,
            Err(RetryError::Failed {
                attempts: 3,
                last: AttemptError::Transient("timeout".into())
            })
        );
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_permanent_error() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast_policy(5)
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AttemptError::Permanent("401".into()))
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Failed { last: AttemptError::Permanent(_), .. }));
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.to_string(), "failed after 1 attempt(s): 401");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_attempt_stops_retries() {
        let cancel = CancellationToken::new();
        let counter = AtomicUsize::new(0);
        let (calls, token) = (&counter, &cancel);
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
        };
        let result: Result<(), _> = policy
            .run_until_cancelled("test", &cancel, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                token.cancel();
                Err(AttemptError::Transient("503".into()))
            })
            .await;
        assert_eq!(result, Err(RetryError::Cancelled { attempts: 1 }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_cuts_backoff_short() {
        let cancel = CancellationToken::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let result: Result<(), _> = policy
            .run_until_cancelled("test", &cancel, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AttemptError::Transient("429".into()))
            })
            .await;
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(result, Err(RetryError::Cancelled { attempts: 1 }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

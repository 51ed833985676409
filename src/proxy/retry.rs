use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::{GatewayError, Result};

/// Bounded-attempt retry with exponential backoff and jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `attempt` up to `max_attempts` times, sleeping between retryable
    /// failures. The first success or non-retryable error ends the loop; the
    /// last error is returned when attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt_no = 0;

        loop {
            let err = match attempt(attempt_no).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_retryable(&err) {
                return Err(err);
            }

            attempt_no += 1;
            if attempt_no >= max_attempts {
                return Err(err);
            }

            let delay = self.delay(attempt_no - 1);
            debug!(attempt = attempt_no, ?delay, error = %err, "retrying after backoff");
            tokio::time::sleep(delay).await;
        }
    }

    /// `delay(k) = min(initial * multiplier^k, max)`, with optional +/-25%
    /// uniform jitter. Attempt numbering starts at 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay.as_secs_f64()
            * self.config.multiplier.powi(attempt as i32);
        let capped = base.min(self.config.max_delay.as_secs_f64());

        let with_jitter = if self.config.jitter {
            capped + capped * rand::thread_rng().gen_range(-0.25..=0.25)
        } else {
            capped
        };

        Duration::from_secs_f64(with_jitter.max(0.0))
    }
}

/// Classify an attempt error as retryable.
///
/// Typed kinds are decided here; opaque transport messages fall back to the
/// substring patterns the gateway has always recognized.
pub fn is_retryable(err: &GatewayError) -> bool {
    match err {
        GatewayError::NoAvailableBackend
        | GatewayError::BulkheadFull
        | GatewayError::BulkheadQueueTimeout
        | GatewayError::BackendTimeout
        | GatewayError::ConnectFailed(_) => true,
        GatewayError::UpstreamStatus(status) => *status >= 500,
        GatewayError::Transport(message) => is_retryable_message(message),
        _ => false,
    }
}

const RETRYABLE_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timeout",
    "no such host",
    "network is unreachable",
    "i/o timeout",
    "eof",
];

fn is_retryable_message(message: &str) -> bool {
    let message = message.to_lowercase();
    RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32, jitter: bool) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter,
        })
    }

    #[tokio::test]
    async fn returns_first_success_without_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = policy(3, false)
            .run(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, GatewayError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_retryable_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = policy(3, false)
            .run(|_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(GatewayError::UpstreamStatus(500))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = policy(3, false)
            .run(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::UpstreamStatus(503))
                }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::UpstreamStatus(503))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_immediately_on_non_retryable_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = policy(3, false)
            .run(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::RequestTimeout)
                }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::RequestTimeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: false,
        });

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay(10), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_the_delay() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        });

        for _ in 0..100 {
            let delay = policy.delay(0).as_secs_f64();
            assert!((0.075..=0.125).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn classifies_retryable_kinds() {
        assert!(is_retryable(&GatewayError::NoAvailableBackend));
        assert!(is_retryable(&GatewayError::BulkheadFull));
        assert!(is_retryable(&GatewayError::BulkheadQueueTimeout));
        assert!(is_retryable(&GatewayError::BackendTimeout));
        assert!(is_retryable(&GatewayError::ConnectFailed("refused".into())));
        assert!(is_retryable(&GatewayError::UpstreamStatus(500)));
        assert!(is_retryable(&GatewayError::UpstreamStatus(599)));

        assert!(!is_retryable(&GatewayError::RequestTimeout));
        assert!(!is_retryable(&GatewayError::RouteNotFound("/x".into())));
        assert!(!is_retryable(&GatewayError::ResponseTooLarge));
    }

    #[test]
    fn classifies_transport_messages_by_substring() {
        let retryable = [
            "Connection refused (os error 111)",
            "connection reset by peer",
            "no such host",
            "network is unreachable",
            "i/o timeout while reading",
            "unexpected EOF",
        ];
        for message in retryable {
            assert!(
                is_retryable(&GatewayError::Transport(message.to_string())),
                "{} should be retryable",
                message
            );
        }

        assert!(!is_retryable(&GatewayError::Transport(
            "certificate verify failed".to_string()
        )));
    }
}

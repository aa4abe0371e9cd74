//! Retry utilities with exponential backoff for resilient API calls.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::sources::SourceError;

/// Configuration for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    /// Upper bound for the exponential delay
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Random extra delay as a fraction of the computed delay (0.0 disables)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    ///
    /// Never shorter than a delay the provider asked for.
    pub fn delay_for(&self, attempt: u32, error: &SourceError) -> Duration {
        let exp = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let mut secs = exp.min(self.max_delay.as_secs_f64());
        if self.jitter > 0.0 {
            secs *= 1.0 + rand::thread_rng().gen_range(0.0..=self.jitter);
        }
        let delay = Duration::from_secs_f64(secs.max(0.0));
        match error.retry_after() {
            Some(requested) => delay.max(requested),
            None => delay,
        }
    }
}

/// Execute an async operation, retrying transient and rate-limit failures.
///
/// Permanent errors return immediately. A cancelled token interrupts the
/// backoff sleep and returns the last error.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SourceError>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    tracing::info!(
                        "Operation succeeded on attempt {} after {} transient failures",
                        attempts,
                        attempts - 1
                    );
                }
                return Ok(result);
            }
            Err(error) if !error.is_retryable() => return Err(error),
            Err(error) => {
                if attempts >= config.max_attempts.max(1) {
                    tracing::warn!("Operation failed after {} attempts: {}", attempts, error);
                    return Err(error);
                }

                let delay = config.delay_for(attempts, &error);
                tracing::debug!(
                    "Retryable error on attempt {}: {}, retrying in {:?}",
                    attempts,
                    error,
                    delay
                );

                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(error),
                }
            }
        }
    }
}

/// Serde helper storing a [`Duration`] as fractional seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        };
        let err = SourceError::Transient("x".into());
        assert_eq!(config.delay_for(1, &err), Duration::from_secs(1));
        assert_eq!(config.delay_for(2, &err), Duration::from_secs(2));
        assert_eq!(config.delay_for(3, &err), Duration::from_secs(4));
        assert_eq!(config.delay_for(20, &err), Duration::from_secs(60));
    }

    #[test]
    fn test_delay_honors_retry_after() {
        let config = fast_config(3);
        let err = SourceError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(config.delay_for(1, &err), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = RetryConfig {
            jitter: 0.5,
            ..RetryConfig::default()
        };
        let err = SourceError::Transient("x".into());
        for _ in 0..50 {
            let delay = config.delay_for(1, &err);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry(&fast_config(5), &CancellationToken::new(), || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SourceError::Transient("503".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = with_retry(&fast_config(3), &CancellationToken::new(), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::RateLimited { retry_after: None })
            }
        })
        .await;

        assert_eq!(result, Err(SourceError::RateLimited { retry_after: None }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = with_retry(&fast_config(5), &CancellationToken::new(), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::AuthFailure("401".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(SourceError::AuthFailure(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
            ..fast_config(5)
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = std::time::Instant::now();
        let result: Result<(), _> = with_retry(&config, &cancel, || async {
            Err(SourceError::Transient("down".into()))
        })
        .await;

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

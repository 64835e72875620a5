//! Bounded retries and timeouts for async operations.

use std::future::Future;
use std::time::{Duration, SystemTime};

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::CommonError;

/// Exponential delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub base: Duration,
    /// Upper bound for any single delay (before jitter).
    pub cap: Duration,
    /// Growth factor per attempt.
    pub factor: u32,
    /// Add up to 25% random extra to each delay.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(8),
            factor: 2,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Constant delay, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            cap: delay,
            factor: 1,
            jitter: false,
        }
    }

    /// Delay to wait before `attempt` (1-indexed; the first attempt never waits).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let growth = self.factor.max(1).saturating_pow(attempt - 2);
        let delay = self.base.saturating_mul(growth).min(self.cap);

        if self.jitter {
            delay + delay.mul_f64(0.25 * unit_noise())
        } else {
            delay
        }
    }
}

// Clock-derived noise in [0, 1]; only used to spread retries apart.
fn unit_noise() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos) / 1_000_000_000.0
}

/// Attempt budget plus delay schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfig {
    /// A single attempt.
    pub fn none() -> Self {
        Self::attempts(1)
    }

    /// `max_attempts` attempts (at least one) with the default schedule.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Retry `operation` on every error until the attempt budget runs out.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_when(config, |_| true, operation).await
}

/// Retry `operation` while `retryable` accepts the error.
///
/// A rejected error is returned at once. The operation always runs at least once.
pub async fn retry_when<T, E, F, Fut, P>(
    config: &RetryConfig,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if attempt >= max_attempts || !retryable(&error) {
            warn!(attempt, max_attempts, error = %error, "Giving up");
            return Err(error);
        }

        attempt += 1;
        let delay = config.backoff.delay_before(attempt);
        debug!(attempt, ?delay, error = %error, "Attempt failed, retrying");
        sleep(delay).await;
    }
}

/// Run an operation with a deadline.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> Result<T, CommonError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| CommonError::Timeout(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(attempts: u32) -> RetryConfig {
        RetryConfig::attempts(attempts).with_backoff(Backoff::fixed(Duration::from_millis(1)))
    }

    #[test]
    fn test_attempt_floor() {
        assert_eq!(RetryConfig::none().max_attempts, 1);
        assert_eq!(RetryConfig::attempts(0).max_attempts, 1);
    }

    #[test]
    fn test_exponential_schedule() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(350),
            factor: 2,
            jitter: false,
        };

        assert_eq!(backoff.delay_before(1), Duration::ZERO);
        assert_eq!(backoff.delay_before(2), Duration::from_millis(100));
        assert_eq!(backoff.delay_before(3), Duration::from_millis(200));
        assert_eq!(backoff.delay_before(4), Duration::from_millis(350));
        assert_eq!(backoff.delay_before(40), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_bounded() {
        let backoff = Backoff {
            jitter: true,
            ..Backoff::fixed(Duration::from_millis(400))
        };
        let delay = backoff.delay_before(2);
        assert!(delay >= Duration::from_millis(400));
        assert!(delay <= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_single_attempt_gives_up() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<(), &str> = retry_with_backoff(&RetryConfig::none(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err("unavailable") }
        })
        .await;

        assert_eq!(result, Err("unavailable"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<&str, &str> = retry_with_backoff(&quick(3), || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err("503")
                } else {
                    Ok("token")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("token"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejected_error_stops_early() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<(), &str> = retry_when(&quick(5), |e| *e != "unsupported", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err("unsupported") }
        })
        .await;

        assert_eq!(result, Err("unsupported"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let result = with_timeout(Duration::from_millis(10), || async {
            sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert_eq!(result, Err(CommonError::Timeout(Duration::from_millis(10))));
    }
}

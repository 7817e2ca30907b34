//! Exponential backoff with jitter for startup calls
//!
//! The reconciler itself never retries inline; failed passes go back to the
//! controller queue. Startup work (listing sessions to rebuild state,
//! installing the CRD) happens before the queue exists and uses this module
//! instead.
//!
//! ```ignore
//! use peernet::retry::{retry_if, RetryConfig};
//!
//! let sessions = retry_if(&RetryConfig::startup(), "list_sessions", Error::is_retryable, || async {
//!     client.list_sessions().await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff policy
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Growth factor applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry up to `attempts` times
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Retry forever
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Policy for calls made before the controller starts
    pub fn startup() -> Self {
        Self {
            max_attempts: 8,
            max_delay: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run `operation` until it succeeds or the attempt budget is spent.
///
/// Returns the last error once `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(config, operation_name, |_| true, operation).await
}

/// Like [`retry_with_backoff`], but gives up at once on errors for which
/// `retryable` returns false.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !retryable(&e) {
            error!(operation = %operation_name, attempt, error = %e, "operation failed permanently");
            return Err(e);
        }
        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(operation = %operation_name, attempt, error = %e, "operation failed after max retries");
            return Err(e);
        }

        // 0.5x to 1.5x
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = jittered.as_millis(),
            "operation failed, retrying"
        );

        tokio::time::sleep(jittered).await;
        delay = config.next_delay(delay);
    }
}

//! Retry and deadline helpers for network transfers.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::CacheKitError;

/// Backoff schedule for re-attempting a failed transfer.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt; each later one doubles it.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to sleep before the given 1-based attempt. The first attempt
    /// never waits; later ones double the initial delay, capped at
    /// `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let doublings = (attempt - 2).min(31);
        self.initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or the attempts are exhausted,
/// sleeping per the backoff schedule in between. Returns the last error
/// when every attempt fails.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        let delay = config.delay_before(attempt);
        if !delay.is_zero() {
            debug!(attempt, ?delay, "Backing off before retry");
            sleep(delay).await;
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < config.max_attempts => {
                warn!(attempt, error = %err, "Attempt failed, retrying");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Bound `operation` by a deadline, mapping expiry to
/// [`CacheKitError::Timeout`].
pub async fn with_timeout<T, F, Fut>(
    timeout: Duration,
    operation: F,
) -> Result<T, CacheKitError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| CacheKitError::Timeout(timeout))
}

//! Fixed-interval retry for control API operations

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::BurrowError;

/// How many times a tunnel operation is re-attempted and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts made after the first failure
    pub max_retries: u32,
    /// Constant delay between attempts
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
        }
    }

    /// Total number of attempts, first one included
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. The last error is returned unchanged.
///
/// `op` receives the zero-based attempt number. The cancellation token is
/// checked before every attempt and raced against every sleep.
pub async fn retry_fixed<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    tunnel: &str,
    mut op: F,
) -> Result<T, BurrowError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BurrowError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(BurrowError::Cancelled {
                tunnel: tunnel.to_string(),
            });
        }

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() || attempt >= policy.max_retries {
            return Err(err);
        }

        tracing::debug!(
            tunnel = %tunnel,
            attempt = attempt + 1,
            max_attempts = policy.max_attempts(),
            error = %err,
            "Attempt failed, retrying in {:?}",
            policy.interval
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BurrowError::Cancelled {
                    tunnel: tunnel.to_string(),
                });
            }
            _ = tokio::time::sleep(policy.interval) => {}
        }

        attempt += 1;
    }
}

//! Bounded exponential backoff shared by reconnects, status publishing and
//! RPC polling.

use crate::error::{TaproomError, TaproomResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry spacing policy.
///
/// Delay before retry `n` (1-based) is `starting_timeout * 2^(n - 1)`, capped
/// at `max_timeout`. At most `max_attempts` attempts are made, so the total
/// time spent sleeping never exceeds `max_attempts * max_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub starting_timeout: Duration,
    pub max_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            starting_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(starting_timeout: Duration, max_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            starting_timeout,
            max_timeout,
            max_attempts,
        }
    }

    pub fn validate(&self) -> TaproomResult<()> {
        if self.max_attempts == 0 {
            return Err(TaproomError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.starting_timeout > self.max_timeout {
            return Err(TaproomError::Config(format!(
                "starting_timeout ({:?}) exceeds max_timeout ({:?})",
                self.starting_timeout, self.max_timeout
            )));
        }
        Ok(())
    }

    /// Delay to wait before retry number `retry` (1-based). Zero for 0.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let shift = (retry - 1).min(31);
        let base_ms = self.starting_timeout.as_millis() as u64;
        let max_ms = self.max_timeout.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        Duration::from_millis(delay_ms)
    }

    /// Upper bound on total backoff time for one retry loop.
    pub fn max_total_delay(&self) -> Duration {
        self.max_timeout.saturating_mul(self.max_attempts)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or
    /// `max_attempts` attempts were made.
    ///
    /// Every retry is logged at WARN. Exhaustion is returned as
    /// [`TaproomError::RetriesExhausted`] without logging; the caller
    /// reports it.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> TaproomResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TaproomResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempt >= max_attempts {
                        return Err(TaproomError::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = operation,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

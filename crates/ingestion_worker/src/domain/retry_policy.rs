use common::domain::{DomainError, DomainResult};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Bounded retry with exponential backoff around a storage call.
///
/// The delay after the n-th failed attempt is `min_delay * coefficient^(n-1)`,
/// clamped to `[min_delay, max_delay]`. Only transient errors are retried.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    min_delay: Duration,
    max_delay: Duration,
    backoff_coefficient: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_delay,
            max_delay: max_delay.max(min_delay),
            backoff_coefficient: 2,
        }
    }

    pub fn with_backoff_coefficient(mut self, coefficient: u32) -> Self {
        self.backoff_coefficient = coefficient.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after `failed_attempt` (1-based) before trying again
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        let factor = self
            .backoff_coefficient
            .checked_pow(exponent)
            .unwrap_or(u32::MAX);
        self.min_delay
            .saturating_mul(factor)
            .clamp(self.min_delay, self.max_delay)
    }

    /// Run `operation` until it succeeds, fails permanently, or the attempt cap
    /// is reached. Exhausting the cap yields [`DomainError::RetriesExhausted`].
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> DomainResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DomainResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    return Err(DomainError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(10))
    }
}

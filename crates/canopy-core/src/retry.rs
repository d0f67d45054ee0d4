//! Bounded retry with exponential backoff.
//!
//! Backoff doubles per attempt from `backoff` and is capped at `2^5`
//! multiples: `b, 2b, 4b, 8b, 16b, 32b, 32b, …`.

use std::future::Future;
use std::time::Duration;

/// Retry count and base backoff for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `retries + 1`).
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay before attempt number `attempt` (0-based; attempt 0 has none).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.backoff.saturating_mul(1u32 << (attempt - 1).min(5))
    }

    /// Run `op` until it succeeds, `should_retry` rejects the error, or
    /// attempts run out. Returns the last error with the attempt count.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, should_retry: P) -> Result<T, (E, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            let delay = self.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts() || !should_retry(&e) {
                        return Err((e, attempt));
                    }
                }
            }
        }
    }
}

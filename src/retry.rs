//! Explicit retry policy for transient collaborator calls.
//!
//! Every backend call site that may hit a transient failure wraps the call in
//! [`RetryPolicy::run`] with a predicate selecting which errors are worth
//! retrying. Fatal errors propagate on the first attempt.

use std::time::Duration;

use tracing::warn;

/// Default exponential multiplier when not overridden
pub const DEFAULT_EXPONENTIAL_MULTIPLIER: f64 = 2.0;

/// Bounded exponential-backoff retry policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Exponential growth factor between attempts.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: DEFAULT_EXPONENTIAL_MULTIPLIER,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (1-based; attempt 1 has no delay).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2) as f64;
        let factor = self.multiplier.powf(exp);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }

    /// Run `op`, retrying while `is_transient` holds and attempts remain.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && is_transient(&err) => {
                    let delay = self.delay_for(attempt + 1);
                    warn!(
                        call = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

//! Bounded retry with a fixed inter-attempt delay
//!
//! This is the only recovery mechanism in the crate. Attempts run strictly
//! one after another on the calling thread.

use std::time::Duration;

use tracing::debug;

use crate::constants::{DEFAULT_RETRY_DELAY, DEFAULT_STAGE_ATTEMPTS};
use crate::error::RetryExhausted;

/// Attempt budget and delay for one retried operation.
///
/// # Example
///
/// ```rust
/// use sensor_readdress::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3).with_delay(Duration::from_millis(50));
/// assert_eq!(policy.max_attempts, 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Sleep between two attempts
    pub delay: Duration,
}

impl RetryPolicy {
    /// Policy with the default 100 ms delay
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Set the inter-attempt delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Attempts actually made; a zero budget still runs once.
    #[inline]
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_STAGE_ATTEMPTS)
    }
}

/// Outcome of one attempt that failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<E> {
    /// Worth trying again
    Retry(E),
    /// Stop now, retrying cannot help
    Fatal(E),
}

/// Run `operation` under `policy`, sleeping the calling thread between attempts.
///
/// Returns the first success, or the last error once the budget is spent.
pub fn retry<T, E, F>(policy: &RetryPolicy, operation: F) -> Result<T, RetryExhausted<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Result<T, E>,
{
    retry_with_sleep(policy, std::thread::sleep, operation)
}

/// [`retry`] with an injectable sleep function.
pub fn retry_with_sleep<T, E, F, S>(
    policy: &RetryPolicy,
    sleep: S,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Result<T, E>,
    S: FnMut(Duration),
{
    retry_classified(policy, sleep, |attempt| operation(attempt).map_err(Attempt::Retry))
}

/// Core loop: like [`retry_with_sleep`], but the operation may end the loop
/// early by returning [`Attempt::Fatal`].
///
/// `operation` receives the 1-based attempt number.
pub fn retry_classified<T, E, F, S>(
    policy: &RetryPolicy,
    mut sleep: S,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Result<T, Attempt<E>>,
    S: FnMut(Duration),
{
    let max_attempts = policy.effective_attempts();
    let mut attempt = 1;

    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(e)) => {
                debug!(attempt, max_attempts, error = %e, "Attempt failed fatally, not retrying");
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(Attempt::Retry(e)) => {
                debug!(attempt, max_attempts, error = %e, "Attempt failed");
                if attempt >= max_attempts {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
            }
        }

        if !policy.delay.is_zero() {
            sleep(policy.delay);
        }
        attempt += 1;
    }
}

//! Bounded retry-with-delay
//!
//! Runs an operation up to `max_retry + 1` times with a fixed pause between
//! attempts. There is no backoff growth and no jitter: `N` retries observe
//! exactly `N` delays of `retry_delay`.

use crate::error::{RetryError, Retryable};
use std::fmt::Display;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRY: u32 = 4;

/// Default pause between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Retry policy for connection establishment
///
/// Immutable once handed to a connection owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt
    pub max_retry: u32,
    /// Pause between two consecutive attempts
    pub retry_delay: Duration,
    /// Accept a peer whose protocol version differs from ours
    pub ignore_version: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            retry_delay: DEFAULT_RETRY_DELAY,
            ignore_version: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given retry budget and delay
    pub fn new(max_retry: u32, retry_delay: Duration) -> Self {
        Self {
            max_retry,
            retry_delay,
            ignore_version: false,
        }
    }

    /// Same policy, tolerating protocol version mismatches
    pub fn ignoring_version(mut self) -> Self {
        self.ignore_version = true;
        self
    }

    /// Total number of attempts this policy permits
    pub fn max_attempts(&self) -> u32 {
        self.max_retry.saturating_add(1)
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted
///
/// `op` receives the 1-based attempt number. The delay is slept only between
/// attempts, never after the last one.
///
/// # Example
///
/// ```
/// use rmem_core_resilience::{retry_with_delay, RetryPolicy, Retryable};
/// use std::time::Duration;
///
/// #[derive(Debug)]
/// struct Flaky;
///
/// impl std::fmt::Display for Flaky {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "flaky")
///     }
/// }
///
/// impl Retryable for Flaky {
///     fn is_retryable(&self) -> bool {
///         true
///     }
/// }
///
/// let policy = RetryPolicy::new(2, Duration::from_millis(1));
/// let value = retry_with_delay(&policy, |attempt| {
///     if attempt < 3 { Err(Flaky) } else { Ok(attempt) }
/// })
/// .unwrap();
/// assert_eq!(value, 3);
/// ```
pub fn retry_with_delay<T, E, F>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Result<T, E>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match op(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!("Succeeded on attempt {} of {}", attempt, max_attempts);
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                return Err(RetryError::Aborted { attempt, error: e });
            }
            Err(e) if attempt >= max_attempts => {
                warn!("Giving up after {} attempts: {}", attempt, e);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                warn!(
                    "Attempt {} of {} failed: {}; retrying in {:?}",
                    attempt, max_attempts, e, policy.retry_delay
                );
                if !policy.retry_delay.is_zero() {
                    thread::sleep(policy.retry_delay);
                }
            }
        }
    }
}

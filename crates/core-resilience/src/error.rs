//! Error types for the retry primitives

use thiserror::Error;

/// Classification hook for errors flowing through [`crate::retry_with_delay`]
pub trait Retryable {
    /// Whether another attempt may succeed where this one failed
    fn is_retryable(&self) -> bool;
}

/// Why a retried operation finally failed
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// Every permitted attempt failed with a retryable error
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// An attempt failed with an error that retrying cannot fix
    #[error("aborted on attempt {attempt}: {error}")]
    Aborted { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Aborted { attempt, .. } => *attempt,
        }
    }

    /// True when the loop stopped because the budget ran out
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// Unwrap the underlying error of the final attempt
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { error, .. } => error,
        }
    }
}

//! rmem Core Resilience: Pure-logic retry primitives
//!
//! # Overview
//!
//! This crate holds the retry building block used by the rmem connection
//! layer:
//!
//! - **RetryPolicy**: how many times to retry, how long to wait in between,
//!   and whether a protocol version mismatch is tolerated
//! - **retry_with_delay**: a blocking loop that runs an operation until it
//!   succeeds, fails permanently, or runs out of attempts
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Transports and sockets
//! - The remote registry and its objects
//!
//! Callers decide which of their errors are worth retrying by implementing
//! [`Retryable`].
//!
//! # Usage Example
//!
//! ```no_run
//! use rmem_core_resilience::{retry_with_delay, RetryError, RetryPolicy, Retryable};
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct Unreachable;
//!
//! impl std::fmt::Display for Unreachable {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "endpoint unreachable")
//!     }
//! }
//!
//! impl Retryable for Unreachable {
//!     fn is_retryable(&self) -> bool {
//!         true
//!     }
//! }
//!
//! let policy = RetryPolicy::new(4, Duration::from_secs(3));
//! let result: Result<(), RetryError<Unreachable>> =
//!     retry_with_delay(&policy, |_attempt| Err(Unreachable));
//! assert_eq!(result.unwrap_err().attempts(), 5);
//! ```

pub mod error;
pub mod retry;

pub use error::{RetryError, Retryable};
pub use retry::{retry_with_delay, RetryPolicy, DEFAULT_MAX_RETRY, DEFAULT_RETRY_DELAY};

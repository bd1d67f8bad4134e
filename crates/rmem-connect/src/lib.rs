//! rmem Connect: client-side connectivity to an rmem registry endpoint
//!
//! This crate provides the client side of the connection layer:
//!
//! # Architecture
//!
//! - **RemoteChannel / Connector**: the seam a transport implements. One channel
//!   is one sequential connection to a registry endpoint.
//! - **ConnectionGuardian**: owns one channel, performs the versioned handshake,
//!   retries connection setup, and transparently reconnects once when a call
//!   hits a transport failure.
//! - **protocol**: the values exchanged with the endpoint (`Arg`, `Reply`,
//!   `RemoteRef`, `Operation`).
//!
//! # Example
//!
//! ```rust,no_run
//! use rmem_connect::{Arg, ConnectionGuardian, Connector};
//! use rmem_core_resilience::RetryPolicy;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn example(connector: Arc<dyn Connector>) -> Result<(), rmem_connect::ConnectError> {
//!     let policy = RetryPolicy::new(4, Duration::from_secs(3));
//!     let guardian = ConnectionGuardian::connect(connector, "10.0.0.5", 18812, policy)?;
//!
//!     guardian.memoize("visits", Arg::from(0))?;
//!     println!("registry holds visits: {}", guardian.is_memoized("visits")?);
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod error;
pub mod guardian;
pub mod protocol;

pub use channel::{Connector, RemoteChannel};
pub use error::{ChannelError, ConnectError, RemoteError, RemoteErrorKind};
pub use guardian::{ConnectionGuardian, GuardianStats};
pub use protocol::{
    Arg, BinaryOp, CompareOp, Operation, ProtocolVersion, RemoteRef, Reply, Reservation,
    UnaryOp, PROTOCOL_VERSION,
};

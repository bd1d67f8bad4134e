//! The remote-call channel seam
//!
//! A [`RemoteChannel`] is one live, sequential connection to a registry
//! endpoint. The transport behind it (sockets, pipes, in-process) and its
//! serialization are the implementor's business; callers only see the
//! endpoint operations below.
//!
//! # Example
//!
//! ```rust,no_run
//! use rmem_connect::{Arg, ChannelError, Connector};
//!
//! fn publish(connector: &dyn Connector) -> Result<(), ChannelError> {
//!     let mut channel = connector.connect("10.0.0.5", 18812)?;
//!     channel.memoize("counter", Arg::from(0))?;
//!     let counter = channel.get("counter")?;
//!     println!("counter lives at {}", counter);
//!     channel.close()
//! }
//! ```

use crate::error::ChannelError;
use crate::protocol::{Arg, Operation, ProtocolVersion, RemoteRef, Reply, Reservation};

/// One live connection to a registry endpoint
///
/// Calls are issued and answered in order. Implementations report a closed or
/// broken connection as [`ChannelError::Transport`] and failures raised by the
/// endpoint as [`ChannelError::Remote`].
pub trait RemoteChannel: Send {
    /// Protocol version of the endpoint, used for the handshake
    fn protocol_version(&mut self) -> Result<ProtocolVersion, ChannelError>;

    /// Map `key` to `obj` unless it is already mapped; return the mapped object
    fn memoize(&mut self, key: &str, obj: Arg) -> Result<RemoteRef, ChannelError>;

    /// Map `key` to a placeholder unless it is already mapped
    ///
    /// Callers holding a granted token create the object and then
    /// [`fill`](Self::fill) or [`release`](Self::release) the reservation.
    /// While it is pending, `memoize` and `is_memoized` treat the key as mapped.
    fn reserve(&mut self, key: &str) -> Result<Reservation, ChannelError>;

    /// Replace the placeholder reserved under `token` with `obj`
    ///
    /// If the reservation is gone (released, deleted or overwritten), this
    /// behaves like [`memoize`](Self::memoize).
    fn fill(&mut self, key: &str, token: u64, obj: Arg) -> Result<RemoteRef, ChannelError>;

    /// Drop a pending reservation; true if `token` still held it
    fn release(&mut self, key: &str, token: u64) -> Result<bool, ChannelError>;

    /// Object mapped to `key`, or a `KeyNotFound` remote error
    fn get(&mut self, key: &str) -> Result<RemoteRef, ChannelError>;

    /// Map `key` to `obj`, replacing any previous mapping
    fn update(&mut self, key: &str, obj: Arg) -> Result<RemoteRef, ChannelError>;

    /// Remove the mapping for `key`; true if one existed
    fn delete(&mut self, key: &str) -> Result<bool, ChannelError>;

    /// Whether `key` is currently mapped
    fn is_memoized(&mut self, key: &str) -> Result<bool, ChannelError>;

    /// Import a module namespace on the remote side
    fn remote_import(&mut self, module: &str) -> Result<RemoteRef, ChannelError>;

    /// Perform `op` on a remote object
    fn invoke(&mut self, target: &RemoteRef, op: Operation) -> Result<Reply, ChannelError>;

    /// Whether the connection still looks usable
    fn is_alive(&self) -> bool;

    /// Close the connection, including any protocol-level goodbye
    fn close(&mut self) -> Result<(), ChannelError>;
}

/// Opens channels to `(host, port)` endpoints
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn RemoteChannel>, ChannelError>;
}

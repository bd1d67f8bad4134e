//! rmem Service: the registry endpoint behind shared remote memory
//!
//! # Architecture
//!
//! - **RegistryService**: maps string keys to objects in its heap and performs
//!   object operations on behalf of clients. Memoization is first-writer-wins.
//! - **heap**: the object model (scalars, lists, dicts, module namespaces,
//!   callables, locks) and the semantics of every remote operation.
//! - **LoopbackNetwork**: an in-process [`rmem_connect::Connector`] that binds
//!   services to `host:port` addresses and can simulate connection loss.
//!
//! # Example
//!
//! ```rust
//! use rmem_connect::{Arg, Connector};
//! use rmem_service::LoopbackNetwork;
//!
//! let network = LoopbackNetwork::new();
//! let service = network.serve("localhost", 18812);
//!
//! let mut channel = network.connect("localhost", 18812).unwrap();
//! channel.memoize("visits", Arg::from(0)).unwrap();
//! assert!(service.is_memoized("visits"));
//! ```

pub mod heap;
pub mod loopback;
pub mod service;

pub use loopback::{LoopbackChannel, LoopbackNetwork};
pub use service::RegistryService;

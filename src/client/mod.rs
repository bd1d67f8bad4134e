//! Client-side access to registry objects
//!
//! - [`RemoteModule`] resolves module namespaces on the endpoint
//! - [`RemoteObject`] is a plain handle to an endpoint-resident object
//! - [`SharedObject`] is a proxy bound to a registry key
//!
//! All of them reach the endpoint through a [`ConnectionSource`].

pub mod remote_module;
pub mod remote_object;
pub mod shared_object;

pub use remote_module::RemoteModule;
pub use remote_object::{ConnectionSource, Forward, RemoteObject, RemoteValue};
pub use shared_object::{Generator, ObjectSource, SharedObject};

/*!
 * rmem - shared remote memory for cooperating processes
 *
 * A registry endpoint maps string keys to live objects. Processes reach those
 * objects through keyed proxies that forward attribute access, calls and
 * operators, with:
 * - Bounded retry-with-delay around connection setup
 * - One-shot transparent reconnect when a call hits a transport failure
 * - First-writer-wins memoization with create-if-absent generators
 * - Fork-safe sessions that never reuse a connection across processes
 *
 * ```rust,no_run
 * use rmem::{Arg, Forward, RmemConfig, Session};
 * use std::sync::Arc;
 *
 * fn count_visit(connector: Arc<dyn rmem::Connector>) -> rmem::Result<()> {
 *     let session = Session::new(RmemConfig::new("10.0.0.5", 18812), connector)?;
 *
 *     let list_type = session.rmod(Some("list"))?;
 *     let visits = session.rmem_generated("visits", move || {
 *         list_type.call(vec![])?.to_arg().ok_or_else(|| {
 *             rmem::RmemError::Configuration("list() returned no object".into())
 *         })
 *     })?;
 *     visits.call_method("append", vec![Arg::from("home")])?;
 *     println!("{} visits", visits.len()?);
 *     Ok(())
 * }
 * ```
 */

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod session;

// Re-export commonly used types
pub use client::{
    ConnectionSource, Forward, Generator, ObjectSource, RemoteModule, RemoteObject, RemoteValue,
    SharedObject,
};
pub use config::{LogLevel, LoggingConfig, RmemConfig};
pub use error::{ErrorCategory, Result, RmemError};
pub use session::Session;

pub use rmem_connect::{
    Arg, BinaryOp, CompareOp, ConnectionGuardian, Connector, Operation, RemoteErrorKind, RemoteRef,
    UnaryOp,
};
pub use rmem_core_resilience::RetryPolicy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

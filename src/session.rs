//! Session: one connection, one resolver, and a factory for shared objects
//!
//! A session is created once and handed to every unit of work that needs
//! shared memory. Clones share the same connection.
//!
//! The session remembers which process created its connection. When it is
//! used from a different process (after a fork) and `process_safe` is set, the
//! inherited connection is abandoned without being closed and a new one is
//! established.

use rmem_connect::{Arg, ConnectionGuardian, Connector};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::client::{
    ConnectionSource, Generator, ObjectSource, RemoteModule, RemoteObject, SharedObject,
};
use crate::config::RmemConfig;
use crate::error::Result;

fn os_process_id() -> u32 {
    std::process::id()
}

struct SessionState {
    guardian: Arc<ConnectionGuardian>,
    /// Process that established `guardian`
    owner_pid: u32,
    process_id: fn() -> u32,
}

struct SessionInner {
    config: RmemConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<SessionState>,
}

impl SessionInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_guardian(&self) -> Result<Arc<ConnectionGuardian>> {
        let guardian = ConnectionGuardian::connect(
            Arc::clone(&self.connector),
            self.config.host.clone(),
            self.config.port,
            self.config.retry_policy(),
        )?;
        Ok(Arc::new(guardian))
    }

    fn connection(&self) -> Result<Arc<ConnectionGuardian>> {
        let mut state = self.lock_state();
        let pid = (state.process_id)();

        if pid != state.owner_pid {
            if self.config.process_safe {
                warn!(
                    "Connection to {}:{} was created by process {}, now used by {}; reconnecting",
                    self.config.host, self.config.port, state.owner_pid, pid
                );
                // Closing would also tear down the parent's end of the channel
                state.guardian.forsake();
                state.guardian = self.open_guardian()?;
            } else {
                debug!(
                    "Reusing connection inherited from process {} in process {}",
                    state.owner_pid, pid
                );
            }
            state.owner_pid = pid;
        }

        Ok(Arc::clone(&state.guardian))
    }
}

impl ConnectionSource for SessionInner {
    fn connection(&self) -> Result<Arc<ConnectionGuardian>> {
        SessionInner::connection(self)
    }
}

/// Shared-memory session against one registry endpoint
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    resolver: RemoteModule,
}

impl Session {
    /// Validate `config` and connect to the endpoint it names
    pub fn new(config: RmemConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let guardian = ConnectionGuardian::connect(
            Arc::clone(&connector),
            config.host.clone(),
            config.port,
            config.retry_policy(),
        )?;
        info!(
            "Session connected to {}:{} (process_safe={})",
            config.host, config.port, config.process_safe
        );

        let inner = Arc::new(SessionInner {
            config,
            connector,
            state: Mutex::new(SessionState {
                guardian: Arc::new(guardian),
                owner_pid: os_process_id(),
                process_id: os_process_id,
            }),
        });
        let source: Arc<dyn ConnectionSource> = inner.clone();

        Ok(Self {
            inner,
            resolver: RemoteModule::new(source),
        })
    }

    /// Replace the source of process identity
    ///
    /// The current connection is attributed to the process `process_id`
    /// reports now.
    pub fn with_process_id(self, process_id: fn() -> u32) -> Self {
        {
            let mut state = self.inner.lock_state();
            state.process_id = process_id;
            state.owner_pid = process_id();
        }
        self
    }

    pub fn config(&self) -> &RmemConfig {
        &self.inner.config
    }

    fn source(&self) -> Arc<dyn ConnectionSource> {
        self.inner.clone()
    }

    /// Live connection for the calling process
    pub fn connection(&self) -> Result<Arc<ConnectionGuardian>> {
        self.inner.connection()
    }

    /// The session's resolver
    pub fn resolver(&self) -> &RemoteModule {
        &self.resolver
    }

    /// Resolve a remote module; `None` gives the builtins namespace
    pub fn rmod(&self, module: Option<&str>) -> Result<RemoteObject> {
        self.resolver.resolve(module)
    }

    /// Resolve a remote module whose leading dots are relative to `package`
    pub fn rmod_in(&self, module: &str, package: Option<&str>) -> Result<RemoteObject> {
        self.resolver.resolve_in(module, package)
    }

    /// Proxy for `key`, memoizing exactly one of `obj` or `generator`
    pub fn rmem(
        &self,
        key: impl Into<String>,
        obj: Option<Arg>,
        generator: Option<Generator>,
    ) -> Result<SharedObject> {
        let object = ObjectSource::from_parts(obj, generator)?;
        SharedObject::new(key, self.source(), object)
    }

    /// Proxy for `key`, memoizing `obj` unless the key is already mapped
    pub fn rmem_object(&self, key: impl Into<String>, obj: impl Into<Arg>) -> Result<SharedObject> {
        SharedObject::new(key, self.source(), ObjectSource::Object(obj.into()))
    }

    /// Proxy for `key`, running `generator` only if the key is not mapped yet
    pub fn rmem_generated<F>(&self, key: impl Into<String>, generator: F) -> Result<SharedObject>
    where
        F: FnOnce() -> Result<Arg> + Send + 'static,
    {
        SharedObject::new(key, self.source(), ObjectSource::generator(generator))
    }

    /// Close the current connection; later calls fail until [`reconnect`](Self::reconnect)
    pub fn close(&self) {
        self.inner.lock_state().guardian.close();
    }

    /// Re-establish the current connection
    pub fn reconnect(&self) -> Result<()> {
        let guardian = self.connection()?;
        guardian.reconnect()?;
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("Session")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("owner_pid", &state.owner_pid)
            .field("guardian", &state.guardian)
            .finish()
    }
}

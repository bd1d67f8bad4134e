//! ConnectionGuardian: owner of one reconnecting channel to a registry endpoint
//!
//! The guardian performs the versioned handshake, retries connection setup
//! according to a [`RetryPolicy`], and wraps every call so that a single
//! transport failure is recovered by reconnecting and retrying once.

use crate::channel::{Connector, RemoteChannel};
use crate::error::{ChannelError, ConnectError};
use crate::protocol::{
    Arg, Operation, ProtocolVersion, RemoteRef, Reply, Reservation, PROTOCOL_VERSION,
};
use rmem_core_resilience::{retry_with_delay, RetryError, RetryPolicy};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Counters describing what the guardian has done so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardianStats {
    /// Channels successfully established, including reconnects
    pub connects: u64,
    /// Reconnects, explicit or triggered by a transport failure
    pub reconnects: u64,
    /// Calls that failed once and succeeded after reconnecting
    pub recovered_calls: u64,
}

struct GuardianState {
    handle: Option<Box<dyn RemoteChannel>>,
    remote_version: Option<ProtocolVersion>,
    /// Set by `close()`; disables automatic recovery until the next explicit connect
    closed: bool,
    stats: GuardianStats,
}

/// Owner of one channel to a registry endpoint, with retry and reconnect policy
///
/// Calls are serialized by an internal lock: a guardian models one sequential
/// channel, so concurrent callers on one guardian take turns.
///
/// # Example
///
/// ```rust,no_run
/// use rmem_connect::{Arg, ConnectionGuardian, Connector};
/// use rmem_core_resilience::RetryPolicy;
/// use std::sync::Arc;
///
/// # fn example(connector: Arc<dyn Connector>) -> Result<(), rmem_connect::ConnectError> {
/// let guardian = ConnectionGuardian::connect(connector, "10.0.0.5", 18812, RetryPolicy::default())?;
///
/// // Every call survives one dropped connection
/// guardian.memoize("counter", Arg::from(0))?;
/// let counter = guardian.get("counter")?;
/// println!("counter lives at {}", counter);
/// # Ok(())
/// # }
/// ```
pub struct ConnectionGuardian {
    connector: Arc<dyn Connector>,
    host: String,
    port: u16,
    policy: RetryPolicy,
    state: Mutex<GuardianState>,
}

impl ConnectionGuardian {
    /// Create a guardian and establish its channel immediately
    pub fn connect(
        connector: Arc<dyn Connector>,
        host: impl Into<String>,
        port: u16,
        policy: RetryPolicy,
    ) -> Result<Self, ConnectError> {
        let guardian = Self::lazy(connector, host, port, policy);
        guardian.reconnect()?;
        Ok(guardian)
    }

    /// Create a guardian whose channel is established by the first call
    pub fn lazy(
        connector: Arc<dyn Connector>,
        host: impl Into<String>,
        port: u16,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            connector,
            host: host.into(),
            port,
            policy,
            state: Mutex::new(GuardianState {
                handle: None,
                remote_version: None,
                closed: false,
                stats: GuardianStats::default(),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Version reported by the endpoint at the last handshake
    pub fn remote_version(&self) -> Option<ProtocolVersion> {
        self.lock_state().remote_version
    }

    /// Whether a channel is held and reports itself alive
    pub fn is_connected(&self) -> bool {
        self.lock_state()
            .handle
            .as_ref()
            .is_some_and(|h| h.is_alive())
    }

    /// Whether `close()` was called since the last explicit connect
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    pub fn stats(&self) -> GuardianStats {
        self.lock_state().stats
    }

    /// Close the current channel (best effort) and establish a fresh one
    ///
    /// Also re-enables automatic recovery after `close()`.
    pub fn reconnect(&self) -> Result<(), ConnectError> {
        let mut state = self.lock_state();
        self.reconnect_locked(&mut state)
    }

    /// Close the channel and stop recovering from transport failures
    ///
    /// Later calls run against the dead channel and surface its transport
    /// errors until `reconnect()` is called.
    pub fn close(&self) {
        let mut state = self.lock_state();
        if let Some(handle) = state.handle.as_mut() {
            if let Err(e) = handle.close() {
                debug!("Ignoring error while closing {}:{}: {}", self.host, self.port, e);
            }
        }
        state.closed = true;
        info!("Closed connection to {}:{}", self.host, self.port);
    }

    /// Drop the channel without closing it
    ///
    /// Used when the channel was inherited by another process: a protocol-level
    /// close would tear down the peer's view of the shared socket. Returns
    /// whether a channel was held.
    pub fn forsake(&self) -> bool {
        let mut state = self.lock_state();
        state.closed = true;
        state.remote_version = None;
        state.handle.take().is_some()
    }

    /// Run `op` on the channel, reconnecting and retrying once on transport failure
    pub fn call<T, F>(&self, op: F) -> Result<T, ConnectError>
    where
        F: FnMut(&mut dyn RemoteChannel) -> Result<T, ChannelError>,
    {
        self.call_with_hook(op, None)
    }

    /// Like [`call`](Self::call), notifying `on_reconnect` after a recovery reconnect
    ///
    /// The hook runs without the guardian lock held, so it may use the guardian.
    pub fn call_with_hook<T, F>(
        &self,
        mut op: F,
        on_reconnect: Option<&dyn Fn()>,
    ) -> Result<T, ConnectError>
    where
        F: FnMut(&mut dyn RemoteChannel) -> Result<T, ChannelError>,
    {
        {
            let mut state = self.lock_state();

            if state.closed {
                return Self::run_on(&mut state, &mut op);
            }

            let just_now = state.handle.is_none();
            if just_now {
                self.install(&mut state)?;
            }

            match Self::run_on(&mut state, &mut op) {
                Err(ConnectError::Transport(reason)) => {
                    if just_now {
                        return Err(ConnectError::Unstable {
                            host: self.host.clone(),
                            port: self.port,
                            reason,
                        });
                    }
                    warn!(
                        "Transport failure talking to {}:{} ({}); reconnecting",
                        self.host, self.port, reason
                    );
                    self.reconnect_locked(&mut state)?;
                }
                other => return other,
            }
        }

        if let Some(hook) = on_reconnect {
            hook();
        }

        let mut state = self.lock_state();
        let result = Self::run_on(&mut state, &mut op);
        if result.is_ok() {
            state.stats.recovered_calls += 1;
        }
        result
    }

    /// Run `op` on the current channel with no recovery at all
    pub fn call_unguarded<T, F>(&self, mut op: F) -> Result<T, ConnectError>
    where
        F: FnMut(&mut dyn RemoteChannel) -> Result<T, ChannelError>,
    {
        let mut state = self.lock_state();
        Self::run_on(&mut state, &mut op)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Registry endpoint operations
    // ═══════════════════════════════════════════════════════════════════════

    pub fn memoize(&self, key: &str, obj: Arg) -> Result<RemoteRef, ConnectError> {
        debug!("memoize '{}'", key);
        self.call(|ch| ch.memoize(key, obj.clone()))
    }

    pub fn reserve(&self, key: &str) -> Result<Reservation, ConnectError> {
        debug!("reserve '{}'", key);
        self.call(|ch| ch.reserve(key))
    }

    pub fn fill(&self, key: &str, token: u64, obj: Arg) -> Result<RemoteRef, ConnectError> {
        debug!("fill '{}' (token {})", key, token);
        self.call(|ch| ch.fill(key, token, obj.clone()))
    }

    pub fn release(&self, key: &str, token: u64) -> Result<bool, ConnectError> {
        debug!("release '{}' (token {})", key, token);
        self.call(|ch| ch.release(key, token))
    }

    pub fn get(&self, key: &str) -> Result<RemoteRef, ConnectError> {
        debug!("get '{}'", key);
        self.call(|ch| ch.get(key))
    }

    pub fn update(&self, key: &str, obj: Arg) -> Result<RemoteRef, ConnectError> {
        debug!("update '{}'", key);
        self.call(|ch| ch.update(key, obj.clone()))
    }

    pub fn delete(&self, key: &str) -> Result<bool, ConnectError> {
        debug!("delete '{}'", key);
        self.call(|ch| ch.delete(key))
    }

    pub fn is_memoized(&self, key: &str) -> Result<bool, ConnectError> {
        self.call(|ch| ch.is_memoized(key))
    }

    pub fn remote_import(&self, module: &str) -> Result<RemoteRef, ConnectError> {
        debug!("remote_import '{}'", module);
        self.call(|ch| ch.remote_import(module))
    }

    pub fn protocol_version(&self) -> Result<ProtocolVersion, ConnectError> {
        self.call(|ch| ch.protocol_version())
    }

    pub fn invoke(&self, target: &RemoteRef, op: Operation) -> Result<Reply, ConnectError> {
        debug!("{} on {}", op.name(), target);
        self.call(|ch| ch.invoke(target, op.clone()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════════════════

    fn lock_state(&self) -> MutexGuard<'_, GuardianState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_on<T, F>(state: &mut GuardianState, op: &mut F) -> Result<T, ConnectError>
    where
        F: FnMut(&mut dyn RemoteChannel) -> Result<T, ChannelError>,
    {
        match state.handle.as_mut() {
            Some(handle) => op(&mut **handle).map_err(ConnectError::from),
            None => Err(ConnectError::Transport("no live connection".to_string())),
        }
    }

    fn reconnect_locked(&self, state: &mut GuardianState) -> Result<(), ConnectError> {
        let had_handle = match state.handle.take() {
            Some(mut stale) => {
                if let Err(e) = stale.close() {
                    debug!("Ignoring error while closing stale connection: {}", e);
                }
                true
            }
            None => false,
        };

        self.install(state)?;
        if had_handle {
            state.stats.reconnects += 1;
        }
        Ok(())
    }

    fn install(&self, state: &mut GuardianState) -> Result<(), ConnectError> {
        let (handle, version) = self.establish()?;
        state.handle = Some(handle);
        state.remote_version = Some(version);
        state.closed = false;
        state.stats.connects += 1;
        Ok(())
    }

    /// Connect and handshake, retrying per policy
    fn establish(&self) -> Result<(Box<dyn RemoteChannel>, ProtocolVersion), ConnectError> {
        let result = retry_with_delay(&self.policy, |attempt| -> Result<_, ConnectError> {
            debug!(
                "Connecting to {}:{} (attempt {} of {})",
                self.host,
                self.port,
                attempt,
                self.policy.max_attempts()
            );
            let mut channel = self.connector.connect(&self.host, self.port)?;
            let remote = channel.protocol_version()?;

            if remote != PROTOCOL_VERSION && !self.policy.ignore_version {
                if let Err(e) = channel.close() {
                    debug!("Ignoring error while closing rejected connection: {}", e);
                }
                return Err(ConnectError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote,
                });
            }

            Ok((channel, remote))
        });

        match result {
            Ok((channel, remote)) => {
                info!(
                    "Connected to {}:{} (protocol {})",
                    self.host, self.port, remote
                );
                Ok((channel, remote))
            }
            Err(RetryError::Exhausted { attempts, last }) => Err(ConnectError::ConnectionFailed {
                host: self.host.clone(),
                port: self.port,
                attempts,
                reason: last.to_string(),
            }),
            Err(RetryError::Aborted { error, .. }) => Err(error),
        }
    }
}

impl fmt::Debug for ConnectionGuardian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuardian")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Scripted endpoint shared by every channel the mock connector opens
    struct MockEndpoint {
        reachable: AtomicBool,
        broken: AtomicBool,
        version: Mutex<ProtocolVersion>,
        generation: AtomicU64,
        connect_attempts: AtomicUsize,
        close_calls: AtomicUsize,
        store: Mutex<HashMap<String, u64>>,
        reserved: Mutex<HashMap<String, u64>>,
        next_token: AtomicU64,
    }

    impl MockEndpoint {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reachable: AtomicBool::new(true),
                broken: AtomicBool::new(false),
                version: Mutex::new(PROTOCOL_VERSION),
                generation: AtomicU64::new(0),
                connect_attempts: AtomicUsize::new(0),
                close_calls: AtomicUsize::new(0),
                store: Mutex::new(HashMap::new()),
                reserved: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            })
        }

        /// Kill every channel opened so far
        fn sever(&self) {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        fn attempts(&self) -> usize {
            self.connect_attempts.load(Ordering::SeqCst)
        }

        fn closes(&self) -> usize {
            self.close_calls.load(Ordering::SeqCst)
        }
    }

    struct MockConnector(Arc<MockEndpoint>);

    impl Connector for MockConnector {
        fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn RemoteChannel>, ChannelError> {
            self.0.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if !self.0.reachable.load(Ordering::SeqCst) {
                return Err(ChannelError::transport("connection refused"));
            }
            Ok(Box::new(MockChannel {
                endpoint: Arc::clone(&self.0),
                generation: self.0.generation.load(Ordering::SeqCst),
                open: true,
            }))
        }
    }

    struct MockChannel {
        endpoint: Arc<MockEndpoint>,
        generation: u64,
        open: bool,
    }

    impl MockChannel {
        fn check(&self) -> Result<(), ChannelError> {
            if !self.is_alive() || self.endpoint.broken.load(Ordering::SeqCst) {
                return Err(ChannelError::transport("connection reset by peer"));
            }
            Ok(())
        }
    }

    impl RemoteChannel for MockChannel {
        fn protocol_version(&mut self) -> Result<ProtocolVersion, ChannelError> {
            self.check()?;
            Ok(*self.endpoint.version.lock().unwrap())
        }

        fn memoize(&mut self, key: &str, _obj: Arg) -> Result<RemoteRef, ChannelError> {
            self.check()?;
            let mut store = self.endpoint.store.lock().unwrap();
            let next = store.len() as u64 + 1;
            let id = *store.entry(key.to_string()).or_insert(next);
            Ok(RemoteRef::new(id, "int"))
        }

        fn reserve(&mut self, key: &str) -> Result<Reservation, ChannelError> {
            self.check()?;
            if let Some(id) = self.endpoint.store.lock().unwrap().get(key) {
                return Ok(Reservation::Taken(RemoteRef::new(*id, "int")));
            }
            let token = self.endpoint.next_token.fetch_add(1, Ordering::SeqCst);
            self.memoize(key, Arg::from(0))?;
            self.endpoint
                .reserved
                .lock()
                .unwrap()
                .insert(key.to_string(), token);
            Ok(Reservation::Granted { token })
        }

        fn fill(&mut self, key: &str, token: u64, obj: Arg) -> Result<RemoteRef, ChannelError> {
            self.check()?;
            let mut reserved = self.endpoint.reserved.lock().unwrap();
            if reserved.get(key) == Some(&token) {
                reserved.remove(key);
            }
            drop(reserved);
            self.memoize(key, obj)
        }

        fn release(&mut self, key: &str, token: u64) -> Result<bool, ChannelError> {
            self.check()?;
            let mut reserved = self.endpoint.reserved.lock().unwrap();
            if reserved.get(key) != Some(&token) {
                return Ok(false);
            }
            reserved.remove(key);
            self.endpoint.store.lock().unwrap().remove(key);
            Ok(true)
        }

        fn get(&mut self, key: &str) -> Result<RemoteRef, ChannelError> {
            self.check()?;
            let store = self.endpoint.store.lock().unwrap();
            store
                .get(key)
                .map(|id| RemoteRef::new(*id, "int"))
                .ok_or_else(|| RemoteError::key_not_found(key).into())
        }

        fn update(&mut self, key: &str, obj: Arg) -> Result<RemoteRef, ChannelError> {
            self.check()?;
            self.endpoint.store.lock().unwrap().remove(key);
            self.memoize(key, obj)
        }

        fn delete(&mut self, key: &str) -> Result<bool, ChannelError> {
            self.check()?;
            Ok(self.endpoint.store.lock().unwrap().remove(key).is_some())
        }

        fn is_memoized(&mut self, key: &str) -> Result<bool, ChannelError> {
            self.check()?;
            Ok(self.endpoint.store.lock().unwrap().contains_key(key))
        }

        fn remote_import(&mut self, module: &str) -> Result<RemoteRef, ChannelError> {
            self.check()?;
            Ok(RemoteRef::new(0, format!("module {}", module)))
        }

        fn invoke(&mut self, _target: &RemoteRef, op: Operation) -> Result<Reply, ChannelError> {
            self.check()?;
            Ok(Reply::Value(json!(op.name())))
        }

        fn is_alive(&self) -> bool {
            self.open && self.generation == self.endpoint.generation.load(Ordering::SeqCst)
        }

        fn close(&mut self) -> Result<(), ChannelError> {
            self.endpoint.close_calls.fetch_add(1, Ordering::SeqCst);
            let was_alive = self.is_alive();
            self.open = false;
            if was_alive {
                Ok(())
            } else {
                Err(ChannelError::transport("already closed"))
            }
        }
    }

    fn policy(max_retry: u32, delay_ms: u64) -> RetryPolicy {
        RetryPolicy::new(max_retry, Duration::from_millis(delay_ms))
    }

    fn guardian(endpoint: &Arc<MockEndpoint>, policy: RetryPolicy) -> ConnectionGuardian {
        ConnectionGuardian::connect(
            Arc::new(MockConnector(Arc::clone(endpoint))),
            "localhost",
            18812,
            policy,
        )
        .unwrap()
    }

    #[test]
    fn test_connect_and_call_without_retries() {
        let endpoint = MockEndpoint::new();
        let g = guardian(&endpoint, policy(4, 10));

        assert!(g.is_connected());
        assert_eq!(g.remote_version(), Some(PROTOCOL_VERSION));
        g.memoize("k1", Arg::from(1)).unwrap();
        assert!(g.is_memoized("k1").unwrap());

        assert_eq!(endpoint.attempts(), 1);
        let stats = g.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.reconnects, 0);
    }

    #[test]
    fn test_unreachable_endpoint_exhausts_attempts() {
        let endpoint = MockEndpoint::new();
        endpoint.reachable.store(false, Ordering::SeqCst);
        let start = Instant::now();

        let err = ConnectionGuardian::connect(
            Arc::new(MockConnector(Arc::clone(&endpoint))),
            "localhost",
            18812,
            policy(3, 15),
        )
        .unwrap_err();

        match err {
            ConnectError::ConnectionFailed { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("Expected ConnectionFailed, got {:?}", other),
        }
        assert_eq!(endpoint.attempts(), 4);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_version_mismatch_fails_on_first_attempt() {
        let endpoint = MockEndpoint::new();
        *endpoint.version.lock().unwrap() = ProtocolVersion::new(9, 9, 9);
        let start = Instant::now();

        let err = ConnectionGuardian::connect(
            Arc::new(MockConnector(Arc::clone(&endpoint))),
            "localhost",
            18812,
            policy(4, 200),
        )
        .unwrap_err();

        assert!(matches!(err, ConnectError::VersionMismatch { .. }));
        assert_eq!(endpoint.attempts(), 1);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_version_mismatch_tolerated_when_ignored() {
        let endpoint = MockEndpoint::new();
        *endpoint.version.lock().unwrap() = ProtocolVersion::new(2, 0, 0);

        let g = guardian(&endpoint, policy(0, 0).ignoring_version());
        assert_eq!(g.remote_version(), Some(ProtocolVersion::new(2, 0, 0)));
    }

    #[test]
    fn test_transport_failure_recovered_once_with_hook() {
        let endpoint = MockEndpoint::new();
        let g = guardian(&endpoint, policy(2, 1));
        g.memoize("k1", Arg::from(1)).unwrap();

        endpoint.sever();
        let hook_calls = AtomicUsize::new(0);
        let hook = || {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        };

        let found = g
            .call_with_hook(|ch| ch.is_memoized("k1"), Some(&hook as &dyn Fn()))
            .unwrap();

        assert!(found);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.attempts(), 2);
        // The stale channel was closed on a best-effort basis
        assert_eq!(endpoint.closes(), 1);
        let stats = g.stats();
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.recovered_calls, 1);
    }

    #[test]
    fn test_second_failure_propagates_transport_error() {
        let endpoint = MockEndpoint::new();
        let g = guardian(&endpoint, policy(1, 1));

        // The reconnect handshake succeeds, the retried call does not
        endpoint.sever();
        let mut calls = 0;
        let err = g
            .call(|ch| {
                calls += 1;
                if calls == 2 {
                    return Err(ChannelError::transport("still broken"));
                }
                ch.delete("k1")
            })
            .unwrap_err();

        assert!(err.is_transport());
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_reconnect_failure_surfaces_connection_error() {
        let endpoint = MockEndpoint::new();
        let g = guardian(&endpoint, policy(1, 1));

        endpoint.sever();
        endpoint.reachable.store(false, Ordering::SeqCst);

        let err = g.get("k1").unwrap_err();
        assert!(err.is_connection_failure());
        // One initial connect, then two attempts for the failed reconnect
        assert_eq!(endpoint.attempts(), 3);
    }

    #[test]
    fn test_remote_errors_are_not_retried() {
        let endpoint = MockEndpoint::new();
        let g = guardian(&endpoint, policy(3, 1));

        let err = g.get("missing").unwrap_err();
        assert!(matches!(err, ConnectError::Remote(_)));
        assert_eq!(endpoint.attempts(), 1);
        assert_eq!(g.stats().reconnects, 0);
    }

    #[test]
    fn test_close_disables_recovery_until_reconnect() {
        let endpoint = MockEndpoint::new();
        let g = guardian(&endpoint, policy(1, 1));

        g.close();
        assert!(g.is_closed());
        assert!(!g.is_connected());

        let err = g.is_memoized("k1").unwrap_err();
        assert!(err.is_transport());
        assert_eq!(endpoint.attempts(), 1);

        g.reconnect().unwrap();
        assert!(!g.is_closed());
        assert!(!g.is_memoized("k1").unwrap());
    }

    #[test]
    fn test_close_swallows_errors_on_dead_channel() {
        let endpoint = MockEndpoint::new();
        let g = guardian(&endpoint, policy(0, 0));

        endpoint.sever();
        g.close();
        assert_eq!(endpoint.closes(), 1);
        assert!(g.is_closed());
    }

    #[test]
    fn test_unguarded_call_does_not_recover() {
        let endpoint = MockEndpoint::new();
        let g = guardian(&endpoint, policy(1, 1));

        endpoint.sever();
        let err = g.call_unguarded(|ch| ch.is_memoized("k1")).unwrap_err();
        assert!(err.is_transport());

        g.reconnect().unwrap();
        assert!(g.call_unguarded(|ch| ch.is_memoized("k1")).is_ok());
    }

    #[test]
    fn test_lazy_guardian_connects_on_first_call() {
        let endpoint = MockEndpoint::new();
        let g = ConnectionGuardian::lazy(
            Arc::new(MockConnector(Arc::clone(&endpoint))),
            "localhost",
            18812,
            policy(0, 0),
        );
        assert_eq!(endpoint.attempts(), 0);
        assert!(!g.is_connected());

        let reply = g.invoke(&RemoteRef::new(1, "int"), Operation::Len).unwrap();
        assert_eq!(reply, Reply::Value(json!("len")));
        assert_eq!(endpoint.attempts(), 1);
    }

    #[test]
    fn test_lazy_failure_right_after_connect_is_not_retried() {
        let endpoint = MockEndpoint::new();
        endpoint.broken.store(true, Ordering::SeqCst);
        let g = ConnectionGuardian::lazy(
            Arc::new(MockConnector(Arc::clone(&endpoint))),
            "localhost",
            18812,
            policy(0, 0).ignoring_version(),
        );

        // Handshake fails too while broken, so connect exhausts its single attempt
        let err = g.is_memoized("k1").unwrap_err();
        assert!(err.is_connection_failure());

        endpoint.broken.store(false, Ordering::SeqCst);
        let mut first = true;
        let err = g
            .call(|ch| {
                if first {
                    first = false;
                    return Err(ChannelError::transport("dropped"));
                }
                ch.is_memoized("k1")
            })
            .unwrap_err();
        assert!(matches!(err, ConnectError::Unstable { .. }));
    }

    #[test]
    fn test_forsake_never_closes() {
        let endpoint = MockEndpoint::new();
        let g = guardian(&endpoint, policy(0, 0));

        assert!(g.forsake());
        assert_eq!(endpoint.closes(), 0);
        assert!(!g.is_connected());
        assert!(!g.forsake());
    }

    #[test]
    fn test_reservation_round_trip_through_recovery() {
        let endpoint = MockEndpoint::new();
        let g = guardian(&endpoint, policy(1, 0));

        let token = match g.reserve("k1").unwrap() {
            Reservation::Granted { token } => token,
            other => panic!("expected a grant, got {:?}", other),
        };
        assert!(matches!(g.reserve("k1").unwrap(), Reservation::Taken(_)));
        assert!(g.is_memoized("k1").unwrap());

        endpoint.sever();
        let filled = g.fill("k1", token, Arg::from(5)).unwrap();
        assert_eq!(g.get("k1").unwrap(), filled);
        assert!(!g.release("k1", token).unwrap());
        assert_eq!(g.stats().recovered_calls, 1);
    }

    #[test]
    fn test_released_reservation_frees_key() {
        let endpoint = MockEndpoint::new();
        let g = guardian(&endpoint, policy(0, 0));

        let Reservation::Granted { token } = g.reserve("k2").unwrap() else {
            panic!("fresh key should be granted");
        };
        assert!(g.release("k2", token).unwrap());
        assert!(!g.is_memoized("k2").unwrap());
        assert!(matches!(g.reserve("k2").unwrap(), Reservation::Granted { .. }));
    }
}

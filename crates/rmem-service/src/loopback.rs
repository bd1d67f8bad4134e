//! In-process transport between clients and a [`RegistryService`]
//!
//! [`LoopbackNetwork`] is a [`Connector`]: services are bound to `host:port`
//! addresses, and connecting yields a channel that calls straight into the
//! bound service. The network can be made unreachable and live channels can
//! be severed, which is how connection loss is exercised without sockets.

use crate::service::RegistryService;
use rmem_connect::{
    Arg, ChannelError, Connector, Operation, ProtocolVersion, RemoteChannel, RemoteRef, Reply,
    Reservation,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

struct Binding {
    service: Arc<RegistryService>,
    /// Bumped by `sever()`; channels opened under an older generation are dead
    generation: Arc<AtomicU64>,
}

/// Address book of in-process registry endpoints
pub struct LoopbackNetwork {
    bindings: Mutex<HashMap<(String, u16), Binding>>,
    reachable: AtomicBool,
    connect_attempts: AtomicUsize,
    close_calls: Arc<AtomicUsize>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            connect_attempts: AtomicUsize::new(0),
            close_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, u16), Binding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind an existing service to `host:port`
    pub fn bind(&self, host: &str, port: u16, service: Arc<RegistryService>) {
        debug!("Binding registry endpoint at {}:{}", host, port);
        self.lock().insert(
            (host.to_string(), port),
            Binding {
                service,
                generation: Arc::new(AtomicU64::new(0)),
            },
        );
    }

    /// Start a fresh service at `host:port`
    pub fn serve(&self, host: &str, port: u16) -> Arc<RegistryService> {
        let service = Arc::new(RegistryService::new());
        self.bind(host, port, Arc::clone(&service));
        service
    }

    /// Remove the endpoint; open channels to it die with it
    pub fn shutdown(&self, host: &str, port: u16) -> Option<Arc<RegistryService>> {
        let binding = self.lock().remove(&(host.to_string(), port))?;
        binding.generation.fetch_add(1, Ordering::SeqCst);
        debug!("Registry endpoint at {}:{} shut down", host, port);
        Some(binding.service)
    }

    /// Break every channel currently open to `host:port`
    ///
    /// The endpoint itself keeps running, so a reconnect succeeds.
    pub fn sever(&self, host: &str, port: u16) {
        if let Some(binding) = self.lock().get(&(host.to_string(), port)) {
            binding.generation.fetch_add(1, Ordering::SeqCst);
            debug!("Severed open channels to {}:{}", host, port);
        }
    }

    /// Make every endpoint (un)reachable for new connections
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Total connection attempts, successful or not
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Total `close()` calls made on channels of this network
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl Connector for LoopbackNetwork {
    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn RemoteChannel>, ChannelError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ChannelError::transport(format!(
                "network unreachable: {}:{}",
                host, port
            )));
        }

        let bindings = self.lock();
        let binding = bindings.get(&(host.to_string(), port)).ok_or_else(|| {
            ChannelError::transport(format!("connection refused: {}:{}", host, port))
        })?;

        trace!("Opened loopback channel to {}:{}", host, port);
        Ok(Box::new(LoopbackChannel {
            service: Arc::clone(&binding.service),
            generation: Arc::clone(&binding.generation),
            opened_at: binding.generation.load(Ordering::SeqCst),
            open: true,
            close_calls: Arc::clone(&self.close_calls),
        }))
    }
}

/// Channel calling directly into a bound [`RegistryService`]
pub struct LoopbackChannel {
    service: Arc<RegistryService>,
    generation: Arc<AtomicU64>,
    opened_at: u64,
    open: bool,
    close_calls: Arc<AtomicUsize>,
}

impl LoopbackChannel {
    fn check(&self) -> Result<&RegistryService, ChannelError> {
        if !self.open {
            return Err(ChannelError::transport("channel is closed"));
        }
        if self.generation.load(Ordering::SeqCst) != self.opened_at {
            return Err(ChannelError::transport("connection reset by peer"));
        }
        Ok(&self.service)
    }
}

impl RemoteChannel for LoopbackChannel {
    fn protocol_version(&mut self) -> Result<ProtocolVersion, ChannelError> {
        Ok(self.check()?.protocol_version())
    }

    fn memoize(&mut self, key: &str, obj: Arg) -> Result<RemoteRef, ChannelError> {
        Ok(self.check()?.memoize(key, &obj)?)
    }

    fn reserve(&mut self, key: &str) -> Result<Reservation, ChannelError> {
        Ok(self.check()?.reserve(key)?)
    }

    fn fill(&mut self, key: &str, token: u64, obj: Arg) -> Result<RemoteRef, ChannelError> {
        Ok(self.check()?.fill(key, token, &obj)?)
    }

    fn release(&mut self, key: &str, token: u64) -> Result<bool, ChannelError> {
        Ok(self.check()?.release(key, token))
    }

    fn get(&mut self, key: &str) -> Result<RemoteRef, ChannelError> {
        Ok(self.check()?.get(key)?)
    }

    fn update(&mut self, key: &str, obj: Arg) -> Result<RemoteRef, ChannelError> {
        Ok(self.check()?.update(key, &obj)?)
    }

    fn delete(&mut self, key: &str) -> Result<bool, ChannelError> {
        Ok(self.check()?.delete(key))
    }

    fn is_memoized(&mut self, key: &str) -> Result<bool, ChannelError> {
        Ok(self.check()?.is_memoized(key))
    }

    fn remote_import(&mut self, module: &str) -> Result<RemoteRef, ChannelError> {
        Ok(self.check()?.remote_import(module)?)
    }

    fn invoke(&mut self, target: &RemoteRef, op: Operation) -> Result<Reply, ChannelError> {
        Ok(self.check()?.invoke(target, op)?)
    }

    fn is_alive(&self) -> bool {
        self.check().is_ok()
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let result = self.check().map(|_| ());
        self.open = false;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmem_connect::RemoteErrorKind;

    #[test]
    fn test_connect_to_bound_service() {
        let network = LoopbackNetwork::new();
        let service = network.serve("localhost", 18812);

        let mut channel = network.connect("localhost", 18812).unwrap();
        channel.memoize("k", Arg::from(1)).unwrap();
        assert!(service.is_memoized("k"));
        assert_eq!(network.connect_attempts(), 1);
    }

    #[test]
    fn test_refused_and_unreachable() {
        let network = LoopbackNetwork::new();
        assert!(network.connect("localhost", 1).err().is_some_and(|e| e.is_transport()));

        network.serve("localhost", 1);
        network.set_reachable(false);
        assert!(network.connect("localhost", 1).err().is_some_and(|e| e.is_transport()));
        network.set_reachable(true);
        assert!(network.connect("localhost", 1).is_ok());
        assert_eq!(network.connect_attempts(), 3);
    }

    #[test]
    fn test_sever_kills_open_channels_only() {
        let network = LoopbackNetwork::new();
        network.serve("localhost", 2);
        let mut old = network.connect("localhost", 2).unwrap();
        network.sever("localhost", 2);

        assert!(!old.is_alive());
        assert!(old.get("k").unwrap_err().is_transport());

        let mut fresh = network.connect("localhost", 2).unwrap();
        assert!(fresh.is_alive());
        match fresh.get("k").unwrap_err() {
            ChannelError::Remote(e) => assert_eq!(e.kind, RemoteErrorKind::KeyNotFound),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_close_counts_and_disables_channel() {
        let network = LoopbackNetwork::new();
        network.serve("localhost", 3);
        let mut channel = network.connect("localhost", 3).unwrap();

        channel.close().unwrap();
        assert!(!channel.is_alive());
        assert!(channel.close().is_err());
        assert_eq!(network.close_calls(), 2);
    }

    #[test]
    fn test_shutdown_drops_endpoint() {
        let network = LoopbackNetwork::new();
        network.serve("localhost", 4);
        let channel = network.connect("localhost", 4).unwrap();

        assert!(network.shutdown("localhost", 4).is_some());
        assert!(!channel.is_alive());
        assert!(network.connect("localhost", 4).is_err());
    }
}

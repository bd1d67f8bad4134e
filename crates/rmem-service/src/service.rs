//! RegistryService: the shared-memory endpoint
//!
//! Holds the key registry and the object heap behind one lock, so every
//! request is applied atomically with respect to every other client.
//!
//! A reserved key maps to a placeholder object until its holder fills or
//! releases it. Memoizing over a reserved key keeps the reservation, so only
//! the reserving client ever creates the object.

use crate::heap::{Heap, Object, ObjectId, Slot};
use rmem_connect::{
    Arg, Operation, ProtocolVersion, RemoteError, RemoteRef, Reply, Reservation, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
struct PendingReservation {
    token: u64,
    placeholder: ObjectId,
}

#[derive(Debug, Default)]
struct ServiceState {
    heap: Heap,
    registry: HashMap<String, ObjectId>,
    pending: HashMap<String, PendingReservation>,
    next_token: u64,
}

impl ServiceState {
    fn memoize(&mut self, key: &str, obj: &Arg) -> Result<RemoteRef, RemoteError> {
        if let Some(id) = self.registry.get(key).copied() {
            trace!("Key '{}' already memoized, keeping #{}", key, id);
            return self.heap.remote_ref(id);
        }
        let id = self.heap.store(obj)?;
        self.registry.insert(key.to_string(), id);
        debug!("Memoized key '{}' as #{}", key, id);
        self.heap.remote_ref(id)
    }

    fn holds(&self, key: &str, token: u64) -> bool {
        self.pending.get(key).is_some_and(|p| p.token == token)
    }

    /// Forget the reservation on `key` and free its placeholder
    fn cancel_reservation(&mut self, key: &str) -> Option<PendingReservation> {
        let reservation = self.pending.remove(key)?;
        self.heap.free_placeholder(reservation.placeholder);
        Some(reservation)
    }
}

/// Key-to-object registry plus remote object operations
#[derive(Debug)]
pub struct RegistryService {
    state: Mutex<ServiceState>,
    version: ProtocolVersion,
}

impl Default for RegistryService {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryService {
    pub fn new() -> Self {
        Self::with_version(PROTOCOL_VERSION)
    }

    /// Endpoint that reports a specific protocol version to clients
    pub fn with_version(version: ProtocolVersion) -> Self {
        Self {
            state: Mutex::new(ServiceState::default()),
            version,
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map `key` to `obj` unless already mapped; the first writer wins
    pub fn memoize(&self, key: &str, obj: &Arg) -> Result<RemoteRef, RemoteError> {
        self.lock().memoize(key, obj)
    }

    /// Claim `key` for a creator that has yet to build its object
    pub fn reserve(&self, key: &str) -> Result<Reservation, RemoteError> {
        let mut state = self.lock();
        if let Some(id) = state.registry.get(key).copied() {
            trace!("Key '{}' already mapped to #{}, nothing to reserve", key, id);
            return state.heap.remote_ref(id).map(Reservation::Taken);
        }
        state.next_token += 1;
        let token = state.next_token;
        let placeholder = state.heap.alloc(Object::Pending);
        state.registry.insert(key.to_string(), placeholder);
        state
            .pending
            .insert(key.to_string(), PendingReservation { token, placeholder });
        debug!("Reserved key '{}' (token {})", key, token);
        Ok(Reservation::Granted { token })
    }

    /// Put the created object in place of the reservation placeholder
    pub fn fill(&self, key: &str, token: u64, obj: &Arg) -> Result<RemoteRef, RemoteError> {
        let mut state = self.lock();
        if !state.holds(key, token) {
            debug!("Reservation {} on '{}' is gone, memoizing instead", token, key);
            return state.memoize(key, obj);
        }
        let id = state.heap.store(obj)?;
        state.registry.insert(key.to_string(), id);
        state.cancel_reservation(key);
        debug!("Filled reservation {} on '{}' with #{}", token, key, id);
        state.heap.remote_ref(id)
    }

    /// Give a reserved key back; false if `token` no longer holds it
    pub fn release(&self, key: &str, token: u64) -> bool {
        let mut state = self.lock();
        if !state.holds(key, token) {
            return false;
        }
        if let Some(reservation) = state.cancel_reservation(key) {
            if state.registry.get(key) == Some(&reservation.placeholder) {
                state.registry.remove(key);
            }
        }
        debug!("Released reservation {} on '{}'", token, key);
        true
    }

    pub fn get(&self, key: &str) -> Result<RemoteRef, RemoteError> {
        let state = self.lock();
        let id = state
            .registry
            .get(key)
            .copied()
            .ok_or_else(|| RemoteError::key_not_found(key))?;
        state.heap.remote_ref(id)
    }

    /// Map `key` to `obj`, replacing any previous mapping
    pub fn update(&self, key: &str, obj: &Arg) -> Result<RemoteRef, RemoteError> {
        let mut state = self.lock();
        let id = state.heap.store(obj)?;
        if let Some(previous) = state.registry.insert(key.to_string(), id) {
            debug!("Key '{}' rebound from #{} to #{}", key, previous, id);
        } else {
            debug!("Key '{}' bound to #{}", key, id);
        }
        state.cancel_reservation(key);
        state.heap.remote_ref(id)
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.lock();
        let removed = state.registry.remove(key).is_some();
        state.cancel_reservation(key);
        if removed {
            debug!("Deleted key '{}'", key);
        }
        removed
    }

    pub fn is_memoized(&self, key: &str) -> bool {
        self.lock().registry.contains_key(key)
    }

    pub fn remote_import(&self, module: &str) -> Result<RemoteRef, RemoteError> {
        let mut state = self.lock();
        let id = state.heap.import(module)?;
        state.heap.remote_ref(id)
    }

    pub fn invoke(&self, target: &RemoteRef, op: Operation) -> Result<Reply, RemoteError> {
        trace!("{} on {}", op.name(), target);
        let mut state = self.lock();
        state.heap.invoke(target.id, op)
    }

    /// Number of mapped keys
    pub fn len(&self) -> usize {
        self.lock().registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().registry.is_empty()
    }

    /// Mapped keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().registry.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Plain-data view of the object mapped to `key`
    pub fn value_of(&self, key: &str) -> Result<serde_json::Value, RemoteError> {
        let state = self.lock();
        let id = state
            .registry
            .get(key)
            .copied()
            .ok_or_else(|| RemoteError::key_not_found(key))?;
        state.heap.snapshot(&Slot::Object(id))
    }
}

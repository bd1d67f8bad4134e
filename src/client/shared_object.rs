//! SharedObject: a keyed proxy for a registry entry
//!
//! The proxy holds only a key and a [`ConnectionSource`]. The registry owns
//! the object; every forwarded operation looks the key up again, so the proxy
//! always acts on whatever the key currently maps to.

use rmem_connect::{Arg, ConnectionGuardian, Operation, RemoteRef, Reservation};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

use super::remote_object::{ConnectionSource, Forward, RemoteObject, RemoteValue};
use crate::error::{Result, RmemError};

/// Deferred creation of the object for a key
pub type Generator = Box<dyn FnOnce() -> Result<Arg> + Send>;

/// What to memoize when the key is not mapped yet
pub enum ObjectSource {
    /// An existing value or remote object
    Object(Arg),
    /// Invoked at most once, and only by the proxy that reserved the absent key
    Generator(Generator),
}

impl ObjectSource {
    /// Exactly one of `obj` and `generator` must be given
    pub fn from_parts(obj: Option<Arg>, generator: Option<Generator>) -> Result<Self> {
        match (obj, generator) {
            (Some(obj), None) => Ok(ObjectSource::Object(obj)),
            (None, Some(generator)) => Ok(ObjectSource::Generator(generator)),
            (Some(_), Some(_)) => Err(RmemError::Configuration(
                "pass either a remote object or a generator, not both".to_string(),
            )),
            (None, None) => Err(RmemError::Configuration(
                "a remote object or a generator is required".to_string(),
            )),
        }
    }

    pub fn generator<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<Arg> + Send + 'static,
    {
        ObjectSource::Generator(Box::new(f))
    }
}

impl From<Arg> for ObjectSource {
    fn from(obj: Arg) -> Self {
        ObjectSource::Object(obj)
    }
}

impl From<RemoteObject> for ObjectSource {
    fn from(obj: RemoteObject) -> Self {
        ObjectSource::Object(obj.into())
    }
}

impl From<&RemoteObject> for ObjectSource {
    fn from(obj: &RemoteObject) -> Self {
        ObjectSource::Object(obj.into())
    }
}

impl fmt::Debug for ObjectSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectSource::Object(arg) => f.debug_tuple("Object").field(arg).finish(),
            ObjectSource::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

/// Outcome of a memoize attempt; failures hand back what is left to memoize
type Published = std::result::Result<RemoteRef, (RmemError, Option<ObjectSource>)>;

enum ProxyState {
    /// Not memoized yet; `None` once a generator was spent without success
    Uninitialized(Option<ObjectSource>),
    Memoized,
}

/// Proxy forwarding operations to the registry entry for one key
pub struct SharedObject {
    key: String,
    source: Arc<dyn ConnectionSource>,
    state: Mutex<ProxyState>,
}

impl SharedObject {
    /// Create the proxy and memoize its key right away
    pub fn new(
        key: impl Into<String>,
        source: Arc<dyn ConnectionSource>,
        object: ObjectSource,
    ) -> Result<Self> {
        let proxy = Self::lazy(key, source, object);
        proxy.ensure_memoized()?;
        Ok(proxy)
    }

    /// Create the proxy; the key is memoized by the first operation
    pub fn lazy(
        key: impl Into<String>,
        source: Arc<dyn ConnectionSource>,
        object: ObjectSource,
    ) -> Self {
        Self {
            key: key.into(),
            source,
            state: Mutex::new(ProxyState::Uninitialized(Some(object))),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this proxy has completed its memoization
    pub fn is_memoized_locally(&self) -> bool {
        matches!(*self.lock_state(), ProxyState::Memoized)
    }

    fn lock_state(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_memoized(&self) -> Result<()> {
        let mut state = self.lock_state();
        if matches!(*state, ProxyState::Memoized) {
            return Ok(());
        }

        let guardian = self.source.connection()?;
        let pending = match &mut *state {
            ProxyState::Uninitialized(pending) => pending.take(),
            ProxyState::Memoized => None,
        };

        let Some(object) = pending else {
            if guardian.is_memoized(&self.key)? {
                *state = ProxyState::Memoized;
                return Ok(());
            }
            return Err(RmemError::Configuration(format!(
                "no object left to memoize under key '{}'",
                self.key
            )));
        };

        match self.publish(&guardian, object) {
            Ok(_) => {
                *state = ProxyState::Memoized;
                Ok(())
            }
            Err((e, unused)) => {
                *state = ProxyState::Uninitialized(unused);
                Err(e)
            }
        }
    }

    /// Memoize `object` under the key and return what the key maps to
    ///
    /// A generator runs only after this proxy won the key's reservation. On
    /// failure the error comes back with whatever is still worth memoizing
    /// later: the untouched source, or the object a generator already produced.
    fn publish(
        &self,
        guardian: &ConnectionGuardian,
        object: ObjectSource,
    ) -> Published {
        let generator = match object {
            ObjectSource::Object(arg) => {
                return match guardian.memoize(&self.key, arg.clone()) {
                    Ok(remote) => {
                        debug!("Memoized key '{}' ({})", self.key, remote);
                        Ok(remote)
                    }
                    Err(e) => Err((e.into(), Some(ObjectSource::Object(arg)))),
                };
            }
            ObjectSource::Generator(generator) => generator,
        };

        let token = match guardian.reserve(&self.key) {
            Ok(Reservation::Granted { token }) => token,
            Ok(Reservation::Taken(remote)) => {
                debug!("Key '{}' already memoized; generator not invoked", self.key);
                return Ok(remote);
            }
            Err(e) => return Err((e.into(), Some(ObjectSource::Generator(generator)))),
        };

        let arg = match generator() {
            Ok(arg) => arg,
            Err(e) => {
                self.release(guardian, token);
                return Err((e, None));
            }
        };

        match guardian.fill(&self.key, token, arg.clone()) {
            Ok(remote) => {
                debug!("Memoized generated object for key '{}' ({})", self.key, remote);
                Ok(remote)
            }
            Err(e) => {
                self.release(guardian, token);
                Err((e.into(), Some(ObjectSource::Object(arg))))
            }
        }
    }

    /// Give up a reservation this proxy can no longer fill
    fn release(&self, guardian: &ConnectionGuardian, token: u64) {
        match guardian.release(&self.key, token) {
            Ok(released) => debug!("Released key '{}': {}", self.key, released),
            Err(e) => warn!("Could not release reservation on key '{}': {}", self.key, e),
        }
    }

    fn handle(&self, remote: RemoteRef) -> RemoteObject {
        RemoteObject::new(Arc::clone(&self.source), remote)
    }

    /// Memoize `object` under the key on the registry, first writer wins
    ///
    /// Always talks to the registry, so a proxy whose key was deleted can map
    /// it again. Returns the object the key maps to afterwards.
    pub fn rmem_memoize(&self, object: ObjectSource) -> Result<RemoteObject> {
        let mut state = self.lock_state();
        let guardian = self.source.connection()?;
        let remote = self.publish(&guardian, object).map_err(|(e, _)| e)?;
        *state = ProxyState::Memoized;
        Ok(self.handle(remote))
    }

    /// Object the key currently maps to
    pub fn rmem_get(&self) -> Result<RemoteObject> {
        self.ensure_memoized()?;
        let remote = self.source.connection()?.get(&self.key)?;
        Ok(self.handle(remote))
    }

    /// Replace the registry's object for this key
    pub fn rmem_update(&self, obj: impl Into<Arg>) -> Result<RemoteObject> {
        let remote = self.source.connection()?.update(&self.key, obj.into())?;
        *self.lock_state() = ProxyState::Memoized;
        debug!("Updated key '{}' to {}", self.key, remote);
        Ok(self.handle(remote))
    }

    /// Replace the registry's object with one produced by `generator`
    pub fn rmem_update_with<F>(&self, generator: F) -> Result<RemoteObject>
    where
        F: FnOnce() -> Result<Arg>,
    {
        let obj = generator()?;
        self.rmem_update(obj)
    }

    /// Remove the key from the registry
    ///
    /// The proxy stays usable as a handle; its next forwarded operation fails
    /// with `KeyNotFound` unless someone maps the key again.
    pub fn rmem_delete(&self) -> Result<bool> {
        let removed = self.source.connection()?.delete(&self.key)?;
        debug!("Deleted key '{}': {}", self.key, removed);
        Ok(removed)
    }

    /// Whether the key is currently mapped on the registry
    pub fn rmem_is_memoized(&self) -> Result<bool> {
        Ok(self.source.connection()?.is_memoized(&self.key)?)
    }
}

impl Forward for SharedObject {
    fn invoke(&self, op: Operation) -> Result<RemoteValue> {
        self.ensure_memoized()?;
        let guardian = self.source.connection()?;
        let target = guardian.get(&self.key)?;
        trace!("{} on key '{}' ({})", op.name(), self.key, target);
        let reply = guardian.invoke(&target, op)?;
        Ok(RemoteValue::from_reply(reply, &self.source))
    }
}

impl fmt::Debug for SharedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedObject")
            .field("key", &self.key)
            .field("memoized", &self.is_memoized_locally())
            .finish()
    }
}

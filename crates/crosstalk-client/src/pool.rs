//! The connection directory: one live connection per `(peer, identity)`.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crosstalk_wire::{Identity, Payload};
use parking_lot::Mutex;

use crate::call::Call;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::connector::Connector;
use crate::errors::CallError;

/// A shareable handle to an [`Identity`].
///
/// Equality and hashing follow the handle, not the content: two identities
/// acquired through separate flows are distinct principals even when their
/// fields compare equal, and each gets its own pooled connection. Clones of
/// one handle are the same principal.
#[derive(Debug, Clone)]
pub struct IdentityHandle(Arc<Identity>);

impl IdentityHandle {
    /// Wrap an identity in a new, distinct handle.
    pub fn new(identity: Identity) -> Self {
        Self(Arc::new(identity))
    }
}

impl PartialEq for IdentityHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for IdentityHandle {}

impl Hash for IdentityHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl Deref for IdentityHandle {
    type Target = Identity;

    fn deref(&self) -> &Identity {
        &self.0
    }
}

impl AsRef<Identity> for IdentityHandle {
    fn as_ref(&self) -> &Identity {
        &self.0
    }
}

/// What a pooled connection is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionKey {
    peer: String,
    identity: Option<IdentityHandle>,
}

impl ConnectionKey {
    pub(crate) fn new(peer: &str, identity: Option<IdentityHandle>) -> Self {
        Self {
            peer: peer.to_owned(),
            identity,
        }
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn identity(&self) -> Option<&IdentityHandle> {
        self.identity.as_ref()
    }
}

pub(crate) struct Pool<C: Connector, V: Payload> {
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) connector: Arc<C>,
    pub(crate) running: Arc<AtomicBool>,
    connections: Mutex<HashMap<ConnectionKey, Arc<Connection<C, V>>>>,
}

impl<C: Connector, V: Payload> Pool<C, V> {
    pub(crate) fn new(config: ClientConfig, connector: C) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            connector: Arc::new(connector),
            running: Arc::new(AtomicBool::new(true)),
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Find or create the connection for `key` and register `call` on it.
    ///
    /// Registration runs with the pool lock released; a connection that
    /// closes between lookup and registration is dropped from the map and
    /// the lookup repeats. The caller still has to run `setup_io` on the
    /// returned connection, also outside the pool lock.
    pub(crate) fn acquire(
        self: &Arc<Self>,
        key: &ConnectionKey,
        call: &mut Call<V>,
    ) -> Result<Arc<Connection<C, V>>, CallError> {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(CallError::ClientStopped);
            }

            let conn = {
                let mut connections = self.connections.lock();
                match connections.get(key) {
                    Some(conn) => conn.clone(),
                    None => {
                        let conn = Connection::new(key.clone(), self);
                        connections.insert(key.clone(), conn.clone());
                        conn
                    }
                }
            };

            if conn.register(call) {
                return Ok(conn);
            }

            // The connection started closing before we could register. Its
            // close will skip the pool removal once we have replaced it.
            self.remove_if_same(key, &conn);
        }
    }

    /// Remove the mapping for `key` only if it still points at `conn`.
    pub(crate) fn remove_if_same(&self, key: &ConnectionKey, conn: &Connection<C, V>) {
        let mut connections = self.connections.lock();
        if let Some(current) = connections.get(key) {
            if std::ptr::eq(Arc::as_ptr(current), conn) {
                connections.remove(key);
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Connection<C, V>>> {
        self.connections.lock().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(handle: &IdentityHandle) -> u64 {
        let mut hasher = DefaultHasher::new();
        handle.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn identity_handles_compare_by_handle_not_content() {
        let a = IdentityHandle::new(Identity::new("scanner"));
        let b = IdentityHandle::new(Identity::new("scanner"));
        assert_eq!(*a, *b);
        assert_ne!(a, b);
        assert_ne!(hash_of(&a), hash_of(&b));

        let a2 = a.clone();
        assert_eq!(a, a2);
        assert_eq!(hash_of(&a), hash_of(&a2));
    }

    #[test]
    fn keys_separate_identities_on_the_same_peer() {
        let a = IdentityHandle::new(Identity::new("scanner"));
        let b = IdentityHandle::new(Identity::new("scanner"));

        let key_a = ConnectionKey::new("region-a:60020", Some(a.clone()));
        let key_b = ConnectionKey::new("region-a:60020", Some(b));
        let key_none = ConnectionKey::new("region-a:60020", None);

        assert_ne!(key_a, key_b);
        assert_ne!(key_a, key_none);
        assert_eq!(key_a, ConnectionKey::new("region-a:60020", Some(a)));
    }
}

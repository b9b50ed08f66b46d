//! Connection registry
//!
//! Maps `(execution context, logical name)` to the live `Connection` for
//! that pair. The registry holds a strong reference to every registered
//! connection; a connection leaves only through `Connection::dispose`.

use super::connection::Connection;
use super::context::ExecutionContextId;
use super::error::{DatabaseError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Registry key; the name compares case-insensitively
#[derive(Debug, Clone)]
pub struct ConnectionKey {
    context: ExecutionContextId,
    name: String,
}

impl ConnectionKey {
    /// Create a key
    pub fn new(context: ExecutionContextId, name: impl Into<String>) -> Self {
        Self {
            context,
            name: name.into(),
        }
    }

    /// Owning execution context
    pub fn context(&self) -> ExecutionContextId {
        self.context
    }

    /// Logical name as given
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for ConnectionKey {
    fn eq(&self, other: &Self) -> bool {
        self.context == other.context && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for ConnectionKey {}

impl Hash for ConnectionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.context.hash(state);
        for byte in self.name.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.context, self.name)
    }
}

/// Process-wide map of live connections
///
/// Every operation takes the same lock, so lookup-or-create decisions are
/// atomic across execution contexts.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionKey, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection registered under `key`
    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.entries.lock().get(key).cloned()
    }

    /// Register `connection` under `key`
    ///
    /// # Errors
    ///
    /// Returns `DuplicateConnectionIdentity` when a different connection
    /// already occupies the key. Re-registering the same connection is a
    /// no-op.
    pub fn set(&self, key: ConnectionKey, connection: Arc<Connection>) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            if Arc::ptr_eq(existing, &connection) {
                return Ok(());
            }
            return Err(DatabaseError::DuplicateConnectionIdentity {
                context: key.context,
                name: key.name,
            });
        }
        entries.insert(key, connection);
        Ok(())
    }

    /// Whether a connection is registered under `key`
    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Remove `connection` from its own key
    ///
    /// # Errors
    ///
    /// Returns `RegistryInconsistency` when the key is empty or holds a
    /// different connection. This signals a double dispose or a key
    /// mismatch and is never ignored.
    pub fn remove(&self, connection: &Connection) -> Result<()> {
        let key = connection.key();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(existing) if std::ptr::eq(Arc::as_ptr(existing), connection) => {
                entries.remove(key);
                Ok(())
            }
            Some(_) => Err(DatabaseError::registry(format!(
                "key {} is held by a different connection than the one being removed",
                key
            ))),
            None => Err(DatabaseError::registry(format!(
                "could not find connection {} (target {}) in the registry",
                key,
                connection.target()
            ))),
        }
    }

    /// Look up `key`, registering the result of `make` when it is absent
    ///
    /// Returns the connection and whether it was created by this call.
    /// `make` runs under the registry lock and must not block.
    pub fn get_or_insert_with<F>(&self, key: ConnectionKey, make: F) -> (Arc<Connection>, bool)
    where
        F: FnOnce() -> Arc<Connection>,
    {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            return (Arc::clone(existing), false);
        }
        let connection = make();
        entries.insert(key, Arc::clone(&connection));
        (connection, true)
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Keys registered for one execution context
    pub fn keys_for(&self, context: ExecutionContextId) -> Vec<ConnectionKey> {
        self.entries
            .lock()
            .keys()
            .filter(|k| k.context == context)
            .cloned()
            .collect()
    }
}

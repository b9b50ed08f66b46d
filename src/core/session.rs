//! Sessions
//!
//! A session couples one transaction to one connection. The first session
//! requested on an execution context is the root: it gets its own
//! connection and a root transaction. Sessions requested on the same context
//! while the root is alive nest under it, share its connection and run in
//! a savepoint.

use super::connection::Connection;
use super::context::ExecutionContextId;
use super::driver::Driver;
use super::error::{DatabaseError, Result};
use super::registry::ConnectionRegistry;
use super::target::ConnectionTarget;
use super::transaction::{IsolationLevel, Transaction};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// State of a root session shared with its nested sessions
pub struct SessionNode {
    id: Uuid,
    context: ExecutionContextId,
    target: ConnectionTarget,
    connection: Arc<Connection>,
    children: Mutex<Vec<Uuid>>,
}

impl SessionNode {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> ExecutionContextId {
        self.context
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Ids of the live nested sessions
    pub fn children(&self) -> Vec<Uuid> {
        self.children.lock().clone()
    }

    fn remove_child(&self, id: Uuid) {
        self.children.lock().retain(|child| *child != id);
    }
}

impl fmt::Debug for SessionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionNode")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("connection", &self.connection.key())
            .field("children", &self.children.lock().len())
            .finish()
    }
}

/// Map from execution context to its root session
#[derive(Default)]
pub struct SessionRegistry {
    roots: Mutex<HashMap<ExecutionContextId, Arc<SessionNode>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root session of `context`
    pub fn get(&self, context: ExecutionContextId) -> Option<Arc<SessionNode>> {
        self.roots.lock().get(&context).cloned()
    }

    /// Register the root session of `context`
    ///
    /// # Errors
    ///
    /// `RegistryInconsistency` if the context already has a root.
    pub fn insert(&self, node: Arc<SessionNode>) -> Result<()> {
        let mut roots = self.roots.lock();
        if let Some(existing) = roots.get(&node.context) {
            return Err(DatabaseError::registry(format!(
                "execution context {} already has root session {}",
                node.context, existing.id
            )));
        }
        roots.insert(node.context, node);
        Ok(())
    }

    /// Remove the root of `context` if it is session `id`
    pub fn remove(&self, context: ExecutionContextId, id: Uuid) -> bool {
        let mut roots = self.roots.lock();
        match roots.get(&context) {
            Some(node) if node.id == id => {
                roots.remove(&context);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, context: ExecutionContextId) -> bool {
        self.roots.lock().contains_key(&context)
    }

    pub fn len(&self) -> usize {
        self.roots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.lock().is_empty()
    }
}

enum Scope {
    Root(Arc<SessionNode>),
    Nested(Arc<SessionNode>),
}

/// Unit-of-work handle
///
/// Dispose explicitly with [`Session::dispose`]. A session dropped without
/// disposal still leaves the registries, and its rollback and disconnect are
/// scheduled on the current runtime.
pub struct Session {
    id: Uuid,
    context: ExecutionContextId,
    scope: Scope,
    transaction: Arc<Transaction>,
    sessions: Arc<SessionRegistry>,
    disposed: bool,
}

impl Session {
    /// Commit this session's transaction
    pub async fn commit(&self) -> Result<()> {
        self.transaction.commit().await
    }

    /// Roll back this session's transaction
    pub async fn rollback(&self) -> Result<()> {
        self.transaction.rollback().await
    }

    /// End the session
    ///
    /// Rolls back the transaction if it is still active. A root session then
    /// disposes its connection and frees the execution context; a nested
    /// session leaves the shared connection to its root. Cleanup runs even
    /// when the rollback fails; the first error is returned.
    pub async fn dispose(mut self) -> Result<()> {
        self.disposed = true;
        let ended = self.transaction.dispose().await;

        let released = match &self.scope {
            Scope::Root(node) => {
                let disposed = node.connection.dispose().await;
                self.sessions.remove(self.context, self.id);
                debug!(session_id = %self.id, context = %self.context, "Root session disposed");
                disposed
            }
            Scope::Nested(root) => {
                root.remove_child(self.id);
                debug!(session_id = %self.id, parent_id = %root.id, "Nested session disposed");
                Ok(())
            }
        };

        ended.and(released)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> ExecutionContextId {
        self.context
    }

    /// Root session id for a nested session
    pub fn parent_id(&self) -> Option<Uuid> {
        match &self.scope {
            Scope::Root(_) => None,
            Scope::Nested(root) => Some(root.id),
        }
    }

    /// Ids of live sessions nested under this one
    pub fn children(&self) -> Vec<Uuid> {
        match &self.scope {
            Scope::Root(node) => node.children(),
            Scope::Nested(_) => Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self.scope, Scope::Root(_))
    }

    /// Whether the transaction can still be committed or rolled back
    pub fn is_active(&self) -> bool {
        !self.disposed && !self.transaction.is_ended()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        self.transaction.connection()
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("parent", &self.parent_id())
            .field("transaction", &self.transaction)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        warn!(session_id = %self.id, context = %self.context, "Session dropped without dispose");

        // queues the rollback ahead of the connection's next use
        self.transaction.abandon();

        match &self.scope {
            Scope::Root(node) => {
                self.sessions.remove(self.context, self.id);
                if let Err(e) = node.connection.detach() {
                    warn!(session_id = %self.id, error = %e, "Failed to release session connection");
                }
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let connection = Arc::clone(&node.connection);
                    let session_id = self.id;
                    handle.spawn(async move {
                        if let Err(e) = connection.disconnect().await {
                            warn!(session_id = %session_id, error = %e, "Failed to close connection of dropped session");
                        }
                    });
                }
            }
            Scope::Nested(root) => root.remove_child(self.id),
        }
    }
}

/// Factory deciding between root and nested sessions
///
/// Owns the connection and session registries.
pub struct SessionManager {
    driver: Arc<dyn Driver>,
    connections: Arc<ConnectionRegistry>,
    sessions: Arc<SessionRegistry>,
    gate: tokio::sync::Mutex<()>,
}

impl SessionManager {
    /// Create a manager with empty registries
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self::with_registries(
            driver,
            Arc::new(ConnectionRegistry::new()),
            Arc::new(SessionRegistry::new()),
        )
    }

    /// Create a manager over existing registries
    pub fn with_registries(
        driver: Arc<dyn Driver>,
        connections: Arc<ConnectionRegistry>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            driver,
            connections,
            sessions,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Get a session for `context`
    ///
    /// Returns a root session when the context has none, otherwise a
    /// session nested under the existing root.
    ///
    /// # Errors
    ///
    /// - `ConflictingConnectionTarget` when nesting with a different target
    /// - `ConnectionFailure` when the root connection cannot be opened
    /// - driver failures while starting the transaction
    pub async fn get_session(
        &self,
        context: ExecutionContextId,
        target: &ConnectionTarget,
        isolation: IsolationLevel,
    ) -> Result<Session> {
        let _gate = self.gate.lock().await;

        match self.sessions.get(context) {
            None => self.open_root(context, target, isolation).await,
            Some(root) => self.open_nested(root, target, isolation).await,
        }
    }

    async fn open_root(
        &self,
        context: ExecutionContextId,
        target: &ConnectionTarget,
        isolation: IsolationLevel,
    ) -> Result<Session> {
        let id = Uuid::new_v4();
        let name = format!("session-{}", id);
        let connection =
            Connection::get_or_create(&self.connections, &self.driver, context, &name, target, true).await?;

        let transaction = match Transaction::begin(&connection, id, isolation).await {
            Ok(transaction) => Arc::new(transaction),
            Err(e) => {
                if let Err(dispose_err) = connection.dispose().await {
                    warn!(session_id = %id, error = %dispose_err, "Failed to dispose connection");
                }
                return Err(e);
            }
        };

        let node = Arc::new(SessionNode {
            id,
            context,
            target: target.clone(),
            connection: Arc::clone(&connection),
            children: Mutex::new(Vec::new()),
        });

        if let Err(e) = self.sessions.insert(Arc::clone(&node)) {
            if let Err(rollback_err) = transaction.dispose().await {
                warn!(session_id = %id, error = %rollback_err, "Failed to roll back unregistered session");
            }
            if let Err(dispose_err) = connection.dispose().await {
                warn!(session_id = %id, error = %dispose_err, "Failed to dispose connection");
            }
            return Err(e);
        }

        info!(session_id = %id, context = %context, "Root session started");
        Ok(Session {
            id,
            context,
            scope: Scope::Root(node),
            transaction,
            sessions: Arc::clone(&self.sessions),
            disposed: false,
        })
    }

    async fn open_nested(
        &self,
        root: Arc<SessionNode>,
        target: &ConnectionTarget,
        isolation: IsolationLevel,
    ) -> Result<Session> {
        if root.target != *target {
            return Err(DatabaseError::conflicting_target(
                root.connection.name(),
                root.target.to_string(),
                target.to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let transaction = Arc::new(Transaction::begin(&root.connection, id, isolation).await?);
        root.children.lock().push(id);

        debug!(session_id = %id, parent_id = %root.id, "Nested session started");
        Ok(Session {
            id,
            context: root.context,
            scope: Scope::Nested(root),
            transaction,
            sessions: Arc::clone(&self.sessions),
            disposed: false,
        })
    }

    /// Connection of the root session active on `context`
    pub fn session_connection(&self, context: ExecutionContextId) -> Option<Arc<Connection>> {
        self.sessions
            .get(context)
            .map(|node| Arc::clone(&node.connection))
    }

    /// Target of the root session active on `context`
    pub fn session_target(&self, context: ExecutionContextId) -> Option<ConnectionTarget> {
        self.sessions.get(context).map(|node| node.target.clone())
    }

    pub fn has_session(&self, context: ExecutionContextId) -> bool {
        self.sessions.contains(context)
    }

    /// Run `work` inside a session
    ///
    /// Commits when `work` succeeds and rolls back when it fails; the
    /// session is disposed either way. An error from `work` takes precedence
    /// over errors from ending the session.
    pub async fn run_in_session<F, Fut, T>(
        &self,
        context: ExecutionContextId,
        target: &ConnectionTarget,
        isolation: IsolationLevel,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.get_session(context, target, isolation).await?;
        let outcome = work(Arc::clone(session.connection())).await;

        let ended = match &outcome {
            Ok(_) => session.commit().await,
            Err(e) => {
                debug!(session_id = %session.id(), error = %e, "Work failed, rolling back");
                session.rollback().await
            }
        };
        let disposed = session.dispose().await;

        let value = outcome?;
        ended?;
        disposed?;
        Ok(value)
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("driver", &self.driver.database_type())
            .field("connections", &self.connections.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

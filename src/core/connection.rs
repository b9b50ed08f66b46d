//! Registered connections
//!
//! A `Connection` owns at most one physical link and the marker of the root
//! transaction currently open on it. It lives in a `ConnectionRegistry`
//! slot from creation until `dispose`.
//!
//! Transactions dropped without being ended cannot reach the link from
//! `Drop`. They queue a `PendingEnd` instead, and every later use of the
//! link applies the queue first, in order.

use super::context::ExecutionContextId;
use super::driver::{DatabaseType, Driver, DriverLink, Statement, StatementOutcome};
use super::error::{DatabaseError, DriverError, DriverResult, Result};
use super::registry::{ConnectionKey, ConnectionRegistry};
use super::target::ConnectionTarget;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub(crate) type LinkSlot = Option<Box<dyn DriverLink>>;

/// Rollback owed by a transaction that was dropped while still open
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingEnd {
    Rollback { id: Uuid },
    RollbackTo { id: Uuid, savepoint: String },
}

impl PendingEnd {
    fn id(&self) -> Uuid {
        match self {
            Self::Rollback { id } | Self::RollbackTo { id, .. } => *id,
        }
    }
}

/// A named, context-bound database connection
pub struct Connection {
    key: ConnectionKey,
    target: ConnectionTarget,
    driver: Arc<dyn Driver>,
    registry: Weak<ConnectionRegistry>,
    link: Mutex<LinkSlot>,
    active_transaction: parking_lot::Mutex<Option<Uuid>>,
    pending_ends: parking_lot::Mutex<Vec<PendingEnd>>,
}

impl Connection {
    fn unregistered(
        registry: &Arc<ConnectionRegistry>,
        driver: Arc<dyn Driver>,
        key: ConnectionKey,
        target: ConnectionTarget,
    ) -> Self {
        Self {
            key,
            target,
            driver,
            registry: Arc::downgrade(registry),
            link: Mutex::new(None),
            active_transaction: parking_lot::Mutex::new(None),
            pending_ends: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Create and register a new connection
    ///
    /// # Errors
    ///
    /// - `DuplicateConnectionIdentity` if the key is already taken
    /// - `ConnectionFailure` if `auto_connect` is set and the link cannot be
    ///   opened; the registration is undone in that case
    pub async fn create(
        registry: &Arc<ConnectionRegistry>,
        driver: &Arc<dyn Driver>,
        context: ExecutionContextId,
        name: &str,
        target: &ConnectionTarget,
        auto_connect: bool,
    ) -> Result<Arc<Self>> {
        let key = ConnectionKey::new(context, name);
        let connection = Arc::new(Self::unregistered(
            registry,
            Arc::clone(driver),
            key.clone(),
            target.clone(),
        ));
        registry.set(key, Arc::clone(&connection))?;
        connection.finish_creation(registry, auto_connect).await?;
        Ok(connection)
    }

    /// Return the connection registered for `(context, name)`, creating it
    /// when absent
    ///
    /// # Errors
    ///
    /// - `ConflictingConnectionTarget` when the name is registered with a
    ///   different target; the existing connection is left untouched
    /// - `ConnectionFailure` when a new connection fails to auto-connect
    pub async fn get_or_create(
        registry: &Arc<ConnectionRegistry>,
        driver: &Arc<dyn Driver>,
        context: ExecutionContextId,
        name: &str,
        target: &ConnectionTarget,
        auto_connect: bool,
    ) -> Result<Arc<Self>> {
        let key = ConnectionKey::new(context, name);
        let (connection, created) = registry.get_or_insert_with(key.clone(), || {
            Arc::new(Self::unregistered(
                registry,
                Arc::clone(driver),
                key,
                target.clone(),
            ))
        });

        if !created {
            if connection.target != *target {
                return Err(DatabaseError::conflicting_target(
                    name,
                    connection.target.to_string(),
                    target.to_string(),
                ));
            }
            debug!(key = %connection.key, "Reusing registered connection");
            return Ok(connection);
        }

        connection.finish_creation(registry, auto_connect).await?;
        Ok(connection)
    }

    async fn finish_creation(&self, registry: &ConnectionRegistry, auto_connect: bool) -> Result<()> {
        debug!(key = %self.key, target = %self.target, "Registered connection");
        if !auto_connect {
            return Ok(());
        }
        if let Err(err) = self.connect().await {
            if let Err(remove_err) = registry.remove(self) {
                warn!(key = %self.key, error = %remove_err, "Failed to undo registration");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Open the physical link, closing the current one first
    ///
    /// # Errors
    ///
    /// Returns `ConnectionFailure` when the driver cannot open the link.
    pub async fn connect(&self) -> Result<()> {
        self.reconnect()
            .await
            .map_err(|e| DatabaseError::connection_failure(self.target.to_string(), e))
    }

    pub(crate) async fn reconnect(&self) -> DriverResult<()> {
        let mut slot = self.link.lock().await;
        // ends owed to the old link die with it
        let discarded = std::mem::take(&mut *self.pending_ends.lock());
        if !discarded.is_empty() {
            debug!(key = %self.key, discarded = discarded.len(), "Dropped deferred rollbacks of the old link");
        }
        Self::close_slot(&self.key, &mut slot).await;

        let effective = self.target.without_pooling();
        let link = self.driver.open(&effective).await?;
        *slot = Some(link);

        info!(key = %self.key, driver = %self.driver.database_type(), "Connection opened");
        Ok(())
    }

    /// Close the physical link; no-op when not connected
    ///
    /// Deferred rollbacks are applied before the link closes. The
    /// active-transaction marker is left alone: ending transactions is the
    /// transaction's job.
    pub async fn disconnect(&self) -> Result<()> {
        let (mut slot, _settled) = self.lock_link().await;
        Self::close_slot(&self.key, &mut slot).await;
        Ok(())
    }

    async fn close_slot(key: &ConnectionKey, slot: &mut LinkSlot) {
        if let Some(mut link) = slot.take() {
            if let Err(e) = link.close().await {
                warn!(key = %key, error = %e, "Error while closing link");
            }
            debug!(key = %key, "Connection closed");
        }
    }

    /// Disconnect and leave the registry
    ///
    /// # Errors
    ///
    /// Returns `RegistryInconsistency` if the connection is no longer
    /// registered under its key (double dispose).
    pub async fn dispose(&self) -> Result<()> {
        self.disconnect().await?;
        self.detach()
    }

    /// Leave the registry without touching the link
    pub(crate) fn detach(&self) -> Result<()> {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self),
            None => Ok(()),
        }
    }

    /// Whether a link is present and reports itself open
    pub async fn is_connected(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .map_or(false, |link| link.is_open())
    }

    /// Id of the root transaction currently open on this connection
    pub fn active_transaction(&self) -> Option<Uuid> {
        *self.active_transaction.lock()
    }

    /// Whether a root transaction is open
    pub fn in_transaction(&self) -> bool {
        self.active_transaction.lock().is_some()
    }

    /// Claim the root slot for transaction `id`; false if one is active
    pub(crate) fn claim_root(&self, id: Uuid) -> bool {
        let mut active = self.active_transaction.lock();
        if active.is_some() {
            return false;
        }
        *active = Some(id);
        true
    }

    /// Clear the root slot if it still belongs to `id`
    pub(crate) fn transaction_ended(&self, id: Uuid) {
        let mut active = self.active_transaction.lock();
        if *active == Some(id) {
            *active = None;
        }
    }

    /// Queue a rollback for the next use of the link
    pub(crate) fn defer_end(&self, end: PendingEnd) {
        debug!(key = %self.key, transaction_id = %end.id(), "Deferring rollback of dropped transaction");
        self.pending_ends.lock().push(end);
    }

    /// Number of rollbacks waiting for the link
    pub fn pending_ends(&self) -> usize {
        self.pending_ends.lock().len()
    }

    /// Lock the link and apply the deferred rollbacks queued so far
    ///
    /// The second value carries the first failure among them. The guard is
    /// returned either way so a caller that is itself rolling back can go on.
    pub(crate) async fn lock_link(&self) -> (MutexGuard<'_, LinkSlot>, DriverResult<()>) {
        let mut slot = self.link.lock().await;
        let settled = self.apply_pending_ends(&mut slot).await;
        (slot, settled)
    }

    async fn apply_pending_ends(&self, slot: &mut LinkSlot) -> DriverResult<()> {
        let pending = std::mem::take(&mut *self.pending_ends.lock());
        if pending.is_empty() {
            return Ok(());
        }
        let link = match open_link(slot) {
            Ok(link) => link,
            Err(_) => {
                debug!(key = %self.key, discarded = pending.len(), "Link gone, deferred rollbacks dropped");
                return Ok(());
            }
        };

        let mut first_failure = None;
        for end in pending {
            let outcome = match &end {
                PendingEnd::Rollback { .. } => link.rollback().await,
                PendingEnd::RollbackTo { savepoint, .. } => link.rollback_to(savepoint).await,
            };
            match outcome {
                Ok(()) => debug!(key = %self.key, transaction_id = %end.id(), "Deferred rollback applied"),
                Err(e) => {
                    error!(key = %self.key, transaction_id = %end.id(), error = %e, "Deferred rollback failed");
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Run a statement on the current link
    pub(crate) async fn run(&self, statement: &Statement) -> DriverResult<StatementOutcome> {
        let (mut slot, settled) = self.lock_link().await;
        settled?;
        open_link(&mut slot)?.run(statement).await
    }

    /// Registry key
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Logical name
    pub fn name(&self) -> &str {
        self.key.name()
    }

    /// Owning execution context
    pub fn context(&self) -> ExecutionContextId {
        self.key.context()
    }

    /// Target as requested by the creator
    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Dialect of the underlying driver
    pub fn database_type(&self) -> DatabaseType {
        self.driver.database_type()
    }
}

/// The link in `slot`, if it can still run statements
pub(crate) fn open_link(slot: &mut LinkSlot) -> DriverResult<&mut Box<dyn DriverLink>> {
    match slot.as_mut() {
        Some(link) if link.is_open() => Ok(link),
        Some(_) => Err(DriverError::unusable("link is broken")),
        None => Err(DriverError::unusable("connection is not open")),
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("target", &self.target.to_string())
            .field("active_transaction", &self.active_transaction())
            .field("pending_ends", &self.pending_ends())
            .finish()
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::backends::SqliteDriver;

    fn driver() -> Arc<dyn Driver> {
        Arc::new(SqliteDriver::new())
    }

    fn memory() -> ConnectionTarget {
        ConnectionTarget::parse(":memory:").unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_instance() -> Result<()> {
        let registry = Arc::new(ConnectionRegistry::new());
        let driver = driver();
        let ctx = ExecutionContextId::new();

        let first = Connection::get_or_create(&registry, &driver, ctx, "main", &memory(), true).await?;
        let second = Connection::get_or_create(&registry, &driver, ctx, "MAIN", &memory(), true).await?;

        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_connected().await);
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_conflicting_target_leaves_existing_untouched() -> Result<()> {
        let registry = Arc::new(ConnectionRegistry::new());
        let driver = driver();
        let ctx = ExecutionContextId::new();

        let first = Connection::get_or_create(&registry, &driver, ctx, "main", &memory(), true).await?;
        let other = ConnectionTarget::parse("data source=other.db").unwrap();
        let err = Connection::get_or_create(&registry, &driver, ctx, "main", &other, true)
            .await
            .unwrap_err();

        assert!(matches!(err, DatabaseError::ConflictingConnectionTarget { .. }));
        assert!(first.is_connected().await);
        assert_eq!(first.target(), &memory());
        Ok(())
    }

    #[tokio::test]
    async fn test_contexts_get_distinct_connections() -> Result<()> {
        let registry = Arc::new(ConnectionRegistry::new());
        let driver = driver();

        let a = Connection::get_or_create(&registry, &driver, ExecutionContextId::new(), "main", &memory(), false).await?;
        let b = Connection::get_or_create(&registry, &driver, ExecutionContextId::new(), "main", &memory(), false).await?;

        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!a.is_connected().await);
        assert_eq!(registry.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_identity() -> Result<()> {
        let registry = Arc::new(ConnectionRegistry::new());
        let driver = driver();
        let ctx = ExecutionContextId::new();

        Connection::create(&registry, &driver, ctx, "main", &memory(), false).await?;
        let err = Connection::create(&registry, &driver, ctx, "Main", &memory(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::DuplicateConnectionIdentity { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_disconnect_dispose() -> Result<()> {
        let registry = Arc::new(ConnectionRegistry::new());
        let driver = driver();
        let ctx = ExecutionContextId::new();

        let conn = Connection::get_or_create(&registry, &driver, ctx, "main", &memory(), false).await?;
        conn.connect().await?;
        conn.connect().await?;
        assert!(conn.is_connected().await);

        conn.disconnect().await?;
        assert!(!conn.is_connected().await);
        conn.disconnect().await?;
        assert!(registry.contains(conn.key()));

        conn.dispose().await?;
        assert!(!registry.contains(conn.key()));

        let err = conn.dispose().await.unwrap_err();
        assert!(matches!(err, DatabaseError::RegistryInconsistency(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_auto_connect_is_not_registered() {
        let registry = Arc::new(ConnectionRegistry::new());
        let driver = driver();
        let target = ConnectionTarget::parse("data source=/nonexistent/dir/app.db;mode=rw").unwrap();

        let err = Connection::get_or_create(&registry, &driver, ExecutionContextId::new(), "main", &target, true)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::ConnectionFailure { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_root_slot_claim() {
        let registry = Arc::new(ConnectionRegistry::new());
        let conn = Connection::get_or_create(&registry, &driver(), ExecutionContextId::new(), "main", &memory(), false)
            .await
            .unwrap();
        let first = Uuid::new_v4();
        assert!(conn.claim_root(first));
        assert!(!conn.claim_root(Uuid::new_v4()));
        conn.transaction_ended(Uuid::new_v4());
        assert_eq!(conn.active_transaction(), Some(first));
        conn.transaction_ended(first);
        assert!(!conn.in_transaction());
    }
}

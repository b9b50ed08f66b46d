//! Root transactions and savepoints
//!
//! The first transaction begun on a connection is a genuine driver
//! transaction (`Root`). Any transaction begun while a root is active is a
//! `SavePoint` inside it. Both follow `Active -> Committed | RolledBack`.
//!
//! Dropping an active transaction ends it as rolled back on the spot and
//! queues the physical rollback on its connection, where it runs ahead of
//! whatever uses the link next.

use super::connection::{open_link, Connection, PendingEnd};
use super::error::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Driver default
    #[default]
    Unspecified,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

impl IsolationLevel {
    /// SQL spelling, `None` for `Unspecified`
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            IsolationLevel::Unspecified => None,
            IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
            IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
            IsolationLevel::Serializable => Some("SERIALIZABLE"),
            // Closest standard level for dialects without snapshot isolation
            IsolationLevel::Snapshot => Some("REPEATABLE READ"),
        }
    }
}

/// Whether a transaction owns the driver transaction or nests inside one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Root,
    SavePoint,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Root => write!(f, "root"),
            TransactionKind::SavePoint => write!(f, "savepoint"),
        }
    }
}

/// A root transaction or savepoint on one connection
pub struct Transaction {
    id: Uuid,
    kind: TransactionKind,
    isolation: IsolationLevel,
    root_id: Uuid,
    connection: Arc<Connection>,
    ended: AtomicBool,
    committed: AtomicBool,
}

impl Transaction {
    /// Begin a transaction on `connection`
    ///
    /// Becomes the root when the connection has no active transaction,
    /// otherwise marks a savepoint named after `id` inside the active root.
    /// `isolation` only takes effect for a root.
    ///
    /// # Errors
    ///
    /// `ConnectionFailure` when the connection is not open,
    /// `CommandExecutionFailure` when the driver rejects the statement.
    pub async fn begin(
        connection: &Arc<Connection>,
        id: Uuid,
        isolation: IsolationLevel,
    ) -> Result<Self> {
        let (kind, root_id) = if connection.claim_root(id) {
            (TransactionKind::Root, id)
        } else {
            let root = connection
                .active_transaction()
                .ok_or_else(|| DatabaseError::registry("active transaction vanished during begin"))?;
            (TransactionKind::SavePoint, root)
        };

        let transaction = Self {
            id,
            kind,
            isolation,
            root_id,
            connection: Arc::clone(connection),
            ended: AtomicBool::new(false),
            committed: AtomicBool::new(false),
        };

        let started = {
            let (mut slot, settled) = connection.lock_link().await;
            match settled.and(open_link(&mut slot)) {
                Ok(link) => match kind {
                    TransactionKind::Root => link.begin(isolation).await,
                    TransactionKind::SavePoint => link.save(&transaction.name()).await,
                },
                Err(e) => Err(e),
            }
        };

        if let Err(e) = started {
            transaction.ended.store(true, Ordering::Release);
            if kind == TransactionKind::Root {
                connection.transaction_ended(id);
            }
            return Err(DatabaseError::from_driver(connection.target().to_string(), e));
        }

        debug!(
            transaction_id = %id,
            kind = %kind,
            key = %connection.key(),
            "Transaction started"
        );
        Ok(transaction)
    }

    /// Commit
    ///
    /// A root commits the driver transaction. A savepoint performs no
    /// physical action; its work becomes durable with the root.
    pub async fn commit(&self) -> Result<()> {
        self.ensure_active()?;

        if self.kind == TransactionKind::Root {
            // a failed deferred rollback must not let nested work commit
            let (mut slot, settled) = self.connection.lock_link().await;
            settled.map_err(|e| self.driver_error(e))?;
            let link = open_link(&mut slot).map_err(|e| self.driver_error(e))?;
            link.commit().await.map_err(|e| self.driver_error(e))?;
            self.connection.transaction_ended(self.id);
        }

        self.committed.store(true, Ordering::Release);
        self.ended.store(true, Ordering::Release);
        debug!(transaction_id = %self.id, kind = %self.kind, "Transaction committed");
        Ok(())
    }

    /// Roll back
    ///
    /// A root rolls back the whole driver transaction; a savepoint rolls
    /// back to its mark and leaves the root open. The transaction ends even
    /// when the driver call fails.
    pub async fn rollback(&self) -> Result<()> {
        self.ensure_active()?;

        let outcome = {
            let (mut slot, _settled) = self.connection.lock_link().await;
            match open_link(&mut slot) {
                Ok(link) => match self.kind {
                    TransactionKind::Root => link.rollback().await,
                    TransactionKind::SavePoint => link.rollback_to(&self.name()).await,
                },
                Err(e) => Err(e),
            }
        };

        if self.kind == TransactionKind::Root {
            self.connection.transaction_ended(self.id);
        }
        self.ended.store(true, Ordering::Release);

        match outcome {
            Ok(()) => {
                debug!(transaction_id = %self.id, kind = %self.kind, "Transaction rolled back");
                Ok(())
            }
            Err(e) => Err(self.driver_error(e)),
        }
    }

    /// Roll back unless already ended
    pub async fn dispose(&self) -> Result<()> {
        if self.is_ended() {
            return Ok(());
        }
        if self.kind == TransactionKind::SavePoint && !self.root_active() {
            self.ended.store(true, Ordering::Release);
            return Ok(());
        }
        self.rollback().await
    }

    /// End as rolled back without touching the link
    ///
    /// The rollback is queued on the connection; a savepoint whose root is
    /// gone owes nothing. Returns false when already ended.
    pub(crate) fn abandon(&self) -> bool {
        if self.ended.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.kind {
            TransactionKind::Root => {
                self.connection.defer_end(PendingEnd::Rollback { id: self.id });
                self.connection.transaction_ended(self.id);
            }
            TransactionKind::SavePoint if self.root_active() => {
                self.connection.defer_end(PendingEnd::RollbackTo {
                    id: self.id,
                    savepoint: self.name(),
                });
            }
            TransactionKind::SavePoint => {}
        }
        true
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_ended() {
            return Err(DatabaseError::TransactionAlreadyEnded { id: self.id });
        }
        if self.kind == TransactionKind::SavePoint && !self.root_active() {
            return Err(DatabaseError::TransactionAlreadyEnded { id: self.root_id });
        }
        Ok(())
    }

    fn root_active(&self) -> bool {
        self.connection.active_transaction() == Some(self.root_id)
    }

    fn driver_error(&self, e: crate::core::error::DriverError) -> DatabaseError {
        DatabaseError::from_driver(self.connection.target().to_string(), e)
    }

    /// Whether commit or rollback has happened
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Whether the transaction ended by commit
    ///
    /// # Errors
    ///
    /// `TransactionNotEnded` while still active.
    pub fn is_committed(&self) -> Result<bool> {
        if !self.is_ended() {
            return Err(DatabaseError::TransactionNotEnded { id: self.id });
        }
        Ok(self.committed.load(Ordering::Acquire))
    }

    /// Whether the transaction ended by rollback
    pub fn is_rolled_back(&self) -> Result<bool> {
        self.is_committed().map(|committed| !committed)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn is_root(&self) -> bool {
        self.kind == TransactionKind::Root
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Id of the root this transaction belongs to (its own id for a root)
    pub fn root_id(&self) -> Uuid {
        self.root_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Savepoint name derived from the id
    pub fn name(&self) -> String {
        savepoint_name(self.id)
    }
}

/// `sp_` followed by the hyphen-less hex form of `id`
pub fn savepoint_name(id: Uuid) -> String {
    format!("sp_{}", id.simple())
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("isolation", &self.isolation)
            .field("root_id", &self.root_id)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.abandon() {
            warn!(
                transaction_id = %self.id,
                kind = %self.kind,
                "Transaction dropped without commit or rollback, rolling back"
            );
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::backends::SqliteDriver;
    use crate::core::command::Command;
    use crate::core::context::ExecutionContextId;
    use crate::core::driver::Driver;
    use crate::core::registry::ConnectionRegistry;
    use crate::core::target::ConnectionTarget;

    async fn setup() -> Arc<Connection> {
        let registry = Arc::new(ConnectionRegistry::new());
        let driver: Arc<dyn Driver> = Arc::new(SqliteDriver::new());
        let target = ConnectionTarget::parse(":memory:").unwrap();
        let conn = Connection::get_or_create(&registry, &driver, ExecutionContextId::new(), "main", &target, true)
            .await
            .unwrap();
        exec(&conn, "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)").await;
        conn
    }

    async fn exec(conn: &Arc<Connection>, sql: &str) {
        Command::new(Arc::clone(conn), sql)
            .execute_non_query()
            .await
            .unwrap();
    }

    async fn count(conn: &Arc<Connection>) -> i64 {
        Command::new(Arc::clone(conn), "SELECT COUNT(*) FROM items")
            .execute_scalar()
            .await
            .unwrap()
            .as_long()
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_is_root_second_is_savepoint() {
        let conn = setup().await;
        let root = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Serializable)
            .await
            .unwrap();
        let nested = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::ReadCommitted)
            .await
            .unwrap();

        assert!(root.is_root());
        assert_eq!(nested.kind(), TransactionKind::SavePoint);
        assert_eq!(nested.root_id(), root.id());
        assert_eq!(conn.active_transaction(), Some(root.id()));

        nested.commit().await.unwrap();
        root.commit().await.unwrap();
        assert!(!conn.in_transaction());
    }

    #[tokio::test]
    async fn test_root_commit_and_rollback() {
        let conn = setup().await;

        let tx = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        exec(&conn, "INSERT INTO items (label) VALUES ('kept')").await;
        tx.commit().await.unwrap();
        assert!(tx.is_committed().unwrap());

        let tx = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        exec(&conn, "INSERT INTO items (label) VALUES ('dropped')").await;
        tx.rollback().await.unwrap();
        assert!(tx.is_rolled_back().unwrap());

        assert_eq!(count(&conn).await, 1);
    }

    #[tokio::test]
    async fn test_committed_savepoint_is_undone_by_root_rollback() {
        let conn = setup().await;
        let root = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        exec(&conn, "INSERT INTO items (label) VALUES ('before')").await;

        let sp = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        exec(&conn, "INSERT INTO items (label) VALUES ('inside')").await;
        sp.commit().await.unwrap();

        exec(&conn, "INSERT INTO items (label) VALUES ('after')").await;
        root.rollback().await.unwrap();

        assert_eq!(count(&conn).await, 0);
    }

    #[tokio::test]
    async fn test_savepoint_rollback_keeps_earlier_work() {
        let conn = setup().await;
        let root = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        exec(&conn, "INSERT INTO items (label) VALUES ('before')").await;

        let sp = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        exec(&conn, "INSERT INTO items (label) VALUES ('inside')").await;
        sp.rollback().await.unwrap();

        assert!(conn.in_transaction());
        root.commit().await.unwrap();
        assert_eq!(count(&conn).await, 1);
    }

    #[tokio::test]
    async fn test_second_end_is_rejected() {
        let conn = setup().await;
        let tx = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, DatabaseError::TransactionAlreadyEnded { id } if id == tx.id()));
        let err = tx.rollback().await.unwrap_err();
        assert!(matches!(err, DatabaseError::TransactionAlreadyEnded { .. }));
        tx.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_outcome_before_end_is_rejected() {
        let conn = setup().await;
        let tx = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        assert!(matches!(
            tx.is_committed().unwrap_err(),
            DatabaseError::TransactionNotEnded { .. }
        ));
        tx.dispose().await.unwrap();
        assert!(tx.is_rolled_back().unwrap());
    }

    #[tokio::test]
    async fn test_savepoint_after_root_ended() {
        let conn = setup().await;
        let root = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        let sp = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        root.rollback().await.unwrap();

        let err = sp.commit().await.unwrap_err();
        assert!(matches!(err, DatabaseError::TransactionAlreadyEnded { id } if id == root.id()));
        sp.dispose().await.unwrap();
        assert!(sp.is_rolled_back().unwrap());
    }

    async fn labels(conn: &Arc<Connection>) -> Vec<String> {
        let mut reader = Command::new(Arc::clone(conn), "SELECT label FROM items ORDER BY id")
            .execute_reader()
            .await
            .unwrap();
        let mut labels = Vec::new();
        while reader.advance() {
            labels.push(reader.get_at::<String>(0).unwrap());
        }
        labels
    }

    #[tokio::test]
    async fn test_dropped_savepoint_is_rolled_back_before_root_commit() {
        let conn = setup().await;
        let root = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        exec(&conn, "INSERT INTO items (label) VALUES ('root')").await;

        let sp = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        exec(&conn, "INSERT INTO items (label) VALUES ('nested')").await;
        drop(sp);
        assert_eq!(conn.pending_ends(), 1);

        root.commit().await.unwrap();
        assert_eq!(conn.pending_ends(), 0);
        assert_eq!(labels(&conn).await, vec!["root".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_savepoint_does_not_erase_later_root_work() {
        let conn = setup().await;
        let root = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        let sp = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        exec(&conn, "INSERT INTO items (label) VALUES ('nested')").await;
        drop(sp);

        exec(&conn, "INSERT INTO items (label) VALUES ('root-after')").await;
        tokio::task::yield_now().await;
        root.commit().await.unwrap();

        assert_eq!(labels(&conn).await, vec!["root-after".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_root_is_rolled_back_before_next_root() {
        let conn = setup().await;
        let first = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        exec(&conn, "INSERT INTO items (label) VALUES ('lost')").await;
        let first_id = first.id();
        drop(first);
        assert!(!conn.in_transaction());

        let second = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        assert!(second.is_root());
        assert_ne!(second.id(), first_id);
        exec(&conn, "INSERT INTO items (label) VALUES ('kept')").await;
        second.commit().await.unwrap();

        assert_eq!(labels(&conn).await, vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn test_savepoint_dropped_after_root_owes_nothing() {
        let conn = setup().await;
        let root = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        let sp = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified)
            .await
            .unwrap();
        root.commit().await.unwrap();
        drop(sp);
        assert_eq!(conn.pending_ends(), 0);
    }

    #[test]
    fn test_savepoint_name() {
        let id = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(savepoint_name(id), "sp_67e5504410b1426f9247bb680e5fe0c8");
    }
}

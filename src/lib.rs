//! # Rust Session Pool
//!
//! A client-side data-access layer that coordinates connection identity,
//! nested transactions and failure recovery for callers that share an
//! execution context.
//!
//! ## Features
//!
//! - **Connection Registry**: at most one live connection per
//!   `(execution context, logical name)`
//! - **Nested Transactions**: the first transaction on a connection is a real
//!   driver transaction, later ones are savepoints inside it
//! - **Sessions**: nested units of work that share their root's connection
//! - **Resilient Commands**: broken links are reopened and the statement
//!   retried, at most three executions and never inside a transaction
//! - **Row Mapping**: scalar, enum-like, record and closure mappers
//! - **Async Support**: async/await on Tokio
//!
//! ## Supported Databases
//!
//! | Database | Feature | Notes |
//! |----------|---------|-------|
//! | SQLite | `sqlite` (default) | bundled, savepoints, JSON table parameters |
//! | PostgreSQL | `postgres` | named parameters rewritten to `$n` |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rust_session_pool::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = Arc::new(SessionManager::new(Arc::new(SqliteDriver::new())));
//!     let config = Arc::new(
//!         DataSourceConfig::new()
//!             .with_default_key("main")
//!             .with_connection("main", "data source=app.db"),
//!     );
//!     let ctx = ExecutionContextId::new();
//!     let users = DataService::default_database(Arc::clone(&manager), config, ctx)?;
//!
//!     let session = users.begin_session(IsolationLevel::Unspecified).await?;
//!     users
//!         .execute_non_query(
//!             "INSERT INTO users (name) VALUES (:name)",
//!             Parameters::new().with("name", "Alice"),
//!         )
//!         .await?;
//!     session.commit().await?;
//!     session.dispose().await?;
//!
//!     let name: Option<String> = users
//!         .find_single(
//!             "SELECT name FROM users WHERE name = :name",
//!             Parameters::new().with("name", "Alice"),
//!             &ScalarMapper,
//!         )
//!         .await?;
//!     println!("{:?}", name);
//!     Ok(())
//! }
//! ```
//!
//! ## Project Structure
//!
//! ```text
//! src/
//! ├── core/
//! │   ├── context.rs       # Execution context ids
//! │   ├── target.rs        # Connection targets
//! │   ├── registry.rs      # Connection registry
//! │   ├── connection.rs    # Registered connections
//! │   ├── transaction.rs   # Root transactions and savepoints
//! │   ├── session.rs       # Sessions and the session manager
//! │   ├── command.rs       # Reconnect-and-retry execution
//! │   ├── reader.rs        # Result sets and readers
//! │   ├── mapper.rs        # Row mappers
//! │   ├── config.rs        # Data source configuration
//! │   ├── driver.rs        # Driver traits
//! │   ├── error.rs         # Error types
//! │   └── value.rs         # Value types
//! ├── backends/            # SQLite and PostgreSQL drivers
//! ├── service.rs           # DataService façade
//! └── lib.rs
//! ```

/// Core session system types and traits
pub mod core;

/// Driver implementations
pub mod backends;

/// Data service façade
pub mod service;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::core::{
        Command, Connection, ConnectionTarget, DataReader, DataSourceConfig, DatabaseError,
        DatabaseType, DatabaseValue, EnumMapper, ExecutionContextId, FromRow, FromValue,
        IsolationLevel, MapFn, Parameters, RecordMapper, Result, RowMapper, ScalarMapper, Session,
        SessionManager, TableValue, Transaction,
    };
    pub use crate::service::DataService;

    #[cfg(feature = "sqlite")]
    pub use crate::backends::SqliteDriver;

    #[cfg(feature = "postgres")]
    pub use crate::backends::PostgresDriver;
}

// Re-export at root level for convenience
pub use core::{
    Command, Connection, ConnectionKey, ConnectionRegistry, ConnectionTarget, DataReader,
    DataSourceConfig, DatabaseError, DatabaseType, DatabaseValue, Driver, DriverError, DriverLink,
    ExecutionContextId, IsolationLevel, Parameters, Result, Session, SessionManager,
    SessionRegistry, TableValue, Transaction, TransactionKind,
};
pub use service::DataService;

#[cfg(feature = "sqlite")]
pub use backends::SqliteDriver;

#[cfg(feature = "postgres")]
pub use backends::PostgresDriver;

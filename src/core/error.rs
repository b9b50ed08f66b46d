//! Error types for the session system
//!
//! `DatabaseError` is the only error type that crosses the crate boundary.
//! Failures reported by an underlying driver are carried as `DriverError`
//! inside one of its variants.

use super::context::ExecutionContextId;
use uuid::Uuid;

/// Result type alias for session system operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Result type alias for driver operations
pub type DriverResult<T> = std::result::Result<T, DriverError>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Error taxonomy of the session system
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// A required connection key or target is absent or blank
    #[error("Missing configuration: {0}")]
    ConfigurationMissing(String),

    /// Two distinct connections were registered under one key
    #[error("Connection '{name}' is not unique for execution context {context}")]
    DuplicateConnectionIdentity {
        context: ExecutionContextId,
        name: String,
    },

    /// A connection name was reused with a different target
    #[error(
        "Connection '{name}' is already registered for '{existing}', cannot reuse it for '{requested}'"
    )]
    ConflictingConnectionTarget {
        name: String,
        existing: String,
        requested: String,
    },

    /// The physical link could not be opened or is no longer usable
    #[error("Connection failed to {target} - {message}")]
    ConnectionFailure {
        target: String,
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Commit or rollback on a transaction that already ended
    #[error("Transaction {id} has already ended")]
    TransactionAlreadyEnded { id: Uuid },

    /// Outcome flags read before the transaction ended
    #[error("Transaction {id} has not ended yet")]
    TransactionNotEnded { id: Uuid },

    /// A single-row lookup produced more than one row
    #[error("Found {count} records when expecting only a single result")]
    MultipleRecordsFound { count: usize },

    /// Statement failure or retry exhaustion
    #[error("Failed to execute on attempt #{attempt}: {message}")]
    CommandExecutionFailure {
        attempt: u32,
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Internal registry invariant violated
    #[error("Registry inconsistency: {0}")]
    RegistryInconsistency(String),

    /// Type conversion error while mapping rows
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Column missing from the current row
    #[error("Column not found: {0}")]
    ColumnNotFound(String),
}

impl DatabaseError {
    /// Create a configuration-missing error
    pub fn configuration_missing<S: Into<String>>(what: S) -> Self {
        DatabaseError::ConfigurationMissing(what.into())
    }

    /// Create a conflicting-target error
    pub fn conflicting_target(
        name: impl Into<String>,
        existing: impl Into<String>,
        requested: impl Into<String>,
    ) -> Self {
        DatabaseError::ConflictingConnectionTarget {
            name: name.into(),
            existing: existing.into(),
            requested: requested.into(),
        }
    }

    /// Create a connection failure from a driver error
    pub fn connection_failure(target: impl Into<String>, source: DriverError) -> Self {
        DatabaseError::ConnectionFailure {
            target: target.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a command failure for the given attempt
    pub fn command_failed(attempt: u32, source: DriverError) -> Self {
        DatabaseError::CommandExecutionFailure {
            attempt,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a command failure with a message and an optional cause
    pub fn command_failed_with(
        attempt: u32,
        message: impl Into<String>,
        source: Option<BoxedSource>,
    ) -> Self {
        DatabaseError::CommandExecutionFailure {
            attempt,
            message: message.into(),
            source,
        }
    }

    /// Translate a driver failure raised by transaction control
    ///
    /// A link that is gone is a connection failure; anything else is treated
    /// as a failed first attempt of the control statement.
    pub fn from_driver(target: impl Into<String>, source: DriverError) -> Self {
        if source.is_connection_unusable() {
            Self::connection_failure(target, source)
        } else {
            Self::command_failed(1, source)
        }
    }

    /// Create a registry inconsistency error
    pub fn registry<S: Into<String>>(msg: S) -> Self {
        DatabaseError::RegistryInconsistency(msg.into())
    }

    /// Create a new type mismatch error
    pub fn type_mismatch(expected: &str, actual: &str) -> Self {
        DatabaseError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Returns true for retry exhaustion raised by the command loop
    pub fn is_retry_exhaustion(&self) -> bool {
        matches!(
            self,
            DatabaseError::CommandExecutionFailure { message, .. } if message == EXHAUSTED_RETRIES
        )
    }
}

/// Message carried by `CommandExecutionFailure` once every attempt failed
pub const EXHAUSTED_RETRIES: &str = "exhausted retries";

/// Failures reported by a driver implementation
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The link is closed or broken and cannot run statements
    #[error("connection is no longer usable: {0}")]
    ConnectionUnusable(String),

    /// The link could not be established
    #[error("could not open connection: {0}")]
    Open(String),

    /// The statement did not finish in time
    #[error("statement timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Database-level execution error (syntax, constraint, ...)
    #[error("{0}")]
    Database(String),

    /// Operation not supported by the driver
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl DriverError {
    /// Create a database-level error
    pub fn database<S: Into<String>>(msg: S) -> Self {
        DriverError::Database(msg.into())
    }

    /// Create a connection-unusable error
    pub fn unusable<S: Into<String>>(msg: S) -> Self {
        DriverError::ConnectionUnusable(msg.into())
    }

    /// Whether the failure belongs to the "connection no longer usable" class
    pub fn is_connection_unusable(&self) -> bool {
        matches!(self, DriverError::ConnectionUnusable(_) | DriverError::Open(_))
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for DriverError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == rusqlite::ErrorCode::CannotOpen =>
            {
                DriverError::Open(err.to_string())
            }
            _ => DriverError::Database(err.to_string()),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for DriverError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            DriverError::ConnectionUnusable(err.to_string())
        } else {
            DriverError::Database(err.to_string())
        }
    }
}

//! Driver boundary
//!
//! The session layer never talks to a database directly. A `Driver` opens
//! physical links; a `DriverLink` runs statements and transaction control on
//! one of them. Backends in `crate::backends` implement both traits.

use super::error::{DatabaseError, DriverResult};
use super::reader::ResultSet;
use super::target::ConnectionTarget;
use super::transaction::IsolationLevel;
use super::value::DatabaseValue;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// SQL dialect behind a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DatabaseType {
    /// Custom drivers and test doubles
    #[default]
    Unknown,
    Sqlite,
    Postgres,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Unknown => "unknown",
            DatabaseType::Sqlite => "sqlite",
            DatabaseType::Postgres => "postgres",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, DatabaseError> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "sqlite" | "sqlite3" => Ok(DatabaseType::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(DatabaseType::Postgres),
            _ => Err(DatabaseError::configuration_missing(format!("no driver for database type '{}'", s))),
        }
    }
}

/// Factory for physical links
#[async_trait]
pub trait Driver: Send + Sync {
    /// Dialect of the links this driver opens
    fn database_type(&self) -> DatabaseType;

    /// Open a physical link to `target`
    ///
    /// The target handed in already has driver-level pooling disabled.
    async fn open(&self, target: &ConnectionTarget) -> DriverResult<Box<dyn DriverLink>>;
}

/// One physical database link
///
/// Links are owned by exactly one `Connection` and are never used from two
/// places at once; every method takes `&mut self`.
#[async_trait]
pub trait DriverLink: Send {
    /// Whether the link can still run statements
    fn is_open(&self) -> bool;

    /// Close the link
    async fn close(&mut self) -> DriverResult<()>;

    /// Begin a root transaction
    async fn begin(&mut self, isolation: IsolationLevel) -> DriverResult<()>;

    /// Commit the root transaction
    async fn commit(&mut self) -> DriverResult<()>;

    /// Roll back the root transaction
    async fn rollback(&mut self) -> DriverResult<()>;

    /// Mark a savepoint inside the root transaction
    async fn save(&mut self, name: &str) -> DriverResult<()>;

    /// Roll back to a savepoint, keeping the root transaction open
    async fn rollback_to(&mut self, name: &str) -> DriverResult<()>;

    /// Run a statement
    async fn run(&mut self, statement: &Statement) -> DriverResult<StatementOutcome>;
}

/// What the caller wants back from a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteKind {
    /// Rows affected only
    NonQuery,
    /// First column of the first row
    Scalar,
    /// Full result set
    Reader,
}

/// Direction of a bound parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterDirection {
    /// Value flows to the database
    Input,
    /// Value flows both ways
    InputOutput,
    /// Value is produced by the database
    Output,
}

/// Shape of a bound parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    /// Single value
    Scalar,
    /// Table-valued parameter
    Structured,
}

/// A parameter as handed to the driver
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParameter {
    /// Name as given by the caller (prefix optional)
    pub name: String,
    /// Value; `Null` for pure outputs
    pub value: DatabaseValue,
    /// Direction
    pub direction: ParameterDirection,
    /// Shape
    pub kind: ParameterKind,
    /// Buffer size for output directions
    pub size: Option<usize>,
}

impl BoundParameter {
    /// Name without a leading `:`, `@` or `$`
    pub fn bare_name(&self) -> &str {
        bare_parameter_name(&self.name)
    }

    /// Whether the database is expected to produce a value for it
    pub fn is_output(&self) -> bool {
        self.direction != ParameterDirection::Input
    }
}

/// Strip a leading `:`, `@` or `$` from a parameter name
pub fn bare_parameter_name(name: &str) -> &str {
    name.trim_start_matches([':', '@', '$'])
}

/// A fully materialized statement
#[derive(Debug, Clone)]
pub struct Statement {
    /// SQL text
    pub sql: String,
    /// Bound parameters, inputs first
    pub parameters: Vec<BoundParameter>,
    /// Requested result shape
    pub kind: ExecuteKind,
    /// Execution timeout
    pub timeout: Duration,
    /// Transaction the statement runs under, if any
    pub transaction: Option<Uuid>,
}

/// What a driver returns for a statement
#[derive(Debug, Clone, Default)]
pub struct StatementOutcome {
    /// Rows affected by a non-query statement
    pub rows_affected: u64,
    /// Rows produced by the statement
    pub result: ResultSet,
    /// Values of output parameters keyed by the caller's parameter name
    pub outputs: HashMap<String, DatabaseValue>,
}

/// Output values for drivers without native output parameters
///
/// Each output takes the value of the same-named column (prefix stripped,
/// case-insensitive) in the first result row, or keeps its input value.
pub fn outputs_from_first_row(
    parameters: &[BoundParameter],
    result: &ResultSet,
) -> HashMap<String, DatabaseValue> {
    parameters
        .iter()
        .filter(|p| p.is_output())
        .map(|p| {
            let value = result
                .column_index(p.bare_name())
                .and_then(|i| result.rows().first().and_then(|row| row.get(i)))
                .cloned()
                .unwrap_or_else(|| p.value.clone());
            (p.name.clone(), value)
        })
        .collect()
}

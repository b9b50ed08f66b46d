//! Core types of the session system
//!
//! Leaves first: context and target identify connections, the registry
//! keeps them unique, transactions and sessions nest work on them, and
//! commands execute statements with reconnect-and-retry.

pub mod command;
pub mod config;
pub mod connection;
pub mod context;
pub mod driver;
pub mod error;
pub mod mapper;
pub mod reader;
pub mod registry;
pub mod session;
pub mod target;
pub mod transaction;
pub mod value;

// Re-export commonly used types
pub use command::{Command, Parameters, DEFAULT_COMMAND_TIMEOUT, MAX_EXECUTION_ATTEMPTS};
pub use config::DataSourceConfig;
pub use connection::Connection;
pub use context::ExecutionContextId;
pub use driver::{DatabaseType, Driver, DriverLink, ExecuteKind, Statement, StatementOutcome};
pub use error::{DatabaseError, DriverError, DriverResult, Result};
pub use mapper::{EnumMapper, FromRow, FromValue, MapFn, RecordMapper, RowMapper, ScalarMapper};
pub use reader::{DataReader, ResultSet};
pub use registry::{ConnectionKey, ConnectionRegistry};
pub use session::{Session, SessionManager, SessionRegistry};
pub use target::{ConnectionTarget, TargetBuilder};
pub use transaction::{IsolationLevel, Transaction, TransactionKind};
pub use value::{DatabaseValue, TableValue};

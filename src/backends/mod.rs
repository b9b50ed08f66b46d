//! Driver implementations
//!
//! Each backend provides a `Driver` that opens links and a `DriverLink`
//! that runs statements and transaction control on one of them.

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteDriver, SqliteLink};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresDriver, PostgresLink};

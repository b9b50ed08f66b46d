//! SQLite driver
//!
//! `rusqlite` is blocking, so every call runs on the blocking thread pool
//! and is raced against its timeout. A statement that overruns is
//! interrupted through the connection's interrupt handle.

use crate::core::driver::{
    outputs_from_first_row, BoundParameter, DatabaseType, Driver, DriverLink, ParameterDirection,
    Statement, StatementOutcome,
};
use crate::core::error::{DriverError, DriverResult};
use crate::core::reader::ResultSet;
use crate::core::target::ConnectionTarget;
use crate::core::transaction::IsolationLevel;
use crate::core::value::DatabaseValue;
use async_trait::async_trait;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Timeout for opening links and transaction control statements
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long SQLite waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens SQLite links
///
/// Recognized target options: `data source` (also `filename`, `database`)
/// and `mode` (`ro`, `rw` or `rwc`, default `rwc`).
#[derive(Debug, Clone, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }

    fn open_flags(target: &ConnectionTarget) -> DriverResult<OpenFlags> {
        let base = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        match target.get("mode").map(str::to_ascii_lowercase).as_deref() {
            None | Some("rwc") => Ok(base | OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE),
            Some("rw") => Ok(base | OpenFlags::SQLITE_OPEN_READ_WRITE),
            Some("ro") => Ok(base | OpenFlags::SQLITE_OPEN_READ_ONLY),
            Some(other) => Err(DriverError::Open(format!("unknown sqlite mode '{}'", other))),
        }
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    async fn open(&self, target: &ConnectionTarget) -> DriverResult<Box<dyn DriverLink>> {
        let path = target
            .data_source()
            .ok_or_else(|| DriverError::Open("target has no data source".to_string()))?
            .to_string();
        let flags = Self::open_flags(target)?;

        let mut task = tokio::task::spawn_blocking(move || -> DriverResult<Connection> {
            let conn = Connection::open_with_flags(&path, flags)
                .map_err(|e| DriverError::Open(format!("{}: {}", path, e)))?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch("PRAGMA foreign_keys = ON")?;
            Ok(conn)
        });

        let conn = tokio::select! {
            result = &mut task => {
                result.map_err(|e| DriverError::Open(format!("Task join error: {}", e)))??
            }
            _ = tokio::time::sleep(CONTROL_TIMEOUT) => {
                task.abort();
                return Err(DriverError::Timeout { timeout_ms: CONTROL_TIMEOUT.as_millis() as u64 });
            }
        };

        Ok(Box::new(SqliteLink::new(conn)))
    }
}

/// One open SQLite connection
pub struct SqliteLink {
    conn: Arc<Mutex<Option<Connection>>>,
    interrupt: Arc<InterruptHandle>,
    open: AtomicBool,
}

impl SqliteLink {
    fn new(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            interrupt,
            open: AtomicBool::new(true),
        }
    }

    async fn blocking<T, F>(&self, timeout: Duration, work: F) -> DriverResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> DriverResult<T> + Send + 'static,
    {
        if !self.is_open() {
            return Err(DriverError::unusable("sqlite link is closed"));
        }

        let conn = Arc::clone(&self.conn);
        let mut task = tokio::task::spawn_blocking(move || -> DriverResult<T> {
            let guard = conn.blocking_lock();
            let conn = guard
                .as_ref()
                .ok_or_else(|| DriverError::unusable("sqlite link is closed"))?;
            work(conn)
        });

        tokio::select! {
            result = &mut task => {
                result.map_err(|e| DriverError::database(format!("Task join error: {}", e)))?
            }
            _ = tokio::time::sleep(timeout) => {
                self.interrupt.interrupt();
                task.abort();
                Err(DriverError::Timeout { timeout_ms: timeout.as_millis() as u64 })
            }
        }
    }

    async fn batch(&self, sql: String) -> DriverResult<()> {
        self.blocking(CONTROL_TIMEOUT, move |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl DriverLink for SqliteLink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.open.store(false, Ordering::Release);
        let taken = self.conn.lock().await.take();
        if let Some(conn) = taken {
            conn.close().map_err(|(_, e)| DriverError::from(e))?;
        }
        Ok(())
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> DriverResult<()> {
        let sql = match isolation {
            IsolationLevel::Serializable => "BEGIN IMMEDIATE",
            _ => "BEGIN DEFERRED",
        };
        self.batch(sql.to_string()).await
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.batch("COMMIT".to_string()).await
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.batch("ROLLBACK".to_string()).await
    }

    async fn save(&mut self, name: &str) -> DriverResult<()> {
        self.batch(format!("SAVEPOINT {}", quote_identifier(name))).await
    }

    async fn rollback_to(&mut self, name: &str) -> DriverResult<()> {
        self.batch(format!("ROLLBACK TO SAVEPOINT {}", quote_identifier(name)))
            .await
    }

    async fn run(&mut self, statement: &Statement) -> DriverResult<StatementOutcome> {
        let sql = statement.sql.clone();
        let parameters = statement.parameters.clone();
        debug!(sql = %sql, parameters = parameters.len(), "Running sqlite statement");

        self.blocking(statement.timeout, move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            for parameter in &parameters {
                bind(&mut stmt, parameter)?;
            }

            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();
            let width = columns.len();
            let readonly = stmt.readonly();
            let mut result = ResultSet::new(columns);

            let rows_affected = if width == 0 {
                stmt.raw_execute()? as u64
            } else {
                let mut rows = stmt.raw_query();
                while let Some(row) = rows.next()? {
                    let mut values = Vec::with_capacity(width);
                    for i in 0..width {
                        values.push(from_value_ref(row.get_ref(i)?));
                    }
                    result.push_row(values);
                }
                // changes() still holds the count of the last write
                if readonly {
                    result.len() as u64
                } else {
                    conn.changes() as u64
                }
            };

            let outputs = outputs_from_first_row(&parameters, &result);
            Ok(StatementOutcome {
                rows_affected,
                result,
                outputs,
            })
        })
        .await
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn bind(stmt: &mut rusqlite::Statement<'_>, parameter: &BoundParameter) -> DriverResult<()> {
    let bare = parameter.bare_name();
    let candidates = [
        parameter.name.clone(),
        format!(":{}", bare),
        format!("@{}", bare),
        format!("${}", bare),
    ];

    let mut index = None;
    for candidate in &candidates {
        if let Some(found) = stmt.parameter_index(candidate)? {
            index = Some(found);
            break;
        }
    }

    match index {
        Some(index) => {
            stmt.raw_bind_parameter(index, to_sql_value(&parameter.value))?;
            Ok(())
        }
        None if parameter.direction == ParameterDirection::Output => Ok(()),
        None => Err(DriverError::database(format!(
            "statement has no parameter named '{}'",
            parameter.name
        ))),
    }
}

/// Convert a value for binding; tables bind as JSON text
fn to_sql_value(value: &DatabaseValue) -> Value {
    match value {
        DatabaseValue::Null => Value::Null,
        DatabaseValue::Bool(v) => Value::Integer(i64::from(*v)),
        DatabaseValue::Int(v) => Value::Integer(i64::from(*v)),
        DatabaseValue::Long(v) => Value::Integer(*v),
        DatabaseValue::Float(v) => Value::Real(f64::from(*v)),
        DatabaseValue::Double(v) => Value::Real(*v),
        DatabaseValue::String(v) => Value::Text(v.clone()),
        DatabaseValue::Bytes(v) => Value::Blob(v.clone()),
        DatabaseValue::Timestamp(v) => Value::Integer(*v),
        DatabaseValue::Table(table) => Value::Text(table.to_json().to_string()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> DatabaseValue {
    match value {
        ValueRef::Null => DatabaseValue::Null,
        ValueRef::Integer(v) => DatabaseValue::Long(v),
        ValueRef::Real(v) => DatabaseValue::Double(v),
        ValueRef::Text(v) => DatabaseValue::String(String::from_utf8_lossy(v).to_string()),
        ValueRef::Blob(v) => DatabaseValue::Bytes(v.to_vec()),
    }
}

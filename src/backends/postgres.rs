//! PostgreSQL driver
//!
//! Built on `tokio-postgres`. Named parameters (`:name`, `@name`, `$name`)
//! are rewritten to positional `$n` placeholders before preparing.

use crate::core::driver::{
    outputs_from_first_row, DatabaseType, Driver, DriverLink, ExecuteKind, Statement, StatementOutcome,
};
use crate::core::error::{DriverError, DriverResult};
use crate::core::reader::ResultSet;
use crate::core::target::ConnectionTarget;
use crate::core::transaction::IsolationLevel;
use crate::core::value::DatabaseValue;
use async_trait::async_trait;
use std::time::Duration;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::{debug, error};

/// Timeout for opening links and transaction control statements
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Opens PostgreSQL links
///
/// Understands libpq option names (`host`, `port`, `dbname`, `user`,
/// `password`) and the common aliases `server`, `data source`, `database`,
/// `user id`, `username` and `pwd`.
#[derive(Debug, Clone, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }

    fn config(target: &ConnectionTarget) -> DriverResult<Config> {
        let mut config = Config::new();
        let host = target
            .get_any(&["host", "server", "data source"])
            .ok_or_else(|| DriverError::Open("target has no host".to_string()))?;
        config.host(host);

        if let Some(port) = target.get("port") {
            let port = port
                .parse::<u16>()
                .map_err(|_| DriverError::Open(format!("invalid port '{}'", port)))?;
            config.port(port);
        }
        if let Some(dbname) = target.get_any(&["dbname", "database", "initial catalog"]) {
            config.dbname(dbname);
        }
        if let Some(user) = target.get_any(&["user", "user id", "username", "uid"]) {
            config.user(user);
        }
        if let Some(password) = target.get_any(&["password", "pwd"]) {
            config.password(password);
        }
        if let Some(name) = target.get("application_name") {
            config.application_name(name);
        }
        config.connect_timeout(CONTROL_TIMEOUT);
        Ok(config)
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn open(&self, target: &ConnectionTarget) -> DriverResult<Box<dyn DriverLink>> {
        let config = Self::config(target)?;

        let (client, connection) = tokio::time::timeout(CONTROL_TIMEOUT, config.connect(NoTls))
            .await
            .map_err(|_| DriverError::Timeout {
                timeout_ms: CONTROL_TIMEOUT.as_millis() as u64,
            })?
            .map_err(|e| DriverError::Open(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });

        Ok(Box::new(PostgresLink {
            client: Some(client),
        }))
    }
}

/// One PostgreSQL client
pub struct PostgresLink {
    client: Option<Client>,
}

impl PostgresLink {
    fn client(&self) -> DriverResult<&Client> {
        match &self.client {
            Some(client) if !client.is_closed() => Ok(client),
            _ => Err(DriverError::unusable("postgres client is closed")),
        }
    }

    async fn batch(&self, sql: &str) -> DriverResult<()> {
        let client = self.client()?;
        tokio::time::timeout(CONTROL_TIMEOUT, client.batch_execute(sql))
            .await
            .map_err(|_| DriverError::Timeout {
                timeout_ms: CONTROL_TIMEOUT.as_millis() as u64,
            })??;
        Ok(())
    }
}

#[async_trait]
impl DriverLink for PostgresLink {
    fn is_open(&self) -> bool {
        self.client.as_ref().map_or(false, |c| !c.is_closed())
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.client = None;
        Ok(())
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> DriverResult<()> {
        match isolation.as_sql() {
            Some(level) => self.batch(&format!("BEGIN ISOLATION LEVEL {}", level)).await,
            None => self.batch("BEGIN").await,
        }
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.batch("COMMIT").await
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.batch("ROLLBACK").await
    }

    async fn save(&mut self, name: &str) -> DriverResult<()> {
        self.batch(&format!("SAVEPOINT {}", quote_identifier(name))).await
    }

    async fn rollback_to(&mut self, name: &str) -> DriverResult<()> {
        self.batch(&format!("ROLLBACK TO SAVEPOINT {}", quote_identifier(name)))
            .await
    }

    async fn run(&mut self, statement: &Statement) -> DriverResult<StatementOutcome> {
        let client = self.client()?;
        let (sql, order) = rewrite_named_parameters(&statement.sql);
        debug!(sql = %sql, parameters = order.len(), "Running postgres statement");

        let timeout_ms = statement.timeout.as_millis() as u64;
        let work = async {
            let prepared = client.prepare(&sql).await?;

            let mut params: Vec<SqlParam> = Vec::with_capacity(order.len());
            for (position, name) in order.iter().enumerate() {
                let value = statement
                    .parameters
                    .iter()
                    .find(|p| p.bare_name().eq_ignore_ascii_case(name))
                    .map(|p| p.value.clone())
                    .unwrap_or(DatabaseValue::Null);
                let ty = prepared.params().get(position).cloned().unwrap_or(Type::TEXT);
                params.push(to_sql(&value, &ty)?);
            }
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();

            let mut result = ResultSet::new(
                prepared
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect(),
            );

            let rows_affected = if statement.kind == ExecuteKind::NonQuery && prepared.columns().is_empty() {
                client.execute(&prepared, &refs).await?
            } else {
                let rows = client.query(&prepared, &refs).await?;
                for row in &rows {
                    result.push_row(read_row(row));
                }
                rows.len() as u64
            };

            let outputs = outputs_from_first_row(&statement.parameters, &result);
            Ok::<_, DriverError>(StatementOutcome {
                rows_affected,
                result,
                outputs,
            })
        };

        tokio::time::timeout(statement.timeout, work)
            .await
            .map_err(|_| DriverError::Timeout { timeout_ms })?
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Rewrite `:name`, `@name` and `$name` placeholders to `$1..$n`
///
/// Returns the rewritten SQL and the parameter names in placeholder order.
/// Quoted text, dollar-quoted bodies, `::` casts and existing `$1`
/// placeholders are left alone.
pub fn rewrite_named_parameters(sql: &str) -> (String, Vec<String>) {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut order: Vec<String> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let in_identifier = i > 0 && (chars[i - 1].is_alphanumeric() || chars[i - 1] == '_');
        if let Some(tag_len) = dollar_tag_len(&chars[i..]).filter(|_| !in_identifier) {
            let tag = &chars[i..i + tag_len];
            let end = (i + tag_len..chars.len())
                .find(|&j| chars[j..].starts_with(tag))
                .map_or(chars.len(), |j| j + tag_len);
            out.extend(&chars[i..end]);
            i = end;
            continue;
        }

        let c = chars[i];
        match c {
            '\'' | '"' => {
                let quote = c;
                out.push(c);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == quote {
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                out.push_str("::");
                i += 2;
            }
            ':' | '@' | '$' if chars.get(i + 1).map_or(false, |n| n.is_alphabetic() || *n == '_') => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let position = match order.iter().position(|n| n.eq_ignore_ascii_case(&name)) {
                    Some(p) => p + 1,
                    None => {
                        order.push(name);
                        order.len()
                    }
                };
                out.push('$');
                out.push_str(&position.to_string());
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    (out, order)
}

/// Length of a `$tag$` or `$$` opener at the start of `chars`
fn dollar_tag_len(chars: &[char]) -> Option<usize> {
    if chars.first() != Some(&'$') {
        return None;
    }
    if chars.get(1).map_or(false, |c| c.is_ascii_digit()) {
        return None;
    }
    let close = chars[1..]
        .iter()
        .position(|c| !(c.is_alphanumeric() || *c == '_'))?
        + 1;
    (chars[close] == '$').then_some(close + 1)
}

/// Convert a value to the type the server expects for its placeholder
fn to_sql(value: &DatabaseValue, ty: &Type) -> DriverResult<SqlParam> {
    let mismatch = || {
        DriverError::database(format!(
            "cannot bind {} value to parameter of type {}",
            value.type_name(),
            ty
        ))
    };

    if value.is_null() {
        let param: SqlParam = match *ty {
            Type::BOOL => Box::new(None::<bool>),
            Type::INT2 => Box::new(None::<i16>),
            Type::INT4 => Box::new(None::<i32>),
            Type::INT8 => Box::new(None::<i64>),
            Type::FLOAT4 => Box::new(None::<f32>),
            Type::FLOAT8 => Box::new(None::<f64>),
            Type::BYTEA => Box::new(None::<Vec<u8>>),
            _ => Box::new(None::<String>),
        };
        return Ok(param);
    }

    let param: SqlParam = match *ty {
        Type::BOOL => Box::new(value.as_bool().ok_or_else(mismatch)?),
        Type::INT2 => {
            let v = value.as_long().ok_or_else(mismatch)?;
            Box::new(i16::try_from(v).map_err(|_| mismatch())?)
        }
        Type::INT4 => {
            let v = value.as_long().ok_or_else(mismatch)?;
            Box::new(i32::try_from(v).map_err(|_| mismatch())?)
        }
        Type::INT8 => Box::new(value.as_long().ok_or_else(mismatch)?),
        Type::FLOAT4 => Box::new(value.as_float().ok_or_else(mismatch)?),
        Type::FLOAT8 => Box::new(value.as_double().ok_or_else(mismatch)?),
        Type::BYTEA => Box::new(value.as_bytes().ok_or_else(mismatch)?.to_vec()),
        _ => match value {
            DatabaseValue::Table(table) => Box::new(table.to_json().to_string()),
            DatabaseValue::Bytes(v) => Box::new(v.clone()),
            other => Box::new(other.as_string()),
        },
    };
    Ok(param)
}

fn read_row(row: &Row) -> Vec<DatabaseValue> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| read_column(row, idx, column.type_()))
        .collect()
}

fn read_column(row: &Row, idx: usize, ty: &Type) -> DatabaseValue {
    fn get<'a, T, F>(row: &'a Row, idx: usize, wrap: F) -> DatabaseValue
    where
        T: tokio_postgres::types::FromSql<'a>,
        F: FnOnce(T) -> DatabaseValue,
    {
        match row.try_get::<_, Option<T>>(idx) {
            Ok(Some(v)) => wrap(v),
            _ => DatabaseValue::Null,
        }
    }

    match *ty {
        Type::BOOL => get(row, idx, DatabaseValue::Bool),
        Type::INT2 => get(row, idx, |v: i16| DatabaseValue::Int(i32::from(v))),
        Type::INT4 => get(row, idx, DatabaseValue::Int),
        Type::INT8 => get(row, idx, DatabaseValue::Long),
        Type::FLOAT4 => get(row, idx, DatabaseValue::Float),
        Type::FLOAT8 => get(row, idx, DatabaseValue::Double),
        Type::BYTEA => get(row, idx, DatabaseValue::Bytes),
        _ => get(row, idx, DatabaseValue::String),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_named_parameters() {
        let (sql, order) =
            rewrite_named_parameters("SELECT * FROM users WHERE id = :id AND (org = @org OR owner = $id)");
        assert_eq!(sql, "SELECT * FROM users WHERE id = $1 AND (org = $2 OR owner = $1)");
        assert_eq!(order, vec!["id".to_string(), "org".to_string()]);
    }

    #[test]
    fn test_rewrite_skips_casts_quotes_and_positionals() {
        let (sql, order) =
            rewrite_named_parameters("SELECT ':skip', \"@col\", created::date, $1 FROM t WHERE a = :a");
        assert_eq!(sql, "SELECT ':skip', \"@col\", created::date, $1 FROM t WHERE a = $1");
        assert_eq!(order, vec!["a".to_string()]);
    }

    #[test]
    fn test_rewrite_skips_dollar_quoted_bodies() {
        let (sql, order) = rewrite_named_parameters(
            "DO $body$ BEGIN PERFORM :inner, $x; END $body$; SELECT $$ @lit $$, :outer",
        );
        assert_eq!(
            sql,
            "DO $body$ BEGIN PERFORM :inner, $x; END $body$; SELECT $$ @lit $$, $1"
        );
        assert_eq!(order, vec!["outer".to_string()]);

        let (sql, order) = rewrite_named_parameters("SELECT $tag$ unterminated :p");
        assert_eq!(sql, "SELECT $tag$ unterminated :p");
        assert!(order.is_empty());
    }

    #[test]
    fn test_config_from_target() {
        let target = ConnectionTarget::parse("server=db.local;port=5433;database=app;user id=svc;pwd=s3cret").unwrap();
        let config = PostgresDriver::config(&target).unwrap();
        assert_eq!(config.get_dbname(), Some("app"));
        assert_eq!(config.get_user(), Some("svc"));
        assert_eq!(config.get_ports(), &[5433]);

        let bad = ConnectionTarget::parse("host=db.local;port=abc").unwrap();
        assert!(matches!(PostgresDriver::config(&bad), Err(DriverError::Open(_))));
    }

    #[test]
    fn test_to_sql_rejects_mismatched_values() {
        assert!(to_sql(&DatabaseValue::Long(1 << 40), &Type::INT4).is_err());
        assert!(to_sql(&DatabaseValue::from("x"), &Type::INT8).is_err());
        assert!(to_sql(&DatabaseValue::Int(3), &Type::INT8).is_ok());
        assert!(to_sql(&DatabaseValue::Null, &Type::INT4).is_ok());
    }

    /// `key=value;...` target, e.g. `host=localhost;user=postgres;dbname=test`
    fn get_postgres_target() -> Option<String> {
        std::env::var("POSTGRES_TARGET").ok()
    }

    #[tokio::test]
    #[ignore] // Run with: cargo test --features postgres -- --ignored
    async fn test_postgres_savepoints() -> crate::core::error::Result<()> {
        use crate::core::command::Command;
        use crate::core::connection::Connection;
        use crate::core::context::ExecutionContextId;
        use crate::core::registry::ConnectionRegistry;
        use crate::core::transaction::Transaction;
        use std::sync::Arc;
        use uuid::Uuid;

        let url = match get_postgres_target() {
            Some(url) => url,
            None => {
                eprintln!("Skipping test: POSTGRES_TARGET not set");
                return Ok(());
            }
        };

        let registry = Arc::new(ConnectionRegistry::new());
        let driver: Arc<dyn Driver> = Arc::new(PostgresDriver::new());
        let target = ConnectionTarget::parse(&url)?;
        let conn = Connection::get_or_create(&registry, &driver, ExecutionContextId::new(), "pg", &target, true).await?;

        Command::new(Arc::clone(&conn), "DROP TABLE IF EXISTS session_sp")
            .execute_non_query()
            .await?;
        Command::new(Arc::clone(&conn), "CREATE TABLE session_sp (id SERIAL PRIMARY KEY, name TEXT)")
            .execute_non_query()
            .await?;

        let root = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::ReadCommitted).await?;
        Command::new(Arc::clone(&conn), "INSERT INTO session_sp (name) VALUES (:name)")
            .param("name", "kept")
            .execute_non_query()
            .await?;
        let sp = Transaction::begin(&conn, Uuid::new_v4(), IsolationLevel::Unspecified).await?;
        Command::new(Arc::clone(&conn), "INSERT INTO session_sp (name) VALUES (:name)")
            .param("name", "undone")
            .execute_non_query()
            .await?;
        sp.rollback().await?;
        root.commit().await?;

        let count = Command::new(Arc::clone(&conn), "SELECT COUNT(*) FROM session_sp")
            .execute_scalar()
            .await?;
        assert_eq!(count.as_long(), Some(1));

        Command::new(Arc::clone(&conn), "DROP TABLE session_sp")
            .execute_non_query()
            .await?;
        conn.dispose().await
    }
}

//! Command execution with reconnect-and-retry
//!
//! A `Command` runs one statement against a connection. When the driver
//! reports that the link is no longer usable, the connection is reopened
//! and the statement run again, up to [`MAX_EXECUTION_ATTEMPTS`] executions
//! in total. Retries never happen inside a transaction.

use super::connection::Connection;
use super::driver::{
    bare_parameter_name, BoundParameter, ExecuteKind, ParameterDirection, ParameterKind, Statement,
    StatementOutcome,
};
use super::error::{DatabaseError, DriverError, Result, EXHAUSTED_RETRIES};
use super::reader::DataReader;
use super::value::DatabaseValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Statement timeout applied when none is set
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(500);

/// Upper bound on executions of one command, first try included
pub const MAX_EXECUTION_ATTEMPTS: u32 = 3;

/// Buffer size declared for output parameters
pub const OUTPUT_PARAMETER_SIZE: usize = 512;

fn same_name(a: &str, b: &str) -> bool {
    bare_parameter_name(a).eq_ignore_ascii_case(bare_parameter_name(b))
}

/// Ordered named parameters
///
/// Names match ignoring case and a leading `:`, `@` or `$`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    entries: Vec<(String, DatabaseValue)>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parameter
    pub fn with(mut self, name: impl Into<String>, value: impl Into<DatabaseValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Add or replace a parameter in place
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<DatabaseValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| same_name(n, &name)) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&DatabaseValue> {
        self.entries
            .iter()
            .find(|(n, _)| same_name(n, name))
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DatabaseValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Parameters
where
    K: Into<String>,
    V: Into<DatabaseValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Parameters::new();
        for (name, value) in iter {
            params.set(name, value);
        }
        params
    }
}

/// A parameterized statement bound to one connection
pub struct Command {
    connection: Arc<Connection>,
    sql: String,
    parameters: Parameters,
    outputs: Vec<String>,
    timeout: Duration,
    last_outputs: HashMap<String, DatabaseValue>,
}

impl Command {
    pub fn new(connection: Arc<Connection>, sql: impl Into<String>) -> Self {
        Self {
            connection,
            sql: sql.into(),
            parameters: Parameters::new(),
            outputs: Vec::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            last_outputs: HashMap::new(),
        }
    }

    /// Add or replace an input parameter
    pub fn param(mut self, name: impl Into<String>, value: impl Into<DatabaseValue>) -> Self {
        self.parameters.set(name, value);
        self
    }

    /// Add or replace an input parameter in place
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<DatabaseValue>) {
        self.parameters.set(name, value);
    }

    /// Replace all input parameters
    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Declare an output parameter
    ///
    /// If an input of the same name exists it becomes input-output.
    pub fn output(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.outputs.iter().any(|o| same_name(o, &name)) {
            self.outputs.push(name);
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Run and return the number of affected rows
    pub async fn execute_non_query(&mut self) -> Result<u64> {
        let outcome = self.execute(ExecuteKind::NonQuery).await?;
        Ok(outcome.rows_affected)
    }

    /// Run and return the first column of the first row
    pub async fn execute_scalar(&mut self) -> Result<DatabaseValue> {
        let outcome = self.execute(ExecuteKind::Scalar).await?;
        Ok(outcome.result.scalar())
    }

    /// Run and return a reader over the produced rows
    pub async fn execute_reader(&mut self) -> Result<DataReader> {
        let outcome = self.execute(ExecuteKind::Reader).await?;
        Ok(DataReader::new(outcome.result))
    }

    /// Output values captured by the last successful execution
    pub fn output_values(&self) -> &HashMap<String, DatabaseValue> {
        &self.last_outputs
    }

    /// One captured output value
    pub fn output_value(&self, name: &str) -> Option<&DatabaseValue> {
        self.last_outputs
            .iter()
            .find(|(n, _)| same_name(n, name))
            .map(|(_, v)| v)
    }

    fn is_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| same_name(o, name))
    }

    pub(crate) fn statement(&self, kind: ExecuteKind) -> Statement {
        let mut parameters = Vec::with_capacity(self.parameters.len() + self.outputs.len());

        for (name, value) in self.parameters.iter() {
            let direction = if self.is_output(name) {
                ParameterDirection::InputOutput
            } else {
                ParameterDirection::Input
            };
            parameters.push(BoundParameter {
                name: name.to_string(),
                value: value.clone(),
                direction,
                kind: if value.is_table() {
                    ParameterKind::Structured
                } else {
                    ParameterKind::Scalar
                },
                size: (direction != ParameterDirection::Input).then_some(OUTPUT_PARAMETER_SIZE),
            });
        }

        for name in &self.outputs {
            if !self.parameters.contains(name) {
                parameters.push(BoundParameter {
                    name: name.clone(),
                    value: DatabaseValue::Null,
                    direction: ParameterDirection::Output,
                    kind: ParameterKind::Scalar,
                    size: Some(OUTPUT_PARAMETER_SIZE),
                });
            }
        }

        Statement {
            sql: self.sql.clone(),
            parameters,
            kind,
            timeout: self.timeout,
            transaction: self.connection.active_transaction(),
        }
    }

    async fn execute(&mut self, kind: ExecuteKind) -> Result<StatementOutcome> {
        let mut broken: Option<DriverError> = None;

        for attempt in 1..=MAX_EXECUTION_ATTEMPTS {
            if let Some(previous) = broken.take() {
                debug!(key = %self.connection.key(), attempt, cause = %previous, "Reconnecting");
                if let Err(e) = self.connection.reconnect().await {
                    warn!(key = %self.connection.key(), attempt, error = %e, "Reconnect failed");
                    broken = Some(e);
                    continue;
                }
            }

            let statement = self.statement(kind);
            match self.connection.run(&statement).await {
                Ok(mut outcome) => {
                    self.last_outputs = std::mem::take(&mut outcome.outputs);
                    return Ok(outcome);
                }
                Err(e) if e.is_connection_unusable() => {
                    if self.connection.is_connected().await {
                        return Err(DatabaseError::command_failed(attempt, e));
                    }
                    if let Some(transaction) = self.connection.active_transaction() {
                        warn!(
                            key = %self.connection.key(),
                            transaction_id = %transaction,
                            error = %e,
                            "Connection lost inside a transaction, not retrying"
                        );
                        return Err(DatabaseError::command_failed(attempt, e));
                    }
                    warn!(key = %self.connection.key(), attempt, error = %e, "Connection unusable");
                    broken = Some(e);
                }
                Err(e) => return Err(DatabaseError::command_failed(attempt, e)),
            }
        }

        Err(DatabaseError::command_failed_with(
            MAX_EXECUTION_ATTEMPTS,
            EXHAUSTED_RETRIES,
            broken.map(|e| Box::new(e) as _),
        ))
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("connection", self.connection.key())
            .field("sql", &self.sql)
            .field("parameters", &self.parameters)
            .field("outputs", &self.outputs)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::TableValue;

    #[test]
    fn test_parameters_match_ignoring_prefix_and_case() {
        let mut params = Parameters::new().with("@Id", 1).with("name", "a");
        params.set(":ID", 2);
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("id"), Some(&DatabaseValue::Int(2)));
        assert!(params.contains("$NAME"));
        assert!(!params.contains("email"));
    }

    #[test]
    fn test_parameters_from_iter() {
        let params: Parameters = vec![("a", 1), ("b", 2)].into_iter().collect();
        let names: Vec<_> = params.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_statement_materialization() {
        use crate::backends::SqliteDriver;
        use crate::core::context::ExecutionContextId;
        use crate::core::driver::Driver;
        use crate::core::registry::ConnectionRegistry;
        use crate::core::target::ConnectionTarget;

        let registry = Arc::new(ConnectionRegistry::new());
        let driver: Arc<dyn Driver> = Arc::new(SqliteDriver::new());
        let conn = Connection::get_or_create(
            &registry,
            &driver,
            ExecutionContextId::new(),
            "main",
            &ConnectionTarget::parse(":memory:").unwrap(),
            false,
        )
        .await
        .unwrap();

        let table = TableValue::new(["id"]).with_row(vec![1.into()]).unwrap();
        let command = Command::new(conn, "SELECT 1")
            .param("@ids", table)
            .param("@total", DatabaseValue::Null)
            .output("@total")
            .output("@status");
        let statement = command.statement(ExecuteKind::Scalar);

        assert_eq!(statement.timeout, DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(statement.transaction, None);
        assert_eq!(statement.parameters.len(), 3);

        let ids = &statement.parameters[0];
        assert_eq!(ids.kind, ParameterKind::Structured);
        assert_eq!(ids.direction, ParameterDirection::Input);
        assert_eq!(ids.size, None);

        let total = &statement.parameters[1];
        assert_eq!(total.direction, ParameterDirection::InputOutput);
        assert_eq!(total.size, Some(OUTPUT_PARAMETER_SIZE));

        let status = &statement.parameters[2];
        assert_eq!(status.name, "@status");
        assert_eq!(status.direction, ParameterDirection::Output);
        assert!(status.value.is_null());
    }
}

//! Data service façade
//!
//! `DataService` binds a logical connection key and an execution context to
//! a `SessionManager`. Each call runs on the connection of the session
//! active on that context, or on a connection of its own that is disposed
//! when the call finishes.

use crate::core::command::{Command, Parameters};
use crate::core::config::DataSourceConfig;
use crate::core::connection::Connection;
use crate::core::context::ExecutionContextId;
use crate::core::error::{DatabaseError, Result};
use crate::core::mapper::{map_all, FromValue, RowMapper};
use crate::core::reader::DataReader;
use crate::core::session::{Session, SessionManager};
use crate::core::target::ConnectionTarget;
use crate::core::transaction::IsolationLevel;
use crate::core::value::DatabaseValue;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Query and command façade for one logical database
#[derive(Debug, Clone)]
pub struct DataService {
    manager: Arc<SessionManager>,
    config: Arc<DataSourceConfig>,
    key: String,
    context: ExecutionContextId,
}

impl DataService {
    /// Service for the database configured under `key`
    ///
    /// The key is resolved on first use.
    pub fn for_database(
        manager: Arc<SessionManager>,
        config: Arc<DataSourceConfig>,
        key: impl Into<String>,
        context: ExecutionContextId,
    ) -> Self {
        Self {
            manager,
            config,
            key: key.into(),
            context,
        }
    }

    /// Service for the configured default database
    ///
    /// # Errors
    ///
    /// `ConfigurationMissing` when the configuration has no default key.
    pub fn default_database(
        manager: Arc<SessionManager>,
        config: Arc<DataSourceConfig>,
        context: ExecutionContextId,
    ) -> Result<Self> {
        let key = config.default_key()?.to_string();
        Ok(Self::for_database(manager, config, key, context))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn context(&self) -> ExecutionContextId {
        self.context
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Resolved target of this service's key
    pub fn target(&self) -> Result<ConnectionTarget> {
        self.config.target(&self.key)
    }

    /// Start a session on this service's database and context
    pub async fn begin_session(&self, isolation: IsolationLevel) -> Result<Session> {
        let target = self.target()?;
        self.manager
            .get_session(self.context, &target, isolation)
            .await
    }

    /// Map every row
    pub async fn find_multiple<T, M>(&self, sql: &str, params: Parameters, mapper: &M) -> Result<Vec<T>>
    where
        M: RowMapper<T> + ?Sized,
    {
        let reader = self.read(sql, params).await?;
        map_all(reader, mapper)
    }

    /// Map the only row, if any
    ///
    /// # Errors
    ///
    /// `MultipleRecordsFound` when more than one row comes back.
    pub async fn find_single<T, M>(&self, sql: &str, params: Parameters, mapper: &M) -> Result<Option<T>>
    where
        M: RowMapper<T> + ?Sized,
    {
        let mut reader = self.read(sql, params).await?;
        match reader.row_count() {
            0 => Ok(None),
            1 => {
                reader.advance();
                mapper.map_row(&reader).map(Some)
            }
            count => Err(DatabaseError::MultipleRecordsFound { count }),
        }
    }

    /// Run a statement for its side effects and return its output values
    pub async fn execute_void(
        &self,
        sql: &str,
        params: Parameters,
        outputs: &[&str],
    ) -> Result<HashMap<String, DatabaseValue>> {
        self.with_command(sql, params, outputs, |mut command| async move {
            command.execute_non_query().await?;
            Ok(command.output_values().clone())
        })
        .await
    }

    /// Run a statement and return the number of affected rows
    pub async fn execute_non_query(&self, sql: &str, params: Parameters) -> Result<u64> {
        self.with_command(sql, params, &[], |mut command| async move {
            command.execute_non_query().await
        })
        .await
    }

    /// Run a statement and convert the first column of the first row
    pub async fn execute_scalar<T: FromValue>(&self, sql: &str, params: Parameters) -> Result<T> {
        let value = self
            .with_command(sql, params, &[], |mut command| async move {
                command.execute_scalar().await
            })
            .await?;
        T::from_value(&value)
    }

    async fn read(&self, sql: &str, params: Parameters) -> Result<DataReader> {
        self.with_command(sql, params, &[], |mut command| async move {
            command.execute_reader().await
        })
        .await
    }

    async fn with_command<T, F, Fut>(
        &self,
        sql: &str,
        params: Parameters,
        outputs: &[&str],
        run: F,
    ) -> Result<T>
    where
        F: FnOnce(Command) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (connection, owned) = self.acquire().await?;

        let mut command = Command::new(Arc::clone(&connection), sql)
            .with_parameters(params)
            .timeout(self.config.command_timeout());
        for name in outputs {
            command = command.output(*name);
        }

        let outcome = run(command).await;

        if owned {
            if let Err(e) = connection.dispose().await {
                warn!(key = %connection.key(), error = %e, "Failed to dispose service connection");
                if outcome.is_ok() {
                    return Err(e);
                }
            }
        }
        outcome
    }

    /// Session connection of the context, or a fresh one owned by the call
    async fn acquire(&self) -> Result<(Arc<Connection>, bool)> {
        let target = self.target()?;

        if let Some(root) = self.manager.sessions().get(self.context) {
            if *root.target() != target {
                return Err(DatabaseError::conflicting_target(
                    self.key.as_str(),
                    root.target().to_string(),
                    target.to_string(),
                ));
            }
            debug!(key = %self.key, session_id = %root.id(), "Using session connection");
            return Ok((Arc::clone(root.connection()), false));
        }

        let connection = Connection::get_or_create(
            self.manager.connections(),
            self.manager.driver(),
            self.context,
            &self.key,
            &target,
            true,
        )
        .await?;
        Ok((connection, true))
    }
}

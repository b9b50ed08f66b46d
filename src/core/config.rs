//! Data source configuration
//!
//! Resolves logical connection keys to connection targets. Values are only
//! validated when a key is resolved, so a partially filled configuration is
//! usable for the keys it does define.

use super::command::DEFAULT_COMMAND_TIMEOUT;
use super::error::{DatabaseError, Result};
use super::target::ConnectionTarget;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Variable suffix naming the default connection key
pub const DEFAULT_KEY_VAR: &str = "DEFAULT_CONNECTION_KEY";

/// Variable infix for connection strings, `{PREFIX}_CONNECTION_<KEY>`
pub const CONNECTION_VAR: &str = "CONNECTION_";

/// Variable suffix for the command timeout in seconds
pub const COMMAND_TIMEOUT_VAR: &str = "COMMAND_TIMEOUT_SECS";

/// Logical connection keys and their connection strings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    /// Key used by [`DataSourceConfig::default_target`]
    pub default_key: Option<String>,
    /// Connection strings by logical key
    pub connection_strings: HashMap<String, String>,
    /// Statement timeout; the command default applies when absent
    pub command_timeout_secs: Option<u64>,
}

impl DataSourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default key
    pub fn with_default_key(mut self, key: impl Into<String>) -> Self {
        self.default_key = Some(key.into());
        self
    }

    /// Add a connection string
    pub fn with_connection(mut self, key: impl Into<String>, connection_string: impl Into<String>) -> Self {
        self.connection_strings
            .insert(key.into(), connection_string.into());
        self
    }

    /// Set the command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Parse from JSON
    ///
    /// ```
    /// use rust_session_pool::DataSourceConfig;
    ///
    /// let config = DataSourceConfig::from_json(
    ///     r#"{"default_key": "main", "connection_strings": {"main": "app.db"}}"#,
    /// ).unwrap();
    /// assert_eq!(config.default_key().unwrap(), "main");
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            DatabaseError::configuration_missing(format!("invalid data source configuration: {}", e))
        })
    }

    /// Read from the process environment
    ///
    /// Recognizes `{prefix}_DEFAULT_CONNECTION_KEY`,
    /// `{prefix}_CONNECTION_<KEY>` and `{prefix}_COMMAND_TIMEOUT_SECS`.
    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Build from `(name, value)` pairs using the environment naming scheme
    pub fn from_vars<I, K, V>(prefix: &str, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let prefix = format!("{}_", prefix.trim_end_matches('_'));
        let mut config = Self::new();

        for (name, value) in vars {
            let Some(rest) = name.as_ref().strip_prefix(prefix.as_str()) else {
                continue;
            };
            if rest == DEFAULT_KEY_VAR {
                config.default_key = Some(value.into());
            } else if rest == COMMAND_TIMEOUT_VAR {
                let raw = value.into();
                let secs = raw.trim().parse::<u64>().map_err(|_| {
                    DatabaseError::configuration_missing(format!(
                        "{}{} is not a number of seconds: '{}'",
                        prefix, COMMAND_TIMEOUT_VAR, raw
                    ))
                })?;
                config.command_timeout_secs = Some(secs);
            } else if let Some(key) = rest.strip_prefix(CONNECTION_VAR) {
                if !key.is_empty() {
                    config
                        .connection_strings
                        .insert(key.to_string(), value.into());
                }
            }
        }

        Ok(config)
    }

    /// The default key
    ///
    /// # Errors
    ///
    /// `ConfigurationMissing` when unset or blank.
    pub fn default_key(&self) -> Result<&str> {
        match self.default_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(DatabaseError::configuration_missing(
                "no default connection key is configured",
            )),
        }
    }

    /// Connection string for `key` (case-insensitive)
    ///
    /// # Errors
    ///
    /// `ConfigurationMissing` when the key is unknown or its value blank.
    pub fn connection_string(&self, key: &str) -> Result<&str> {
        self.connection_strings
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                DatabaseError::configuration_missing(format!("missing connection string for '{}'", key))
            })
    }

    /// Parsed target for `key`
    pub fn target(&self, key: &str) -> Result<ConnectionTarget> {
        ConnectionTarget::parse(self.connection_string(key)?)
    }

    /// Parsed target for the default key
    pub fn default_target(&self) -> Result<ConnectionTarget> {
        self.target(self.default_key()?)
    }

    /// Statement timeout for commands built from this configuration
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT)
    }
}

//! Connection target descriptors
//!
//! A target is the parsed form of a connection string: an ordered list of
//! `key=value` options separated by `;`. Keys compare case-insensitively,
//! values verbatim.

use super::error::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Option key for the data source (file path, host, ...)
pub const DATA_SOURCE: &str = "data source";

/// Option key controlling driver-level pooling
pub const POOLING: &str = "pooling";

const SECRET_KEYS: &[&str] = &["password", "pwd"];

/// Parsed connection target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTarget {
    options: Vec<(String, String)>,
}

impl ConnectionTarget {
    /// Parse a connection string
    ///
    /// A string without any `=` is taken as a bare data source, so `"app.db"`
    /// and `"Data Source=app.db"` describe the same target.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationMissing` for a blank string and for segments
    /// with an empty key.
    pub fn parse(connection_string: &str) -> Result<Self> {
        let trimmed = connection_string.trim();
        if trimmed.is_empty() {
            return Err(DatabaseError::configuration_missing(
                "connection string is blank",
            ));
        }

        if !trimmed.contains('=') {
            return Ok(Self {
                options: vec![(DATA_SOURCE.to_string(), trimmed.to_string())],
            });
        }

        let mut target = Self {
            options: Vec::new(),
        };
        for segment in trimmed.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                DatabaseError::configuration_missing(format!(
                    "connection string segment '{}' has no value",
                    segment
                ))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(DatabaseError::configuration_missing(format!(
                    "connection string segment '{}' has no key",
                    segment
                )));
            }
            target.set(key, value.trim());
        }
        Ok(target)
    }

    /// Look up an option (case-insensitive key)
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Look up the first present option among several aliases
    pub fn get_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }

    /// Set or replace an option
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .options
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some(entry) => entry.1 = value,
            None => self.options.push((key.to_ascii_lowercase(), value)),
        }
    }

    /// Builder-style variant of `set`
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// The data source option, if any
    pub fn data_source(&self) -> Option<&str> {
        self.get_any(&[DATA_SOURCE, "datasource", "filename", "database", "server"])
    }

    /// Copy of this target with driver-level pooling switched off
    ///
    /// The session layer is the pool; the driver must not keep links alive
    /// behind its back.
    pub fn without_pooling(&self) -> Self {
        self.clone().with(POOLING, "false")
    }

    /// Whether driver-level pooling is explicitly disabled
    pub fn pooling_disabled(&self) -> bool {
        self.get(POOLING)
            .map(|v| v.eq_ignore_ascii_case("false") || v == "0")
            .unwrap_or(false)
    }

    /// Options in declaration order
    pub fn options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Full connection string, secrets included
    pub fn to_connection_string(&self) -> String {
        self.render(false, &[])
    }

    /// Connection string without the given keys, secrets included
    pub fn to_connection_string_without(&self, skip: &[&str]) -> String {
        self.render(false, skip)
    }

    fn render(&self, mask: bool, skip: &[&str]) -> String {
        self.options
            .iter()
            .filter(|(k, _)| !skip.iter().any(|s| k.eq_ignore_ascii_case(s)))
            .map(|(k, v)| {
                if mask && SECRET_KEYS.iter().any(|s| k.eq_ignore_ascii_case(s)) {
                    format!("{}=***", k)
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join(";")
    }

    fn normalized(&self) -> Vec<(String, &str)> {
        let mut options: Vec<(String, &str)> = self
            .options
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
            .collect();
        options.sort();
        options
    }
}

impl PartialEq for ConnectionTarget {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for ConnectionTarget {}

impl FromStr for ConnectionTarget {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Renders with secrets masked, safe for logs and error messages
impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(true, &[]))
    }
}

/// Builder for connection targets
pub struct TargetBuilder {
    host: Option<String>,
    port: Option<u16>,
    database: Option<String>,
    username: Option<String>,
    password: Option<String>,
    options: Vec<(String, String)>,
}

impl TargetBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            host: None,
            port: None,
            database: None,
            username: None,
            password: None,
            options: Vec::new(),
        }
    }

    /// Set the database host
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the database port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the database name (or file path for SQLite)
    pub fn database<S: Into<String>>(mut self, database: S) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the username
    pub fn username<S: Into<String>>(mut self, username: S) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password
    pub fn password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Add a custom option
    pub fn option<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }

    /// Build a SQLite target (`data source` only)
    pub fn build_sqlite(self) -> ConnectionTarget {
        let mut target = ConnectionTarget {
            options: Vec::new(),
        };
        target.set(
            DATA_SOURCE,
            self.database.unwrap_or_else(|| ":memory:".to_string()),
        );
        for (key, value) in self.options {
            target.set(&key, value);
        }
        target
    }

    /// Build a PostgreSQL target using libpq option names
    pub fn build_postgres(self) -> ConnectionTarget {
        let mut target = ConnectionTarget {
            options: Vec::new(),
        };
        if let Some(host) = self.host {
            target.set("host", host);
        }
        if let Some(port) = self.port {
            target.set("port", port.to_string());
        }
        if let Some(database) = self.database {
            target.set("dbname", database);
        }
        if let Some(username) = self.username {
            target.set("user", username);
        }
        if let Some(password) = self.password {
            target.set("password", password);
        }
        for (key, value) in self.options {
            target.set(&key, value);
        }
        target
    }
}

impl Default for TargetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

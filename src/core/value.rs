//! Parameter and column values
//!
//! `DatabaseValue` is what commands bind and what readers hand back.
//! `Null` is the database null marker; `Table` carries a row-set for
//! structured (table-valued) parameters.

use super::error::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A single bound or fetched value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Microseconds since the Unix epoch
    Timestamp(i64),
    /// Row-set passed as a structured parameter
    Table(TableValue),
}

impl DatabaseValue {
    /// Lenient boolean view: numbers compare against zero, text accepts
    /// `true/false`, `yes/no` and `1/0`
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(_) | Self::Long(_) => self.as_long().map(|n| n != 0),
            Self::String(s) => {
                let s = s.trim();
                if ["true", "yes", "1"].iter().any(|t| s.eq_ignore_ascii_case(t)) {
                    Some(true)
                } else if ["false", "no", "0"].iter().any(|f| s.eq_ignore_ascii_case(f)) {
                    Some(false)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// `i32` view; `None` when the value does not fit
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Timestamp(_) => None,
            Self::String(s) => s.trim().parse().ok(),
            other => other.as_long().and_then(|n| i32::try_from(n).ok()),
        }
    }

    /// `i64` view; floating values are truncated
    pub fn as_long(&self) -> Option<i64> {
        match *self {
            Self::Bool(b) => Some(i64::from(b)),
            Self::Int(n) => Some(i64::from(n)),
            Self::Long(n) | Self::Timestamp(n) => Some(n),
            Self::Float(f) => Some(f as i64),
            Self::Double(f) => Some(f as i64),
            Self::String(ref s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        self.as_double().map(|f| f as f32)
    }

    /// `f64` view of any numeric or numeric-looking text value
    pub fn as_double(&self) -> Option<f64> {
        match *self {
            Self::Int(n) => Some(f64::from(n)),
            Self::Long(n) => Some(n as f64),
            Self::Float(f) => Some(f64::from(f)),
            Self::Double(f) => Some(f),
            Self::String(ref s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Borrowed text, for `String` values only
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Text rendering used by enum mapping and diagnostics
    pub fn as_string(&self) -> String {
        match self {
            Self::Null => "null".to_owned(),
            Self::Bool(b) => b.to_string(),
            Self::Int(n) => n.to_string(),
            Self::Long(n) | Self::Timestamp(n) => n.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Double(f) => f.to_string(),
            Self::String(s) => s.clone(),
            Self::Bytes(b) => format!("<{} bytes>", b.len()),
            Self::Table(t) => format!("<table {} rows x {} columns>", t.len(), t.columns.len()),
        }
    }

    /// Raw bytes of `Bytes` and `String` values
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Self::Table(_))
    }

    /// JSON rendering; tables become arrays of objects
    pub fn to_json(&self) -> Json {
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(n) => Json::from(*n),
            Self::Long(n) | Self::Timestamp(n) => Json::from(*n),
            Self::Float(f) => Json::from(f64::from(*f)),
            Self::Double(f) => Json::from(*f),
            Self::String(s) => Json::String(s.clone()),
            Self::Bytes(b) => Json::from(b.as_slice()),
            Self::Table(t) => t.to_json(),
        }
    }

    /// Short variant name used in `TypeMismatch` errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Timestamp(_) => "timestamp",
            Self::Table(_) => "table",
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for DatabaseValue {
                fn from(v: $ty) -> Self {
                    DatabaseValue::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    String => String,
    Vec<u8> => Bytes,
    TableValue => Table,
}

impl From<&str> for DatabaseValue {
    fn from(v: &str) -> Self {
        DatabaseValue::String(v.to_owned())
    }
}

/// `None` binds as `Null`
impl<T: Into<DatabaseValue>> From<Option<T>> for DatabaseValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(DatabaseValue::Null, Into::into)
    }
}

/// Row-set value for structured parameters
///
/// Every row has exactly one cell per column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableValue {
    columns: Vec<String>,
    rows: Vec<Vec<DatabaseValue>>,
}

impl TableValue {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row, padding missing trailing cells with `Null`
    ///
    /// # Errors
    ///
    /// `TypeMismatch` when the row has more cells than the table has columns.
    pub fn push_row(&mut self, mut row: Vec<DatabaseValue>) -> Result<()> {
        let width = self.columns.len();
        if row.len() > width {
            return Err(DatabaseError::type_mismatch(
                &format!("row of at most {} cells", width),
                &format!("row of {} cells", row.len()),
            ));
        }
        row.resize(width, DatabaseValue::Null);
        self.rows.push(row);
        Ok(())
    }

    pub fn with_row(mut self, row: Vec<DatabaseValue>) -> Result<Self> {
        self.push_row(row)?;
        Ok(self)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<DatabaseValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `[{"column": value, ...}, ...]`
    pub fn to_json(&self) -> Json {
        Json::Array(
            self.rows
                .iter()
                .map(|row| {
                    Json::Object(
                        self.columns
                            .iter()
                            .cloned()
                            .zip(row.iter().map(DatabaseValue::to_json))
                            .collect(),
                    )
                })
                .collect(),
        )
    }
}

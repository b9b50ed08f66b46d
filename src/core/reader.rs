//! Tabular results
//!
//! Drivers hand back a materialized `ResultSet`; callers walk it through a
//! forward-only `DataReader`.

use super::error::{DatabaseError, Result};
use super::mapper::FromValue;
use super::value::DatabaseValue;

/// Rows returned by a statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Vec<DatabaseValue>>,
}

impl ResultSet {
    /// Create an empty result set with the given columns
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row
    ///
    /// Rows are expected to match the column count; drivers build them from
    /// the same statement metadata.
    pub fn push_row(&mut self, row: Vec<DatabaseValue>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    /// Column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// All rows
    pub fn rows(&self) -> &[Vec<DatabaseValue>] {
        &self.rows
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows were returned
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column, matched case-insensitively
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// First column of the first row, `Null` when there is none
    pub fn scalar(&self) -> DatabaseValue {
        self.rows
            .first()
            .and_then(|row| row.first())
            .cloned()
            .unwrap_or(DatabaseValue::Null)
    }
}

/// Forward-only cursor over a result set
///
/// The reader starts before the first row; `advance` must be called before
/// any value can be read.
#[derive(Debug, Clone)]
pub struct DataReader {
    set: ResultSet,
    position: Option<usize>,
}

impl DataReader {
    /// Wrap a result set
    pub fn new(set: ResultSet) -> Self {
        Self {
            set,
            position: None,
        }
    }

    /// Move to the next row; returns false once the rows are exhausted
    pub fn advance(&mut self) -> bool {
        let next = self.position.map_or(0, |p| p + 1);
        if next < self.set.rows.len() {
            self.position = Some(next);
            true
        } else {
            self.position = Some(self.set.rows.len());
            false
        }
    }

    /// Number of fields per row
    pub fn field_count(&self) -> usize {
        self.set.columns.len()
    }

    /// Name of field `index`
    pub fn field_name(&self, index: usize) -> Option<&str> {
        self.set.columns.get(index).map(String::as_str)
    }

    /// Whether a field with this name exists (case-insensitive)
    pub fn has_field(&self, name: &str) -> bool {
        self.set.column_index(name).is_some()
    }

    /// Value of field `index` in the current row
    ///
    /// Returns `None` before the first `advance`, after the last row, or for
    /// an index out of range.
    pub fn value(&self, index: usize) -> Option<&DatabaseValue> {
        self.current_row().and_then(|row| row.get(index))
    }

    /// Value of the named field in the current row
    pub fn value_by_name(&self, name: &str) -> Option<&DatabaseValue> {
        self.set
            .column_index(name)
            .and_then(|index| self.value(index))
    }

    /// Typed value of the named field
    ///
    /// # Errors
    ///
    /// `ColumnNotFound` when there is no such field (or no current row),
    /// `TypeMismatch` when the value cannot be converted.
    pub fn get<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self
            .value_by_name(name)
            .ok_or_else(|| DatabaseError::ColumnNotFound(name.to_string()))?;
        T::from_value(value)
    }

    /// Typed value of field `index`
    pub fn get_at<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self
            .value(index)
            .ok_or_else(|| DatabaseError::ColumnNotFound(format!("#{}", index)))?;
        T::from_value(value)
    }

    /// Total number of rows in the underlying set
    pub fn row_count(&self) -> usize {
        self.set.len()
    }

    /// Give back the underlying result set
    pub fn into_result_set(self) -> ResultSet {
        self.set
    }

    fn current_row(&self) -> Option<&Vec<DatabaseValue>> {
        self.position.and_then(|p| self.set.rows.get(p))
    }
}

impl From<ResultSet> for DataReader {
    fn from(set: ResultSet) -> Self {
        Self::new(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultSet {
        let mut set = ResultSet::new(vec!["Id".to_string(), "Name".to_string()]);
        set.push_row(vec![DatabaseValue::Long(1), DatabaseValue::from("Alice")]);
        set.push_row(vec![DatabaseValue::Long(2), DatabaseValue::Null]);
        set
    }

    #[test]
    fn test_reader_walks_forward() {
        let mut reader = DataReader::new(sample());
        assert_eq!(reader.field_count(), 2);
        assert_eq!(reader.field_name(1), Some("Name"));
        assert!(reader.value(0).is_none());

        assert!(reader.advance());
        assert_eq!(reader.value(0), Some(&DatabaseValue::Long(1)));
        assert_eq!(reader.value_by_name("name"), Some(&DatabaseValue::from("Alice")));

        assert!(reader.advance());
        assert!(reader.value_by_name("NAME").unwrap().is_null());

        assert!(!reader.advance());
        assert!(!reader.advance());
        assert!(reader.value(0).is_none());
    }

    #[test]
    fn test_typed_access() {
        let mut reader = DataReader::new(sample());
        reader.advance();
        let id: i64 = reader.get("id").unwrap();
        assert_eq!(id, 1);
        let name: Option<String> = reader.get("name").unwrap();
        assert_eq!(name.as_deref(), Some("Alice"));

        let err = reader.get::<i64>("missing").unwrap_err();
        assert!(matches!(err, DatabaseError::ColumnNotFound(_)));
    }

    #[test]
    fn test_scalar_of_empty_set_is_null() {
        assert!(ResultSet::default().scalar().is_null());
        assert_eq!(sample().scalar(), DatabaseValue::Long(1));
    }
}

//! Row mapping capabilities
//!
//! A `RowMapper<T>` turns the current row of a `DataReader` into a `T`.
//! The mapper is chosen once by the caller (scalar, enum-like, record or
//! closure) instead of being discovered per call.

use super::error::{DatabaseError, Result};
use super::reader::DataReader;
use super::value::DatabaseValue;
use std::marker::PhantomData;
use std::str::FromStr;

/// Conversion from a single database value
pub trait FromValue: Sized {
    /// Convert `value`, failing with `TypeMismatch` when it does not fit
    fn from_value(value: &DatabaseValue) -> Result<Self>;
}

fn mismatch<T>(expected: &str, value: &DatabaseValue) -> Result<T> {
    Err(DatabaseError::type_mismatch(expected, value.type_name()))
}

impl FromValue for DatabaseValue {
    fn from_value(value: &DatabaseValue) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &DatabaseValue) -> Result<Self> {
        value.as_bool().map_or_else(|| mismatch("bool", value), Ok)
    }
}

impl FromValue for i32 {
    fn from_value(value: &DatabaseValue) -> Result<Self> {
        value.as_int().map_or_else(|| mismatch("i32", value), Ok)
    }
}

impl FromValue for i64 {
    fn from_value(value: &DatabaseValue) -> Result<Self> {
        value.as_long().map_or_else(|| mismatch("i64", value), Ok)
    }
}

impl FromValue for f32 {
    fn from_value(value: &DatabaseValue) -> Result<Self> {
        value.as_float().map_or_else(|| mismatch("f32", value), Ok)
    }
}

impl FromValue for f64 {
    fn from_value(value: &DatabaseValue) -> Result<Self> {
        value.as_double().map_or_else(|| mismatch("f64", value), Ok)
    }
}

impl FromValue for String {
    fn from_value(value: &DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::Null | DatabaseValue::Table(_) => mismatch("string", value),
            other => Ok(other.as_string()),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &DatabaseValue) -> Result<Self> {
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .map_or_else(|| mismatch("bytes", value), Ok)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &DatabaseValue) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

/// Construction of a record from the current row
pub trait FromRow: Sized {
    /// Build `Self` from the reader's current row
    fn from_row(reader: &DataReader) -> Result<Self>;
}

/// Maps the current row of a reader to a `T`
pub trait RowMapper<T>: Send + Sync {
    /// Map the current row
    fn map_row(&self, reader: &DataReader) -> Result<T>;
}

/// Maps the first column through `FromValue`
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarMapper;

impl<T: FromValue> RowMapper<T> for ScalarMapper {
    fn map_row(&self, reader: &DataReader) -> Result<T> {
        reader.get_at(0)
    }
}

/// Maps the first column, rendered as text, through `FromStr`
///
/// Works for enum-like types whether the column holds the variant name or
/// its numeric discriminant, as long as `FromStr` accepts that form.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnumMapper;

impl<T: FromStr> RowMapper<T> for EnumMapper {
    fn map_row(&self, reader: &DataReader) -> Result<T> {
        let value = reader
            .value(0)
            .ok_or_else(|| DatabaseError::ColumnNotFound("#0".to_string()))?;
        if value.is_null() {
            return mismatch(std::any::type_name::<T>(), value);
        }
        let text = value.as_string();
        text.parse::<T>().map_err(|_| {
            DatabaseError::type_mismatch(std::any::type_name::<T>(), &format!("'{}'", text))
        })
    }
}

/// Maps the row through the type's `FromRow` implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordMapper;

impl<T: FromRow> RowMapper<T> for RecordMapper {
    fn map_row(&self, reader: &DataReader) -> Result<T> {
        T::from_row(reader)
    }
}

/// Maps the row with a closure
pub struct MapFn<F, T> {
    f: F,
    _marker: PhantomData<fn() -> T>,
}

impl<F, T> MapFn<F, T>
where
    F: Fn(&DataReader) -> Result<T> + Send + Sync,
{
    /// Wrap a mapping closure
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<F, T> RowMapper<T> for MapFn<F, T>
where
    F: Fn(&DataReader) -> Result<T> + Send + Sync,
{
    fn map_row(&self, reader: &DataReader) -> Result<T> {
        (self.f)(reader)
    }
}

/// Drain a reader through a mapper
pub fn map_all<T, M: RowMapper<T> + ?Sized>(mut reader: DataReader, mapper: &M) -> Result<Vec<T>> {
    let mut mapped = Vec::with_capacity(reader.row_count());
    while reader.advance() {
        mapped.push(mapper.map_row(&reader)?);
    }
    Ok(mapped)
}

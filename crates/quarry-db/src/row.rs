//! Driver rows and typed value extraction.

use quarry_core::{QuarryError, QuarryResult};

use crate::value::Value;

/// One result row as returned by a driver: column names plus values in
/// select-list order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a new row from column names and values.
    ///
    /// # Panics
    ///
    /// Panics if the number of columns does not match the number of values.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        assert_eq!(
            columns.len(),
            values.len(),
            "Row column count must match value count"
        );
        Self { columns, values }
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consumes the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Gets a typed value by column name.
    ///
    /// # Errors
    ///
    /// Returns an error if the column does not exist or the value cannot be
    /// converted to the requested type.
    pub fn get<T: FromValue>(&self, column: &str) -> QuarryResult<T> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| {
                QuarryError::FieldNotFound(format!("column '{column}' not found in row"))
            })?;
        T::from_value(&self.values[idx])
    }

    /// Gets a typed value by column index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is out of bounds or the value cannot be
    /// converted to the requested type.
    pub fn get_by_index<T: FromValue>(&self, idx: usize) -> QuarryResult<T> {
        let value = self.values.get(idx).ok_or_else(|| {
            QuarryError::DatabaseError(format!(
                "Column index {idx} out of bounds (row has {} columns)",
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    /// Returns a reference to the raw value at the given column name.
    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }
}

/// Trait for converting a [`Value`] to a concrete Rust type.
///
/// Used by hand-written and generated [`Instance::set_field`] impls.
///
/// [`Instance::set_field`]: crate::model::Instance::set_field
pub trait FromValue: Sized {
    /// Attempts to convert a value reference to this type.
    fn from_value(value: &Value) -> QuarryResult<Self>;
}

fn expected(kind: &str, value: &Value) -> QuarryError {
    QuarryError::TypeMismatch(format!("expected {kind}, got {} '{value}'", value.kind()))
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(Self::from(*b)),
            _ => Err(expected("int", value)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        let wide = i64::from_value(value)?;
        Self::try_from(wide)
            .map_err(|e| QuarryError::TypeMismatch(format!("int value out of i32 range: {e}")))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as Self),
            _ => Err(expected("float", value)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            _ => Err(expected("bool", value)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::String(s) => Ok(s.clone()),
            _ => Err(expected("string", value)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            _ => Err(expected("bytes", value)),
        }
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Uuid(u) => Ok(*u),
            _ => Err(expected("uuid", value)),
        }
    }
}

impl FromValue for chrono::NaiveDate {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Date(d) => Ok(*d),
            _ => Err(expected("date", value)),
        }
    }
}

impl FromValue for chrono::NaiveDateTime {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::DateTime(dt) => Ok(*dt),
            _ => Err(expected("datetime", value)),
        }
    }
}

impl FromValue for chrono::NaiveTime {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Time(t) => Ok(*t),
            _ => Err(expected("time", value)),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Json(j) => Ok(j.clone()),
            _ => Err(expected("json", value)),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Null => Ok(None),
            _ => T::from_value(value).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        Row::new(
            vec!["id".into(), "title".into(), "done".into(), "note".into()],
            vec![
                Value::Int(1),
                Value::from("T1"),
                Value::Int(0),
                Value::Null,
            ],
        )
    }

    #[test]
    fn test_get_by_name() {
        let r = row();
        assert_eq!(r.get::<i64>("id").unwrap(), 1);
        assert_eq!(r.get::<String>("title").unwrap(), "T1");
        assert!(!r.get::<bool>("done").unwrap());
        assert_eq!(r.get::<Option<String>>("note").unwrap(), None);
    }

    #[test]
    fn test_get_missing_column() {
        assert!(matches!(
            row().get::<i64>("nope"),
            Err(QuarryError::FieldNotFound(_))
        ));
    }

    #[test]
    fn test_get_by_index_bounds() {
        let r = row();
        assert_eq!(r.get_by_index::<String>(1).unwrap(), "T1");
        assert!(r.get_by_index::<String>(9).is_err());
    }

    #[test]
    fn test_type_mismatch() {
        assert!(matches!(
            row().get::<i64>("title"),
            Err(QuarryError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_i32_range() {
        let v = Value::Int(i64::from(i32::MAX) + 1);
        assert!(i32::from_value(&v).is_err());
    }
}

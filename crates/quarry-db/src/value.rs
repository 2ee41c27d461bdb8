//! Backend-agnostic database values.
//!
//! The [`Value`] enum is the core type used throughout the engine to represent
//! field values, bound query parameters, and scanned results. [`ValueKey`] is
//! its hashable projection, used to key the hydrator's dedupe tree.
//!
//! [`Value::convert_to`] implements the scan cast table: a driver returns a
//! value in whatever storage class it uses (`SQLite` hands back integers for
//! booleans, text for dates) and the hydrator converts it to the type the
//! target field declares before calling the model's setter.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use quarry_core::{QuarryError, QuarryResult};

use crate::fields::FieldType;

/// A backend-agnostic representation of a database value.
///
/// # Examples
///
/// ```
/// use quarry_db::value::Value;
///
/// let v = Value::from(42_i64);
/// assert_eq!(v, Value::Int(42));
///
/// let v = Value::from("hello");
/// assert_eq!(v, Value::String("hello".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// SQL NULL.
    Null,
    /// A boolean value.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit floating-point number.
    Float(f64),
    /// A UTF-8 string.
    String(String),
    /// Raw binary data.
    Bytes(Vec<u8>),
    /// A date without time.
    Date(NaiveDate),
    /// A date and time without timezone.
    DateTime(NaiveDateTime),
    /// A date and time with UTC timezone.
    DateTimeTz(chrono::DateTime<chrono::Utc>),
    /// A time without date.
    Time(NaiveTime),
    /// A UUID value.
    Uuid(uuid::Uuid),
    /// A JSON value.
    Json(serde_json::Value),
    /// A list of values (for IN clauses and multi-argument lookups).
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Date(d) => write!(f, "{d}"),
            Self::DateTime(dt) => write!(f, "{dt}"),
            Self::DateTimeTz(dt) => write!(f, "{dt}"),
            Self::Time(t) => write!(f, "{t}"),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Json(j) => write!(f, "{j}"),
            Self::List(vals) => {
                write!(f, "[")?;
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

// ── From implementations ───────────────────────────────────────────────

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Self::String(v.clone())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for Value {
    fn from(v: chrono::DateTime<chrono::Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Self::Time(v)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Self::Null,
        }
    }
}

/// A hashable projection of a [`Value`], used as a map key.
///
/// Floats are keyed by their bit pattern; lists and temporal values by their
/// display form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKey {
    /// SQL NULL.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A float's bit pattern.
    Float(u64),
    /// A string.
    String(String),
    /// Binary data.
    Bytes(Vec<u8>),
    /// Any other value, by display form.
    Other(String),
}

impl Value {
    /// Builds a [`Value::List`] from anything convertible to values, for `in`
    /// and `range` lookups.
    pub fn list<T: Into<Self>>(items: impl IntoIterator<Item = T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    /// Returns `true` if this value is `Null`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns `true` for the zero value of the value's kind.
    ///
    /// An unsaved primary key is recognised by being zero: `0`, `""`, the nil
    /// UUID, or NULL.
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Int(i) => *i == 0,
            Self::Float(f) => *f == 0.0,
            Self::Bool(b) => !b,
            Self::String(s) => s.is_empty(),
            Self::Bytes(b) => b.is_empty(),
            Self::Uuid(u) => u.is_nil(),
            Self::List(l) => l.is_empty(),
            Self::Date(_)
            | Self::DateTime(_)
            | Self::DateTimeTz(_)
            | Self::Time(_)
            | Self::Json(_) => false,
        }
    }

    /// Attempts to extract a boolean value.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Attempts to extract an integer value.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Attempts to extract a float value.
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Attempts to extract a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// A short name for the value's kind, used in error messages.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::DateTime(_) => "datetime",
            Self::DateTimeTz(_) => "datetime_tz",
            Self::Time(_) => "time",
            Self::Uuid(_) => "uuid",
            Self::Json(_) => "json",
            Self::List(_) => "list",
        }
    }

    /// Returns the hashable key for this value.
    pub fn key(&self) -> ValueKey {
        match self {
            Self::Null => ValueKey::Null,
            Self::Bool(b) => ValueKey::Bool(*b),
            Self::Int(i) => ValueKey::Int(*i),
            Self::Float(f) => ValueKey::Float(f.to_bits()),
            Self::String(s) => ValueKey::String(s.clone()),
            Self::Bytes(b) => ValueKey::Bytes(b.clone()),
            other => ValueKey::Other(format!("{}:{other}", other.kind())),
        }
    }

    /// Renders the value as an inline SQL literal.
    ///
    /// Used only by unsafe value expressions; everything else binds through
    /// placeholders.
    pub fn sql_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(true) => "TRUE".to_string(),
            Self::Bool(false) => "FALSE".to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bytes(b) => {
                let hex: String = b.iter().map(|byte| format!("{byte:02X}")).collect();
                format!("X'{hex}'")
            }
            Self::List(vals) => vals
                .iter()
                .map(Self::sql_literal)
                .collect::<Vec<_>>()
                .join(", "),
            other => format!("'{}'", other.to_string().replace('\'', "''")),
        }
    }

    /// Converts a scanned value to the type declared by a field.
    ///
    /// `field` names the target in the error message. NULL passes through
    /// unchanged; nullability is the caller's concern.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::TypeMismatch`] when no lossless conversion
    /// exists.
    pub fn convert_to(self, field_type: &FieldType, field: &str) -> QuarryResult<Self> {
        if self.is_null() {
            return Ok(self);
        }
        let mismatch = |value: &Self| {
            QuarryError::TypeMismatch(format!(
                "{field}: cannot convert {} value '{value}' to {field_type:?}",
                value.kind()
            ))
        };

        match field_type {
            FieldType::AutoField
            | FieldType::BigAutoField
            | FieldType::IntegerField
            | FieldType::BigIntegerField
            | FieldType::SmallIntegerField => match self {
                Self::Int(_) => Ok(self),
                Self::Bool(b) => Ok(Self::Int(i64::from(b))),
                #[allow(clippy::cast_possible_truncation)]
                Self::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Self::Int(f as i64)),
                Self::String(ref s) => s.trim().parse().map(Self::Int).map_err(|_| mismatch(&self)),
                _ => Err(mismatch(&self)),
            },
            FieldType::FloatField | FieldType::DecimalField { .. } => match self {
                Self::Float(_) => Ok(self),
                Self::Int(i) => Ok(Self::Float(i as f64)),
                Self::Bool(b) => Ok(Self::Float(if b { 1.0 } else { 0.0 })),
                Self::String(ref s) => s.trim().parse().map(Self::Float).map_err(|_| mismatch(&self)),
                _ => Err(mismatch(&self)),
            },
            FieldType::BooleanField => match self {
                Self::Bool(_) => Ok(self),
                Self::Int(i) => Ok(Self::Bool(i != 0)),
                Self::Float(f) => Ok(Self::Bool(f != 0.0)),
                Self::String(ref s) => match s.to_lowercase().as_str() {
                    "true" | "t" | "1" | "yes" => Ok(Self::Bool(true)),
                    "false" | "f" | "0" | "no" => Ok(Self::Bool(false)),
                    _ => Err(mismatch(&self)),
                },
                _ => Err(mismatch(&self)),
            },
            FieldType::CharField | FieldType::TextField => match self {
                Self::String(_) => Ok(self),
                Self::Bytes(b) => String::from_utf8(b)
                    .map(Self::String)
                    .map_err(|e| mismatch(&Self::Bytes(e.into_bytes()))),
                Self::Json(_) | Self::List(_) => Err(mismatch(&self)),
                other => Ok(Self::String(other.to_string())),
            },
            FieldType::DateField => match self {
                Self::Date(_) => Ok(self),
                Self::DateTime(dt) => Ok(Self::Date(dt.date())),
                Self::DateTimeTz(dt) => Ok(Self::Date(dt.date_naive())),
                Self::String(ref s) => parse_date(s).map(Self::Date).ok_or_else(|| mismatch(&self)),
                _ => Err(mismatch(&self)),
            },
            FieldType::DateTimeField => match self {
                Self::DateTime(_) => Ok(self),
                Self::DateTimeTz(dt) => Ok(Self::DateTime(dt.naive_utc())),
                Self::Date(d) => Ok(Self::DateTime(d.and_time(NaiveTime::MIN))),
                Self::String(ref s) => parse_datetime(s)
                    .map(Self::DateTime)
                    .ok_or_else(|| mismatch(&self)),
                _ => Err(mismatch(&self)),
            },
            FieldType::TimeField => match self {
                Self::Time(_) => Ok(self),
                Self::DateTime(dt) => Ok(Self::Time(dt.time())),
                Self::String(ref s) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
                    .map(Self::Time)
                    .map_err(|_| mismatch(&self)),
                _ => Err(mismatch(&self)),
            },
            FieldType::UuidField => match self {
                Self::Uuid(_) => Ok(self),
                Self::String(ref s) => uuid::Uuid::parse_str(s.trim())
                    .map(Self::Uuid)
                    .map_err(|_| mismatch(&self)),
                Self::Bytes(ref b) => uuid::Uuid::from_slice(b)
                    .map(Self::Uuid)
                    .map_err(|_| mismatch(&self)),
                _ => Err(mismatch(&self)),
            },
            FieldType::BinaryField => match self {
                Self::Bytes(_) => Ok(self),
                Self::String(s) => Ok(Self::Bytes(s.into_bytes())),
                _ => Err(mismatch(&self)),
            },
            FieldType::JsonField => match self {
                Self::Json(_) => Ok(self),
                Self::String(s) => Ok(Self::Json(
                    serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s)),
                )),
                Self::Bool(b) => Ok(Self::Json(serde_json::Value::Bool(b))),
                Self::Int(i) => Ok(Self::Json(serde_json::Value::from(i))),
                Self::Float(f) => Ok(Self::Json(serde_json::Value::from(f))),
                _ => Err(mismatch(&self)),
            },
        }
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(s).map(|dt| dt.date()))
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.naive_utc())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_integers() {
        assert_eq!(Value::from(42_i32), Value::Int(42));
        assert_eq!(Value::from(42_i64), Value::Int(42));
        assert_eq!(Value::from(42_i16), Value::Int(42));
    }

    #[test]
    fn test_from_option() {
        assert_eq!(Value::from(Some(42_i64)), Value::Int(42));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_display_list() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(list.to_string(), "[1, 2, 3]");
    }

    #[test]
    fn test_is_zero() {
        assert!(Value::Int(0).is_zero());
        assert!(Value::String(String::new()).is_zero());
        assert!(Value::Uuid(uuid::Uuid::nil()).is_zero());
        assert!(Value::Null.is_zero());
        assert!(!Value::Int(7).is_zero());
    }

    #[test]
    fn test_key_distinguishes_kinds() {
        assert_eq!(Value::Int(1).key(), Value::Int(1).key());
        assert_ne!(Value::Int(1).key(), Value::String("1".into()).key());
        assert_eq!(Value::Float(1.5).key(), ValueKey::Float(1.5_f64.to_bits()));
    }

    #[test]
    fn test_sql_literal() {
        assert_eq!(Value::Null.sql_literal(), "NULL");
        assert_eq!(Value::Int(5).sql_literal(), "5");
        assert_eq!(Value::from("O'Hara").sql_literal(), "'O''Hara'");
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).sql_literal(), "X'DEAD'");
        assert_eq!(Value::Bool(true).sql_literal(), "TRUE");
    }

    // ── Cast table ──────────────────────────────────────────────────

    #[test]
    fn test_convert_int_to_bool() {
        assert_eq!(
            Value::Int(1).convert_to(&FieldType::BooleanField, "Done").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            Value::Int(0).convert_to(&FieldType::BooleanField, "Done").unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_convert_string_to_int() {
        assert_eq!(
            Value::from("17").convert_to(&FieldType::IntegerField, "Age").unwrap(),
            Value::Int(17)
        );
    }

    #[test]
    fn test_convert_integral_float_to_int() {
        assert_eq!(
            Value::Float(2.0).convert_to(&FieldType::BigIntegerField, "N").unwrap(),
            Value::Int(2)
        );
        assert!(Value::Float(2.5)
            .convert_to(&FieldType::BigIntegerField, "N")
            .is_err());
    }

    #[test]
    fn test_convert_int_to_string_and_float() {
        assert_eq!(
            Value::Int(3).convert_to(&FieldType::CharField, "Code").unwrap(),
            Value::from("3")
        );
        assert_eq!(
            Value::Int(3).convert_to(&FieldType::FloatField, "Score").unwrap(),
            Value::Float(3.0)
        );
    }

    #[test]
    fn test_convert_mismatch_is_error() {
        let err = Value::from("abc")
            .convert_to(&FieldType::IntegerField, "Age")
            .unwrap_err();
        assert!(matches!(err, QuarryError::TypeMismatch(ref m) if m.starts_with("Age:")));

        assert!(Value::from("maybe")
            .convert_to(&FieldType::BooleanField, "Done")
            .is_err());
    }

    #[test]
    fn test_convert_null_passes_through() {
        assert_eq!(
            Value::Null.convert_to(&FieldType::IntegerField, "Age").unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_convert_temporal_strings() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(
            Value::from("2024-01-15").convert_to(&FieldType::DateField, "D").unwrap(),
            Value::Date(d)
        );
        let dt = d.and_hms_opt(12, 30, 0).unwrap();
        assert_eq!(
            Value::from("2024-01-15 12:30:00")
                .convert_to(&FieldType::DateTimeField, "T")
                .unwrap(),
            Value::DateTime(dt)
        );
    }

    #[test]
    fn test_convert_uuid_and_json() {
        let u = uuid::Uuid::new_v4();
        assert_eq!(
            Value::from(u.to_string()).convert_to(&FieldType::UuidField, "U").unwrap(),
            Value::Uuid(u)
        );
        assert_eq!(
            Value::from(r#"{"a":1}"#).convert_to(&FieldType::JsonField, "J").unwrap(),
            Value::Json(serde_json::json!({"a": 1}))
        );
    }
}

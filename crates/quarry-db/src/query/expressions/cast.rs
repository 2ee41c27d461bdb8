//! Typed casts.
//!
//! A [`CastType`] names a portable target type; the [`CastRegistry`] maps
//! each `(driver, type)` pair to the way that dialect spells it. Types with
//! no entry for a driver fail with [`QuarryError::CastNotImplemented`]
//! rather than producing SQL the database would reject.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use quarry_core::{QuarryError, QuarryResult};

use super::core::Fragment;
use crate::driver::Driver;

/// A portable cast target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CastType {
    /// Short text.
    String,
    /// Long text.
    Text,
    /// Signed integer.
    Int,
    /// Floating point.
    Float,
    /// Boolean.
    Bool,
    /// Calendar date.
    Date,
    /// Time of day.
    Time,
    /// Binary data.
    Bytes,
    /// Exact numeric.
    Decimal,
    /// JSON document.
    Json,
    /// UUID.
    Uuid,
    /// The SQL `NULL` literal.
    Null,
    /// An array of another type.
    Array(Box<CastType>),
}

impl CastType {
    /// The registry key, e.g. `"Int"` or `"Array"`.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Text => "Text",
            Self::Int => "Int",
            Self::Float => "Float",
            Self::Bool => "Bool",
            Self::Date => "Date",
            Self::Time => "Time",
            Self::Bytes => "Bytes",
            Self::Decimal => "Decimal",
            Self::Json => "Json",
            Self::Uuid => "Uuid",
            Self::Null => "Null",
            Self::Array(_) => "Array",
        }
    }
}

impl fmt::Display for CastType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array(inner) => write!(f, "{inner}[]"),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for CastType {
    type Err = QuarryError;

    /// Parses a type name case-insensitively; a `[]` suffix makes an array.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(inner) = s.strip_suffix("[]") {
            return Ok(Self::Array(Box::new(inner.parse()?)));
        }
        Ok(match s.to_ascii_lowercase().as_str() {
            "string" | "varchar" => Self::String,
            "text" => Self::Text,
            "int" | "integer" => Self::Int,
            "float" | "double" => Self::Float,
            "bool" | "boolean" => Self::Bool,
            "date" => Self::Date,
            "time" => Self::Time,
            "bytes" | "binary" => Self::Bytes,
            "decimal" | "numeric" => Self::Decimal,
            "json" => Self::Json,
            "uuid" => Self::Uuid,
            "null" => Self::Null,
            _ => {
                return Err(QuarryError::InvalidExpression(format!(
                    "unknown cast type `{s}`"
                )))
            }
        })
    }
}

/// How a dialect renders one cast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CastTemplate {
    /// `CAST(x AS <type>)`.
    Type(String),
    /// `<function>(x)`.
    Function(String),
    /// A fixed literal that ignores the operand.
    Literal(String),
    /// `CAST(x AS <element type>[])`, using the element's `Type` template.
    Array,
}

/// Cast templates keyed by driver and type name.
#[derive(Debug, Clone, Default)]
pub struct CastRegistry {
    templates: HashMap<(Driver, String), CastTemplate>,
}

impl CastRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a template for `name` on `driver`.
    pub fn register(&mut self, driver: Driver, name: &str, template: CastTemplate) -> &mut Self {
        self.templates.insert((driver, name.to_string()), template);
        self
    }

    /// The template for `name` on `driver`.
    pub fn get(&self, driver: Driver, name: &str) -> QuarryResult<&CastTemplate> {
        self.templates
            .get(&(driver, name.to_string()))
            .ok_or_else(|| QuarryError::CastNotImplemented(format!("{driver}: {name}")))
    }

    /// Renders `inner` cast to `cast`. `params` are appended to the type,
    /// e.g. `NUMERIC(10, 2)`, unless the template already carries them.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::CastNotImplemented`] when the driver has no
    /// template for the type.
    pub fn apply(
        &self,
        driver: Driver,
        cast: &CastType,
        params: &[u32],
        inner: Fragment,
    ) -> QuarryResult<Fragment> {
        match self.get(driver, cast.name())? {
            CastTemplate::Type(ty) => Ok(cast_as(inner, &with_params(ty, params))),
            CastTemplate::Function(func) => {
                let mut out = Fragment::sql(func);
                out.push_sql("(");
                out.push(&inner);
                Ok(out.suffixed(")"))
            }
            CastTemplate::Literal(literal) => Ok(Fragment::sql(literal)),
            CastTemplate::Array => {
                let CastType::Array(element) = cast else {
                    return Err(QuarryError::CastNotImplemented(format!(
                        "{driver}: {cast}"
                    )));
                };
                match self.get(driver, element.name())? {
                    CastTemplate::Type(ty) => {
                        Ok(cast_as(inner, &format!("{}[]", with_params(ty, params))))
                    }
                    _ => Err(QuarryError::CastNotImplemented(format!("{driver}: {cast}"))),
                }
            }
        }
    }

    /// The built-in templates.
    pub fn with_defaults() -> Self {
        use CastTemplate::{Array, Function, Literal, Type};

        let ty = |s: &str| Type(s.to_string());
        let mut r = Self::new();
        let table: [(&str, [Option<CastTemplate>; 3]); 13] = [
            ("String", [Some(ty("VARCHAR")), Some(ty("CHAR")), Some(ty("TEXT"))]),
            ("Text", [Some(ty("TEXT")), Some(ty("CHAR")), Some(ty("TEXT"))]),
            ("Int", [Some(ty("BIGINT")), Some(ty("SIGNED")), Some(ty("INTEGER"))]),
            ("Float", [Some(ty("DOUBLE PRECISION")), Some(ty("DOUBLE")), Some(ty("REAL"))]),
            ("Bool", [Some(ty("BOOLEAN")), Some(ty("UNSIGNED")), Some(ty("INTEGER"))]),
            ("Date", [Some(ty("DATE")), Some(ty("DATE")), Some(Function("DATE".into()))]),
            ("Time", [Some(ty("TIME")), Some(ty("TIME")), Some(Function("TIME".into()))]),
            ("Bytes", [Some(ty("BYTEA")), Some(ty("BINARY")), Some(ty("BLOB"))]),
            ("Decimal", [Some(ty("NUMERIC")), Some(ty("DECIMAL")), Some(ty("NUMERIC"))]),
            ("Json", [Some(ty("JSONB")), Some(ty("JSON")), Some(ty("TEXT"))]),
            ("Uuid", [Some(ty("UUID")), Some(ty("CHAR(36)")), Some(ty("TEXT"))]),
            (
                "Null",
                [
                    Some(Literal("NULL".into())),
                    Some(Literal("NULL".into())),
                    Some(Literal("NULL".into())),
                ],
            ),
            ("Array", [Some(Array), None, None]),
        ];
        for (name, templates) in table {
            for (driver, template) in [Driver::Postgres, Driver::MySql, Driver::Sqlite]
                .into_iter()
                .zip(templates)
            {
                if let Some(template) = template {
                    r.register(driver, name, template);
                }
            }
        }
        r
    }
}

fn with_params(ty: &str, params: &[u32]) -> String {
    if params.is_empty() || ty.ends_with(')') {
        return ty.to_string();
    }
    let params: Vec<String> = params.iter().map(u32::to_string).collect();
    format!("{ty}({})", params.join(", "))
}

fn cast_as(inner: Fragment, ty: &str) -> Fragment {
    let mut out = Fragment::sql("CAST(");
    out.push(&inner);
    out.push_sql(" AS ");
    out.push_sql(ty);
    out.suffixed(")")
}

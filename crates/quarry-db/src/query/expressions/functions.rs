//! SQL functions.
//!
//! A [`FunctionRegistry`] maps upper-cased function names to renderers that
//! receive their arguments already resolved. Like lookups, functions are
//! driver-tiered: a per-driver override is consulted before the global
//! table, which is how `CONCAT` becomes `||` on SQLite and `LENGTH` becomes
//! `CHAR_LENGTH` on MySQL.
//!
//! The free functions build [`Expr::Func`] nodes for the built-ins.
//!
//! # Examples
//!
//! ```
//! use quarry_db::query::expressions::functions::{coalesce, upper};
//! use quarry_db::query::expressions::Expr;
//!
//! // COALESCE(UPPER(Title), 'untitled')
//! let expr = coalesce(vec![upper(Expr::col("Title")), Expr::value("untitled")]);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use quarry_core::{QuarryError, QuarryResult};

use super::core::{Expr, Fragment};
use crate::driver::Driver;

/// A function renderer: `(driver, args) -> fragment`.
pub type FunctionFn = Arc<dyn Fn(Driver, Vec<Fragment>) -> QuarryResult<Fragment> + Send + Sync>;

/// Driver-tiered function table.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    global: HashMap<String, FunctionFn>,
    drivers: HashMap<Driver, HashMap<String, FunctionFn>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut global: Vec<_> = self.global.keys().collect();
        global.sort();
        f.debug_struct("FunctionRegistry")
            .field("global", &global)
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FunctionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `func` under `name` (case-insensitive), globally when
    /// `drivers` is empty and as an override for each listed driver
    /// otherwise.
    pub fn register<F>(&mut self, name: &str, func: F, drivers: &[Driver]) -> &mut Self
    where
        F: Fn(Driver, Vec<Fragment>) -> QuarryResult<Fragment> + Send + Sync + 'static,
    {
        let func: FunctionFn = Arc::new(func);
        let name = name.to_ascii_uppercase();
        if drivers.is_empty() {
            self.global.insert(name, func);
        } else {
            for driver in drivers {
                self.drivers
                    .entry(*driver)
                    .or_default()
                    .insert(name.clone(), Arc::clone(&func));
            }
        }
        self
    }

    /// Finds the function for `driver`.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::UnsupportedFunction`] if neither an override
    /// nor a global entry exists.
    pub fn get(&self, driver: Driver, name: &str) -> QuarryResult<&FunctionFn> {
        let key = name.to_ascii_uppercase();
        self.drivers
            .get(&driver)
            .and_then(|m| m.get(&key))
            .or_else(|| self.global.get(&key))
            .ok_or_else(|| QuarryError::UnsupportedFunction(format!("{driver}: {name}")))
    }

    /// Resolves and applies a function.
    pub fn apply(&self, driver: Driver, name: &str, args: Vec<Fragment>) -> QuarryResult<Fragment> {
        let func = self.get(driver, name)?;
        func(driver, args)
    }

    /// The built-in function set.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        for name in [
            "SUM", "AVG", "MAX", "MIN", "COALESCE", "SUBSTR", "TRIM", "UPPER", "LOWER", "ABS",
            "ROUND",
        ] {
            r.register(name, call(name), &[]);
        }
        r.register("COUNT", count, &[])
            .register("CONCAT", call("CONCAT"), &[])
            .register("CONCAT", sqlite_concat, &[Driver::Sqlite])
            .register("LENGTH", call("LENGTH"), &[])
            .register("LENGTH", call("CHAR_LENGTH"), &[Driver::MySql])
            .register("NOW", call("NOW"), &[])
            .register("NOW", |_, _| Ok(Fragment::sql("CURRENT_TIMESTAMP")), &[Driver::Sqlite]);
        r
    }
}

// ── Renderers ──────────────────────────────────────────────────────────

fn join(out: &mut Fragment, args: &[Fragment], separator: &str) {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push_sql(separator);
        }
        out.push(arg);
    }
}

/// A plain `NAME(a, b, ...)` call.
fn call(
    name: &'static str,
) -> impl Fn(Driver, Vec<Fragment>) -> QuarryResult<Fragment> + Send + Sync + 'static {
    move |_, args| {
        let mut out = Fragment::sql(name);
        out.push_sql("(");
        join(&mut out, &args, ", ");
        Ok(out.suffixed(")"))
    }
}

fn count(_: Driver, args: Vec<Fragment>) -> QuarryResult<Fragment> {
    if args.is_empty() {
        return Ok(Fragment::sql("COUNT(*)"));
    }
    let mut out = Fragment::sql("COUNT(");
    join(&mut out, &args, ", ");
    Ok(out.suffixed(")"))
}

fn sqlite_concat(_: Driver, args: Vec<Fragment>) -> QuarryResult<Fragment> {
    if args.is_empty() {
        return Err(QuarryError::InvalidExpression(
            "CONCAT needs at least one argument".to_string(),
        ));
    }
    let mut out = Fragment::default();
    join(&mut out, &args, " || ");
    Ok(out.wrapped())
}

// ── Builders ───────────────────────────────────────────────────────────

/// `COUNT(expr)`; `COUNT(*)` when `expr` is `None`.
pub fn count_of(expr: Option<Expr>) -> Expr {
    Expr::func("COUNT", expr.into_iter().collect())
}

/// `SUM(expr)`.
pub fn sum(expr: Expr) -> Expr {
    Expr::func("SUM", vec![expr])
}

/// `AVG(expr)`.
pub fn avg(expr: Expr) -> Expr {
    Expr::func("AVG", vec![expr])
}

/// `MAX(expr)`.
pub fn max(expr: Expr) -> Expr {
    Expr::func("MAX", vec![expr])
}

/// `MIN(expr)`.
pub fn min(expr: Expr) -> Expr {
    Expr::func("MIN", vec![expr])
}

/// `COALESCE(a, b, ...)`.
pub fn coalesce(args: Vec<Expr>) -> Expr {
    Expr::func("COALESCE", args)
}

/// String concatenation in the dialect's form.
pub fn concat(args: Vec<Expr>) -> Expr {
    Expr::func("CONCAT", args)
}

/// Character length.
pub fn length(expr: Expr) -> Expr {
    Expr::func("LENGTH", vec![expr])
}

/// `UPPER(expr)`.
pub fn upper(expr: Expr) -> Expr {
    Expr::func("UPPER", vec![expr])
}

/// `LOWER(expr)`.
pub fn lower(expr: Expr) -> Expr {
    Expr::func("LOWER", vec![expr])
}

/// The current timestamp.
pub fn now() -> Expr {
    Expr::func("NOW", Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn col(sql: &str) -> Fragment {
        Fragment::sql(sql)
    }

    #[test]
    fn test_plain_call() {
        let r = FunctionRegistry::with_defaults();
        let f = r
            .apply(Driver::Postgres, "coalesce", vec![col("a"), Fragment::bound(Value::Int(0))])
            .unwrap();
        assert_eq!(f.sql, "COALESCE(a, ?)");
        assert_eq!(f.args, vec![Value::Int(0)]);
    }

    #[test]
    fn test_count_star() {
        let r = FunctionRegistry::with_defaults();
        assert_eq!(r.apply(Driver::MySql, "COUNT", vec![]).unwrap().sql, "COUNT(*)");
        assert_eq!(
            r.apply(Driver::MySql, "COUNT", vec![col("x")]).unwrap().sql,
            "COUNT(x)"
        );
    }

    #[test]
    fn test_dialect_overrides() {
        let r = FunctionRegistry::with_defaults();
        let args = || vec![col("a"), col("b")];
        assert_eq!(r.apply(Driver::Sqlite, "CONCAT", args()).unwrap().sql, "(a || b)");
        assert_eq!(r.apply(Driver::Postgres, "CONCAT", args()).unwrap().sql, "CONCAT(a, b)");
        assert_eq!(
            r.apply(Driver::MySql, "LENGTH", vec![col("a")]).unwrap().sql,
            "CHAR_LENGTH(a)"
        );
        assert_eq!(r.apply(Driver::Sqlite, "now", vec![]).unwrap().sql, "CURRENT_TIMESTAMP");
    }

    #[test]
    fn test_unknown_function() {
        let r = FunctionRegistry::with_defaults();
        let err = r.apply(Driver::Sqlite, "SOUNDEX", vec![]).unwrap_err();
        assert!(matches!(err, QuarryError::UnsupportedFunction(ref m) if m.contains("SOUNDEX")));
    }

    #[test]
    fn test_custom_registration() {
        let mut r = FunctionRegistry::new();
        r.register(
            "greatest",
            |_, args| {
                let mut out = Fragment::sql("MAX(");
                join(&mut out, &args, ", ");
                Ok(out.suffixed(")"))
            },
            &[Driver::Sqlite],
        );
        assert_eq!(
            r.apply(Driver::Sqlite, "GREATEST", vec![col("a"), col("b")]).unwrap().sql,
            "MAX(a, b)"
        );
        assert!(r.apply(Driver::Postgres, "GREATEST", vec![]).is_err());
    }

    #[test]
    fn test_builders() {
        assert_eq!(
            count_of(None),
            Expr::Func {
                name: "COUNT".into(),
                args: vec![]
            }
        );
        assert!(matches!(upper(Expr::col("Title")), Expr::Func { ref name, .. } if name == "UPPER"));
    }
}

//! Field lookups.
//!
//! A lookup turns a resolved left-hand side and its arguments into a boolean
//! SQL fragment. Lookups live in a driver-tiered [`LookupRegistry`]: a global
//! table plus per-driver overrides, consulted in that order (override first).
//!
//! Value arguments reach the lookup unbound so that pattern lookups can
//! escape and wrap them (`%v%`) before binding. Expression arguments arrive
//! already rendered and are spliced through the dialect's pattern forms
//! (`LIKE '%' || rhs || '%'`).
//!
//! SQLite's `LIKE` ignores ASCII case, so its case-sensitive pattern lookups
//! use `GLOB` instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use quarry_core::{QuarryError, QuarryResult};

use crate::driver::Driver;
use crate::query::expressions::Fragment;
use crate::value::Value;

/// One argument handed to a lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupArg {
    /// A plain value, not yet bound.
    Value(Value),
    /// A rendered expression.
    Sql(Fragment),
}

/// A lookup implementation: `(driver, lhs, args) -> fragment`.
pub type LookupFn =
    Arc<dyn Fn(Driver, Fragment, Vec<LookupArg>) -> QuarryResult<Fragment> + Send + Sync>;

/// Driver-tiered lookup table.
#[derive(Clone, Default)]
pub struct LookupRegistry {
    global: HashMap<String, LookupFn>,
    drivers: HashMap<Driver, HashMap<String, LookupFn>>,
}

impl fmt::Debug for LookupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut global: Vec<_> = self.global.keys().collect();
        global.sort();
        f.debug_struct("LookupRegistry")
            .field("global", &global)
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LookupRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `lookup` under `name`, globally when `drivers` is empty and
    /// as an override for each listed driver otherwise.
    pub fn register<F>(&mut self, name: &str, lookup: F, drivers: &[Driver]) -> &mut Self
    where
        F: Fn(Driver, Fragment, Vec<LookupArg>) -> QuarryResult<Fragment> + Send + Sync + 'static,
    {
        let lookup: LookupFn = Arc::new(lookup);
        if drivers.is_empty() {
            self.global.insert(name.to_string(), lookup);
        } else {
            for driver in drivers {
                self.drivers
                    .entry(*driver)
                    .or_default()
                    .insert(name.to_string(), Arc::clone(&lookup));
            }
        }
        self
    }

    /// Finds the lookup for `driver`.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::UnsupportedLookup`] if neither an override nor
    /// a global entry exists.
    pub fn get(&self, driver: Driver, name: &str) -> QuarryResult<&LookupFn> {
        self.drivers
            .get(&driver)
            .and_then(|m| m.get(name))
            .or_else(|| self.global.get(name))
            .ok_or_else(|| QuarryError::UnsupportedLookup(format!("{driver}: {name}")))
    }

    /// Resolves and applies a lookup.
    pub fn apply(
        &self,
        driver: Driver,
        name: &str,
        lhs: Fragment,
        args: Vec<LookupArg>,
    ) -> QuarryResult<Fragment> {
        let lookup = self.get(driver, name)?;
        lookup(driver, lhs, args)
    }

    /// The built-in lookup set.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register("exact", exact, &[])
            .register("not", not, &[])
            .register("gt", comparison(">"), &[])
            .register("gte", comparison(">="), &[])
            .register("lt", comparison("<"), &[])
            .register("lte", comparison("<="), &[])
            .register("in", in_list, &[])
            .register("isnull", isnull, &[])
            .register("range", range, &[]);

        for (name, pattern) in [
            ("contains", Pattern::Contains),
            ("startswith", Pattern::StartsWith),
            ("endswith", Pattern::EndsWith),
        ] {
            r.register(name, like(pattern, Case::Sensitive), &[]);
            r.register(name, glob(pattern), &[Driver::Sqlite]);
            r.register(&format!("i{name}"), like(pattern, Case::Insensitive), &[]);
        }
        r.register("iexact", like(Pattern::Exact, Case::Insensitive), &[]);

        r.register("regex", regex("~"), &[Driver::Postgres])
            .register("iregex", regex("~*"), &[Driver::Postgres])
            .register("regex", regex("REGEXP BINARY"), &[Driver::MySql])
            .register("iregex", regex("REGEXP"), &[Driver::MySql])
            .register("regex", regex("REGEXP"), &[Driver::Sqlite])
            .register("iregex", sqlite_iregex, &[Driver::Sqlite]);

        r.register("bitand", bitwise("&"), &[])
            .register("bitor", bitwise("|"), &[])
            .register("bitxor", bitwise("#"), &[Driver::Postgres])
            .register("bitxor", bitwise("^"), &[Driver::MySql])
            .register("bitxor", sqlite_bitxor, &[Driver::Sqlite]);
        r
    }
}

/// Escapes `\`, `%` and `_` so a value matches literally inside `LIKE`.
pub fn prep_for_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escapes `*`, `?` and `[` so a value matches literally inside `GLOB`.
pub fn prep_for_glob(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' | '?' | '[' => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            _ => out.push(c),
        }
    }
    out
}

fn arity(name: &str, args: &[LookupArg], expected: usize) -> QuarryResult<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(QuarryError::LookupArgsInvalid(format!(
            "{name} expects {expected} argument(s), got {}",
            args.len()
        )))
    }
}

fn single(name: &str, mut args: Vec<LookupArg>) -> QuarryResult<LookupArg> {
    arity(name, &args, 1)?;
    Ok(args.remove(0))
}

fn push_arg(out: &mut Fragment, arg: LookupArg) {
    match arg {
        LookupArg::Value(v) => out.bind(v),
        LookupArg::Sql(f) => out.push(&f),
    }
}

fn binary(lhs: Fragment, op: &str, rhs: LookupArg) -> Fragment {
    let mut out = lhs;
    out.push_sql(" ");
    out.push_sql(op);
    out.push_sql(" ");
    push_arg(&mut out, rhs);
    out
}

fn exact(_: Driver, lhs: Fragment, args: Vec<LookupArg>) -> QuarryResult<Fragment> {
    match single("exact", args)? {
        LookupArg::Value(Value::Null) => Ok(lhs.suffixed(" IS NULL")),
        rhs => Ok(binary(lhs, "=", rhs)),
    }
}

fn not(_: Driver, lhs: Fragment, args: Vec<LookupArg>) -> QuarryResult<Fragment> {
    match single("not", args)? {
        LookupArg::Value(Value::Null) => Ok(lhs.suffixed(" IS NOT NULL")),
        rhs => Ok(binary(lhs, "!=", rhs)),
    }
}

fn comparison(
    op: &'static str,
) -> impl Fn(Driver, Fragment, Vec<LookupArg>) -> QuarryResult<Fragment> + Send + Sync {
    move |_, lhs, args| Ok(binary(lhs, op, single(op, args)?))
}

fn in_list(_: Driver, lhs: Fragment, args: Vec<LookupArg>) -> QuarryResult<Fragment> {
    if args.is_empty() {
        return Err(QuarryError::LookupArgsInvalid(
            "in expects at least one value".to_string(),
        ));
    }
    let mut out = lhs.suffixed(" IN (");
    for (i, arg) in args.into_iter().enumerate() {
        if i > 0 {
            out.push_sql(", ");
        }
        push_arg(&mut out, arg);
    }
    out.push_sql(")");
    Ok(out)
}

fn isnull(_: Driver, lhs: Fragment, args: Vec<LookupArg>) -> QuarryResult<Fragment> {
    match single("isnull", args)? {
        LookupArg::Value(Value::Bool(true)) => Ok(lhs.suffixed(" IS NULL")),
        LookupArg::Value(Value::Bool(false)) => Ok(lhs.suffixed(" IS NOT NULL")),
        other => Err(QuarryError::LookupArgsInvalid(format!(
            "isnull expects a boolean, got {other:?}"
        ))),
    }
}

fn range(_: Driver, lhs: Fragment, args: Vec<LookupArg>) -> QuarryResult<Fragment> {
    arity("range", &args, 2)?;
    let mut args = args.into_iter();
    let mut out = lhs.suffixed(" BETWEEN ");
    if let Some(low) = args.next() {
        push_arg(&mut out, low);
    }
    out.push_sql(" AND ");
    if let Some(high) = args.next() {
        push_arg(&mut out, high);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    Exact,
    Contains,
    StartsWith,
    EndsWith,
}

impl Pattern {
    /// Wraps an already escaped value in the `any` wildcard.
    fn wrap(self, escaped: String, any: char) -> String {
        match self {
            Self::Exact => escaped,
            Self::Contains => format!("{any}{escaped}{any}"),
            Self::StartsWith => format!("{escaped}{any}"),
            Self::EndsWith => format!("{any}{escaped}"),
        }
    }

    fn wrap_sql(self, driver: Driver, rhs: &Fragment, any: &str) -> Fragment {
        let (lead, trail) = match self {
            Self::Exact => return rhs.clone(),
            Self::Contains => (true, true),
            Self::StartsWith => (false, true),
            Self::EndsWith => (true, false),
        };
        let mut parts = Vec::with_capacity(3);
        if lead {
            parts.push(Fragment::sql(any));
        }
        parts.push(rhs.clone());
        if trail {
            parts.push(Fragment::sql(any));
        }

        let concat = driver == Driver::MySql;
        let mut out = Fragment::sql(if concat { "CONCAT(" } else { "" });
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                out.push_sql(if concat { ", " } else { " || " });
            }
            out.push(part);
        }
        if concat {
            out.push_sql(")");
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Case {
    Sensitive,
    Insensitive,
}

fn like(
    pattern: Pattern,
    case: Case,
) -> impl Fn(Driver, Fragment, Vec<LookupArg>) -> QuarryResult<Fragment> + Send + Sync {
    move |driver, lhs, args| {
        let rhs = match single("like", args)? {
            LookupArg::Value(Value::Null) if pattern == Pattern::Exact => {
                return Ok(lhs.suffixed(" IS NULL"));
            }
            LookupArg::Value(v) => {
                let mut f = Fragment::default();
                f.bind(Value::String(pattern.wrap(prep_for_like(&text_of(&v)), '%')));
                f
            }
            LookupArg::Sql(f) => pattern.wrap_sql(driver, &f, "'%'"),
        };

        let mut out = Fragment::default();
        match (driver, case) {
            (Driver::MySql, Case::Sensitive) => {
                out.push(&lhs);
                out.push_sql(" LIKE BINARY ");
                out.push(&rhs);
            }
            (Driver::MySql, Case::Insensitive) => {
                out.push(&lhs);
                out.push_sql(" LIKE ");
                out.push(&rhs);
            }
            (_, Case::Sensitive) => {
                out.push(&lhs);
                out.push_sql(" LIKE ");
                out.push(&rhs);
            }
            (_, Case::Insensitive) => {
                out.push_sql("LOWER(");
                out.push(&lhs);
                out.push_sql(") LIKE LOWER(");
                out.push(&rhs);
                out.push_sql(")");
            }
        }
        if driver == Driver::Sqlite {
            out.push_sql(" ESCAPE '\\'");
        }
        Ok(out)
    }
}

fn text_of(value: &Value) -> String {
    value.as_str().map_or_else(|| value.to_string(), str::to_string)
}

/// Case-sensitive pattern matching for SQLite.
fn glob(
    pattern: Pattern,
) -> impl Fn(Driver, Fragment, Vec<LookupArg>) -> QuarryResult<Fragment> + Send + Sync {
    move |driver, lhs, args| {
        let rhs = match single("glob", args)? {
            LookupArg::Value(v) => {
                let mut f = Fragment::default();
                f.bind(Value::String(pattern.wrap(prep_for_glob(&text_of(&v)), '*')));
                f
            }
            LookupArg::Sql(f) => pattern.wrap_sql(driver, &f, "'*'"),
        };
        let mut out = lhs.suffixed(" GLOB ");
        out.push(&rhs);
        Ok(out)
    }
}

fn regex(
    op: &'static str,
) -> impl Fn(Driver, Fragment, Vec<LookupArg>) -> QuarryResult<Fragment> + Send + Sync {
    move |_, lhs, args| Ok(binary(lhs, op, single("regex", args)?))
}

fn sqlite_iregex(_: Driver, lhs: Fragment, args: Vec<LookupArg>) -> QuarryResult<Fragment> {
    let mut out = lhs.suffixed(" REGEXP '(?i)' || ");
    push_arg(&mut out, single("iregex", args)?);
    Ok(out)
}

fn bitwise(
    op: &'static str,
) -> impl Fn(Driver, Fragment, Vec<LookupArg>) -> QuarryResult<Fragment> + Send + Sync {
    move |_, lhs, args| {
        let rhs = single(op, args)?;
        let mut out = Fragment::sql("(");
        out.push(&lhs);
        out.push_sql(" ");
        out.push_sql(op);
        out.push_sql(" ");
        push_arg(&mut out, rhs);
        out.push_sql(") <> 0");
        Ok(out)
    }
}

/// `a XOR b` as `(a | b) - (a & b)`; SQLite has no XOR operator.
fn sqlite_bitxor(_: Driver, lhs: Fragment, args: Vec<LookupArg>) -> QuarryResult<Fragment> {
    let rhs = single("bitxor", args)?;
    let mut out = Fragment::sql("((");
    out.push(&lhs);
    out.push_sql(" | ");
    push_arg(&mut out, rhs.clone());
    out.push_sql(") - (");
    out.push(&lhs);
    out.push_sql(" & ");
    push_arg(&mut out, rhs);
    out.push_sql(")) <> 0");
    Ok(out)
}

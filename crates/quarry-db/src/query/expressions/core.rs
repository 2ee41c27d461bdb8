//! The expression tree.
//!
//! An [`Expr`] is a closed set of node kinds. Resolving a node against an
//! [`ExprContext`] renders it for the context's driver and model and yields
//! [`Expr::Resolved`], which carries the SQL text together with the
//! arguments bound by its `?` placeholders, in order. Resolving an already
//! resolved node returns it unchanged.
//!
//! # Examples
//!
//! ```
//! use quarry_db::query::expressions::Expr;
//!
//! // Title__icontains = "milk" OR Done = true
//! let filter = Expr::filter("Title__icontains", "milk") | Expr::filter("Done", true);
//! assert!(!filter.is_resolved());
//! ```

use std::collections::BTreeMap;
use std::ops;

use quarry_core::{QuarryError, QuarryResult};

use super::cast::CastType;
use super::context::ExprContext;
use super::raw::RawTemplate;
use crate::model::{pk_of, Model};
use crate::query::lookups::LookupArg;
use crate::value::Value;

/// Rendered SQL plus the arguments its placeholders bind, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    /// SQL text using `?` placeholders.
    pub sql: String,
    /// Bound arguments, one per placeholder.
    pub args: Vec<Value>,
}

impl Fragment {
    /// A fragment with no arguments.
    pub fn sql(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            args: Vec::new(),
        }
    }

    /// A fragment with SQL and arguments.
    pub fn new(sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    /// A single bound placeholder.
    pub fn bound(value: Value) -> Self {
        Self {
            sql: "?".to_string(),
            args: vec![value],
        }
    }

    /// Appends SQL text.
    pub fn push_sql(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    /// Appends another fragment's SQL and arguments.
    pub fn push(&mut self, other: &Self) {
        self.sql.push_str(&other.sql);
        self.args.extend(other.args.iter().cloned());
    }

    /// Appends a bound placeholder.
    pub fn bind(&mut self, value: Value) {
        self.sql.push('?');
        self.args.push(value);
    }

    /// Returns the fragment with `sql` appended.
    #[must_use]
    pub fn suffixed(mut self, sql: &str) -> Self {
        self.sql.push_str(sql);
        self
    }

    /// Returns the fragment wrapped in parentheses.
    #[must_use]
    pub fn wrapped(self) -> Self {
        Self {
            sql: format!("({})", self.sql),
            args: self.args,
        }
    }

    /// Returns `true` if no SQL was rendered.
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// How the children of a logical group combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    /// All children must hold.
    And,
    /// Any child must hold.
    Or,
}

impl LogicalOp {
    const fn separator(self) -> &'static str {
        match self {
            Self::And => " AND ",
            Self::Or => " OR ",
        }
    }
}

/// A query expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A dotted field path, or the name of an annotation.
    Column(String),
    /// A value, bound through a placeholder unless `unsafe_literal` is set.
    Value {
        /// The value.
        value: Value,
        /// Inline the value as a SQL literal instead of binding it.
        unsafe_literal: bool,
    },
    /// A function call resolved through the function registry.
    Func {
        /// Function name.
        name: String,
        /// Arguments.
        args: Vec<Expr>,
    },
    /// A typed cast resolved through the cast registry.
    Cast {
        /// Target type.
        cast: CastType,
        /// The expression being cast.
        inner: Box<Expr>,
        /// Type parameters such as a length or a precision and scale.
        params: Vec<u32>,
    },
    /// A named comparison resolved through the lookup registry.
    Lookup {
        /// Left-hand side.
        lhs: Box<Expr>,
        /// Lookup name (`exact`, `icontains`, ...).
        op: String,
        /// Right-hand side arguments.
        args: Vec<Expr>,
    },
    /// An AND/OR group, optionally negated.
    Logical {
        /// Combination operator.
        op: LogicalOp,
        /// Members of the group.
        children: Vec<Expr>,
        /// Whether the group is wrapped in `NOT (...)`.
        not: bool,
    },
    /// A raw SQL template with `![Field]` and `?[n]` references.
    Raw(RawTemplate),
    /// Expressions rendered one after another, space separated.
    Chain(Vec<Expr>),
    /// A rendered expression.
    Resolved(Fragment),
}

/// Splits `path__lookup` into the path and lookup name; no `__` means
/// `exact`.
pub fn split_lookup(key: &str) -> (&str, &str) {
    key.rsplit_once("__").unwrap_or((key, "exact"))
}

/// Shorthand for [`Expr::filter`].
pub fn q(key: &str, value: impl Into<Value>) -> Expr {
    Expr::filter(key, value)
}

impl Expr {
    /// A column reference.
    pub fn col(path: &str) -> Self {
        Self::Column(path.to_string())
    }

    /// A bound value.
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value {
            value: value.into(),
            unsafe_literal: false,
        }
    }

    /// A value inlined as a literal. Never pass untrusted input.
    pub fn unsafe_value(value: impl Into<Value>) -> Self {
        Self::Value {
            value: value.into(),
            unsafe_literal: true,
        }
    }

    /// A model instance, compared through its primary key.
    pub fn model<M: Model>(instance: &M) -> Self {
        Self::value(pk_of(instance))
    }

    /// A function call.
    pub fn func(name: &str, args: Vec<Self>) -> Self {
        Self::Func {
            name: name.to_string(),
            args,
        }
    }

    /// A cast without type parameters.
    pub fn cast(cast: CastType, inner: Self) -> Self {
        Self::cast_with(cast, inner, Vec::new())
    }

    /// A cast with type parameters, e.g. `Decimal` with `[10, 2]`.
    pub fn cast_with(cast: CastType, inner: Self, params: Vec<u32>) -> Self {
        Self::Cast {
            cast,
            inner: Box::new(inner),
            params,
        }
    }

    /// A lookup applied to an arbitrary left-hand side.
    pub fn lookup(lhs: Self, op: &str, args: Vec<Self>) -> Self {
        Self::Lookup {
            lhs: Box::new(lhs),
            op: op.to_string(),
            args,
        }
    }

    /// A filter written in the lookup DSL: `("User.Name__icontains", "ann")`.
    pub fn filter(key: &str, value: impl Into<Value>) -> Self {
        Self::filter_expr(key, Self::value(value))
    }

    /// A filter whose right-hand side is an expression.
    pub fn filter_expr(key: &str, rhs: Self) -> Self {
        let (path, op) = split_lookup(key);
        Self::lookup(Self::col(path), op, vec![rhs])
    }

    /// A conjunction.
    pub fn and(children: Vec<Self>) -> Self {
        Self::Logical {
            op: LogicalOp::And,
            children,
            not: false,
        }
    }

    /// A disjunction.
    pub fn or(children: Vec<Self>) -> Self {
        Self::Logical {
            op: LogicalOp::Or,
            children,
            not: false,
        }
    }

    /// The negation of this expression.
    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            Self::Logical { op, children, not } => Self::Logical {
                op,
                children,
                not: !not,
            },
            other => Self::Logical {
                op: LogicalOp::And,
                children: vec![other],
                not: true,
            },
        }
    }

    /// A raw SQL template; see [`RawTemplate::parse`].
    pub fn raw(statement: &str, params: Vec<Value>) -> QuarryResult<Self> {
        RawTemplate::parse(statement, params).map(Self::Raw)
    }

    /// A raw template whose `%s` markers name fields in order:
    /// `Expr::raw_fields("UPPER(%s)", &["Author.Name"])`.
    pub fn raw_fields(statement: &str, fields: &[&str]) -> QuarryResult<Self> {
        RawTemplate::with_fields(statement, fields).map(Self::Raw)
    }

    /// An update assignment, `![Field] = ...`; see
    /// [`RawTemplate::assignment`].
    pub fn update(statement: &str, params: Vec<Value>) -> QuarryResult<Self> {
        RawTemplate::assignment(statement, params).map(Self::Raw)
    }

    /// Expressions rendered in sequence.
    pub fn chain(parts: Vec<Self>) -> Self {
        Self::Chain(parts)
    }

    /// Returns `true` once resolved.
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// The path this expression selects unchanged: a column, or a raw
    /// template consisting of one field reference.
    pub fn bare_column(&self) -> Option<&str> {
        match self {
            Self::Column(path) => Some(path),
            Self::Raw(raw) => raw.bare_column(),
            _ => None,
        }
    }

    /// The field an update assignment writes, if this is one.
    pub fn update_target(&self) -> Option<&str> {
        match self {
            Self::Raw(raw) => raw.target(),
            _ => None,
        }
    }

    /// Renders the expression against `ctx`.
    ///
    /// # Errors
    ///
    /// Fails with the configuration error describing the first unresolvable
    /// part: an unknown field, lookup, function or cast.
    pub fn resolve(&self, ctx: &mut ExprContext<'_>) -> QuarryResult<Self> {
        match self {
            Self::Resolved(_) => Ok(self.clone()),
            other => other.fragment(ctx).map(Self::Resolved),
        }
    }

    /// Writes the SQL of a resolved expression and returns its arguments.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::InvalidExpression`] if the expression was not
    /// resolved first.
    pub fn sql(&self, w: &mut String) -> QuarryResult<Vec<Value>> {
        match self {
            Self::Resolved(f) => {
                w.push_str(&f.sql);
                Ok(f.args.clone())
            }
            other => Err(QuarryError::InvalidExpression(format!(
                "expression must be resolved before rendering: {other:?}"
            ))),
        }
    }

    /// Resolves and returns the rendered fragment.
    pub(crate) fn fragment(&self, ctx: &mut ExprContext<'_>) -> QuarryResult<Fragment> {
        let driver = ctx.driver();
        let engine = ctx.engine();
        match self {
            Self::Resolved(f) => Ok(f.clone()),
            Self::Column(path) => ctx.resolve_column(path),
            Self::Value {
                value,
                unsafe_literal: false,
            } => Ok(Fragment::bound(value.clone())),
            Self::Value {
                value,
                unsafe_literal: true,
            } => Ok(Fragment::sql(&value.sql_literal())),
            Self::Func { name, args } if name.eq_ignore_ascii_case("CAST") => {
                let (inner, cast) = match args.as_slice() {
                    [inner, Self::Value {
                        value: Value::String(cast),
                        ..
                    }] => (inner, cast.parse::<CastType>()?),
                    _ => {
                        return Err(QuarryError::InvalidExpression(
                            "CAST expects an expression and a type name".to_string(),
                        ))
                    }
                };
                let inner = inner.fragment(ctx)?;
                engine.casts.apply(driver, &cast, &[], inner)
            }
            Self::Func { name, args } => {
                let args = args
                    .iter()
                    .map(|a| a.fragment(ctx))
                    .collect::<QuarryResult<Vec<_>>>()?;
                engine.functions.apply(driver, name, args)
            }
            Self::Cast {
                cast,
                inner,
                params,
            } => {
                let inner = inner.fragment(ctx)?;
                engine.casts.apply(driver, cast, params, inner)
            }
            Self::Lookup { lhs, op, args } => {
                let lhs = lhs.fragment(ctx)?;
                let mut rhs = Vec::with_capacity(args.len());
                for arg in args {
                    match arg {
                        Self::Value {
                            value: Value::List(items),
                            unsafe_literal: false,
                        } => rhs.extend(items.iter().cloned().map(LookupArg::Value)),
                        Self::Value {
                            value,
                            unsafe_literal: false,
                        } => rhs.push(LookupArg::Value(value.clone())),
                        other => rhs.push(LookupArg::Sql(other.fragment(ctx)?)),
                    }
                }
                engine.lookups.apply(driver, op, lhs, rhs)
            }
            Self::Logical { op, children, not } => {
                let mut parts = Vec::with_capacity(children.len());
                for child in children {
                    let f = child.fragment(ctx)?;
                    if !f.is_empty() {
                        parts.push(f);
                    }
                }
                let mut out = Fragment::default();
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        out.push_sql(op.separator());
                    }
                    out.push(part);
                }
                Ok(match (parts.len(), not) {
                    (0, _) => out,
                    (_, true) => {
                        let mut negated = Fragment::sql("NOT (");
                        negated.push(&out);
                        negated.suffixed(")")
                    }
                    (1, false) => out,
                    (_, false) => out.wrapped(),
                })
            }
            Self::Raw(raw) => raw.render(ctx, None),
            Self::Chain(parts) => {
                let mut out = Fragment::default();
                for part in parts {
                    let f = part.fragment(ctx)?;
                    if f.is_empty() {
                        continue;
                    }
                    if !out.is_empty() {
                        out.push_sql(" ");
                    }
                    out.push(&f);
                }
                Ok(out)
            }
        }
    }
}

// ── Conversions ────────────────────────────────────────────────────────

impl From<&str> for Expr {
    fn from(path: &str) -> Self {
        Self::col(path)
    }
}

impl From<String> for Expr {
    fn from(path: String) -> Self {
        Self::Column(path)
    }
}

impl From<Fragment> for Expr {
    fn from(fragment: Fragment) -> Self {
        Self::Resolved(fragment)
    }
}

impl<V: Into<Value>> From<(&str, V)> for Expr {
    fn from((key, value): (&str, V)) -> Self {
        Self::filter(key, value)
    }
}

impl<K: AsRef<str>, V: Into<Value>> From<BTreeMap<K, V>> for Expr {
    fn from(map: BTreeMap<K, V>) -> Self {
        Self::and(
            map.into_iter()
                .map(|(k, v)| Self::filter(k.as_ref(), v))
                .collect(),
        )
    }
}

// ── Combinators ────────────────────────────────────────────────────────

fn combine(op: LogicalOp, lhs: Expr, rhs: Expr) -> Expr {
    let mut children = Vec::with_capacity(2);
    for side in [lhs, rhs] {
        match side {
            Expr::Logical {
                op: inner,
                children: nested,
                not: false,
            } if inner == op => children.extend(nested),
            other => children.push(other),
        }
    }
    Expr::Logical {
        op,
        children,
        not: false,
    }
}

impl ops::BitAnd for Expr {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        combine(LogicalOp::And, self, rhs)
    }
}

impl ops::BitOr for Expr {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        combine(LogicalOp::Or, self, rhs)
    }
}

impl ops::Not for Expr {
    type Output = Self;

    fn not(self) -> Self {
        self.negate()
    }
}

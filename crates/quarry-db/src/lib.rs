//! # quarry-db
//!
//! The query engine: model metadata, field-path resolution, the expression
//! tree, per-dialect SQL compilation and row hydration.
//!
//! ## Architecture
//!
//! Query sets are lazy. A [`QuerySet`](query::QuerySet) accumulates a frozen
//! `QuerySpec` through method chaining; a terminal call hands it to the
//! [`Compiler`](query::Compiler), which resolves every clause through one
//! [`ExprContext`](query::expressions::ExprContext) (sharing aliases and
//! joins), rebinds placeholders for the driver, and runs the statement on
//! a [`DbExecutor`](executor::DbExecutor). SELECT results are rebuilt into
//! object graphs by the [`RowPlan`](query::RowPlan) hydrator.
//!
//! ## Module Overview
//!
//! - [`model`] - The [`Model`](model::Model) / [`Instance`](model::Instance)
//!   traits and [`ModelMeta`](model::ModelMeta)
//! - [`registry`] - Model registration and reverse-relation derivation
//! - [`fields`] - Field and relation definitions
//! - [`value`] / [`row`] - Backend-agnostic values and result rows
//! - [`driver`] - Dialect identity, quoting and placeholder rebinding
//! - [`executor`] / [`transactions`] - The driver seam and transactions
//! - [`query`] - Walker, expressions, lookups, compiler, hydrator, query sets

#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::result_large_err)]
#![allow(clippy::format_push_string)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
// significant_drop_tightening: false positives with guard-scoped blocks
#![allow(clippy::significant_drop_tightening)]

pub mod driver;
pub mod executor;
pub mod fields;
pub mod model;
pub mod query;
pub mod registry;
pub mod row;
pub mod transactions;
pub mod value;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export the most commonly used types at the crate root.
pub use quarry_core::{QuarryError, QuarryResult};
pub use driver::{Driver, Returning};
pub use executor::{DbExecutor, QueryContext};
pub use fields::{FieldDef, FieldType, Relation, RelationKind, Through, ToManySlot, ToOneSlot};
pub use model::{Instance, Model, ModelDef, ModelMeta};
pub use query::expressions::{q, CastType, Expr};
pub use query::{CompiledQuery, Compiler, ObjectRow, QuerySet};
pub use registry::{ModelRegistry, RegistryBuilder};
pub use row::{FromValue, Row};
pub use transactions::{IsolationLevel, Transaction};
pub use value::Value;

/// Builds a `Vec<Value>` from heterogeneous literals, for raw expression
/// parameters.
///
/// ```
/// use quarry_db::{params, Value};
///
/// assert_eq!(params![2, "x", true], vec![Value::Int(2), Value::from("x"), Value::Bool(true)]);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::value::Value>::new()
    };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::value::Value::from($value)),+]
    };
}

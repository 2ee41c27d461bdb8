//! Query building, compilation, and execution.
//!
//! The pipeline, bottom-up:
//!
//! - [`alias`]: per-compilation table aliases
//! - [`walker`]: dotted field paths to columns and join steps
//! - [`lookups`]: the `field__lookup` comparison registry
//! - [`expressions`]: the expression tree and its resolution context
//! - [`compiler`]: statement assembly per dialect and the transaction slot
//! - [`hydrate`]: flat rows back into object graphs
//! - [`queryset`]: the lazy, immutable query builder

pub mod alias;
pub mod compiler;
pub mod expressions;
pub mod hydrate;
pub mod lookups;
pub mod queryset;
pub mod walker;

pub use compiler::{CompiledQuery, Compiler, Statement};
pub use expressions::{q, Expr, Fragment};
pub use hydrate::{ObjectRow, RowPlan};
pub use lookups::LookupRegistry;
pub use queryset::QuerySet;

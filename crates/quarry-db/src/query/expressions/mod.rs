//! Query expressions.
//!
//! - [`core`]: the [`Expr`] tree, [`Fragment`], and the logical combinators
//! - [`context`]: per-compilation resolution state and the [`Engine`]
//!   registries
//! - [`raw`]: raw SQL templates with field and parameter references
//! - [`functions`]: the SQL function registry and builders
//! - [`cast`]: portable cast types and per-dialect templates

pub mod cast;
pub mod context;
pub mod core;
pub mod functions;
pub mod raw;

pub use self::cast::{CastRegistry, CastTemplate, CastType};
pub use self::context::{Clause, Engine, ExprContext, TableColumn};
pub use self::core::{q, split_lookup, Expr, Fragment, LogicalOp};
pub use self::functions::FunctionRegistry;
pub use self::raw::RawTemplate;

//! # quarry-macros
//!
//! Procedural macros for quarry. `#[derive(Model)]` generates the
//! `Instance` and `Model` implementations the query engine needs, so a
//! plain struct can be registered and queried.
//!
//! This crate cannot depend on `quarry-db` (proc-macro crates cannot depend
//! on crates that use them); generated code names `::quarry_db` unless
//! `#[model(crate = "...")]` says otherwise.
//!
//! ```ignore
//! use quarry_macros::Model;
//!
//! #[derive(Debug, Clone, Default, Model)]
//! #[model(table = "todos")]
//! pub struct Todo {
//!     #[field(primary_key, name = "ID")]
//!     pub id: i64,
//!     pub title: String,
//!     #[field(foreign_key = "User", null)]
//!     pub user: Option<Box<User>>,
//! }
//! ```

mod model;
mod types;

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

/// Derives `quarry_db::model::Instance` and `quarry_db::model::Model`.
///
/// Struct attributes go in `#[model(...)]`, field attributes in
/// `#[field(...)]`; see the crate docs for the example.
#[proc_macro_derive(Model, attributes(model, field))]
pub fn derive_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    model::derive_model_impl(input).into()
}

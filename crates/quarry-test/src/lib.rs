//! # quarry-test
//!
//! Testing utilities for quarry. Provides an in-memory SQLite database that
//! creates tables from registered model metadata and counts the statements
//! it runs, plus assertion helpers built on that counter.
//!
//! ## Modules
//!
//! - [`test_database`] - [`TestDatabase`] and schema setup
//! - [`assert_queries`] - Statement-count assertions
//! - [`fixtures`] - Compilers over a fresh fixture schema

#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]

#[cfg(feature = "sqlite")]
pub mod assert_queries;
#[cfg(feature = "sqlite")]
pub mod fixtures;
#[cfg(feature = "sqlite")]
pub mod test_database;

#[cfg(feature = "sqlite")]
pub use assert_queries::{assert_max_queries, assert_num_queries};
#[cfg(feature = "sqlite")]
pub use test_database::TestDatabase;

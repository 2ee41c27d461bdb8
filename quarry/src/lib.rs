//! # quarry
//!
//! A composable query-set expression engine for Rust.
//!
//! This is the meta-crate that re-exports all sub-crates for convenient access.
//! You can depend on `quarry` to get the whole toolkit, or depend on
//! individual crates for finer-grained control.
//!
//! ## Quick start
//!
//! ```ignore
//! use quarry::prelude::*;
//!
//! #[derive(Debug, Clone, Default, Model)]
//! #[model(crate = "quarry::db")]
//! struct Todo {
//!     #[field(primary_key, name = "ID")]
//!     id: i64,
//!     title: String,
//! }
//!
//! # async fn demo() -> QuarryResult<()> {
//! let settings = quarry::core::settings_loader::from_toml_file("quarry.toml")?;
//! let mut builder = ModelRegistry::builder();
//! builder.register::<Todo>();
//! let compiler = quarry::connect(&settings, Arc::new(builder.build()?))?;
//! let open = compiler
//!     .objects::<Todo>()
//!     .filter(("Title__icontains", "milk"))
//!     .all()
//!     .await?;
//! # Ok(())
//! # }
//! ```

/// Core types, settings, logging and error types.
pub use quarry_core as core;

/// Procedural macros: `#[derive(Model)]`.
#[cfg(feature = "macros")]
pub use quarry_macros as macros;

/// The query engine: models, expressions, compiler and query sets.
#[cfg(feature = "db")]
pub use quarry_db as db;

/// Database backends.
pub use quarry_db_backends as db_backends;

/// Testing utilities.
#[cfg(feature = "testing")]
pub use quarry_test as test;

#[cfg(feature = "macros")]
pub use quarry_macros::Model;

#[cfg(feature = "db")]
use std::sync::Arc;

/// Builds a compiler for the `default` database in `settings`, connecting
/// through the backends compiled into this build.
///
/// # Errors
///
/// [`QuarryError::NoDatabase`](quarry_core::QuarryError::NoDatabase) without
/// a `default` database, and whatever the backend reports while opening it.
#[cfg(feature = "db")]
pub fn connect(
    settings: &quarry_core::Settings,
    registry: Arc<quarry_db::ModelRegistry>,
) -> quarry_core::QuarryResult<Arc<quarry_db::Compiler>> {
    quarry_db::Compiler::from_settings(settings, registry, quarry_db_backends::connect)
}

/// The types most programs need.
pub mod prelude {
    pub use std::sync::Arc;

    pub use async_trait::async_trait;
    pub use indexmap::IndexMap;

    pub use quarry_core::{QuarryError, QuarryResult, Settings};

    #[cfg(feature = "db")]
    pub use quarry_db::{
        params, Compiler, DbExecutor, Expr, Instance, Model, ModelRegistry, QuerySet, Value,
    };

    #[cfg(feature = "macros")]
    pub use quarry_macros::Model;
}

#[cfg(all(test, feature = "db", feature = "sqlite"))]
mod tests {
    use super::*;
    use quarry_core::{DatabaseSettings, QuarryError, Settings};
    use quarry_db::testing::{self, Todo};

    #[tokio::test]
    async fn test_connect_default_sqlite() {
        let compiler = connect(&Settings::default(), Arc::new(testing::registry())).unwrap();
        assert_eq!(compiler.driver(), quarry_db::Driver::Sqlite);
        let (sql, _) = compiler.objects::<Todo>().to_sql().unwrap();
        assert!(sql.starts_with("SELECT"), "{sql}");
    }

    #[test]
    fn test_connect_unknown_engine() {
        let mut settings = Settings::default();
        settings.databases.insert(
            "default".to_string(),
            DatabaseSettings {
                engine: "oracle".to_string(),
                ..DatabaseSettings::default()
            },
        );
        let err = connect(&settings, Arc::new(testing::registry())).unwrap_err();
        assert!(matches!(err, QuarryError::UnknownDriver(_)), "{err:?}");
    }
}

//! # quarry-db-backends
//!
//! Concrete [`DbExecutor`] implementations for the quarry query engine.
//!
//! Supported backends:
//! - `SQLite` (feature `sqlite`, on by default)
//!
//! [`connect`] opens the backend named by a [`DatabaseSettings`] entry, which
//! is the connector [`Compiler::from_settings`](quarry_db::Compiler::from_settings)
//! expects.

use std::sync::Arc;

use quarry_core::{DatabaseSettings, QuarryError, QuarryResult};
use quarry_db::driver::Driver;
use quarry_db::executor::DbExecutor;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

/// Opens the database described by `settings`.
///
/// # Errors
///
/// - [`QuarryError::UnknownDriver`] if the engine name is not recognised.
/// - [`QuarryError::ConfigurationError`] if the engine is known but its
///   backend is not compiled in.
/// - [`QuarryError::DatabaseError`] if the connection cannot be opened.
pub fn connect(settings: &DatabaseSettings) -> QuarryResult<Arc<dyn DbExecutor>> {
    let driver: Driver = settings.engine.parse()?;
    tracing::debug!(engine = %driver, name = %settings.name, "connecting");
    match driver {
        #[cfg(feature = "sqlite")]
        Driver::Sqlite => Ok(Arc::new(SqliteBackend::open(&settings.name)?)),
        other => Err(QuarryError::ConfigurationError(format!(
            "no backend compiled in for engine `{other}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_unknown_engine() {
        let settings = DatabaseSettings {
            engine: "oracle".to_string(),
            ..DatabaseSettings::default()
        };
        assert!(matches!(connect(&settings), Err(QuarryError::UnknownDriver(_))));
    }

    #[test]
    fn test_connect_engine_without_backend() {
        let settings = DatabaseSettings {
            engine: "postgres".to_string(),
            ..DatabaseSettings::default()
        };
        assert!(matches!(connect(&settings), Err(QuarryError::ConfigurationError(_))));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_connect_sqlite_memory() {
        let db = connect(&DatabaseSettings::default()).unwrap();
        assert_eq!(db.driver(), Driver::Sqlite);
        let row = db.query_row("SELECT 1 AS one", &[]).await.unwrap();
        assert_eq!(row.get::<i64>("one").unwrap(), 1);
    }
}

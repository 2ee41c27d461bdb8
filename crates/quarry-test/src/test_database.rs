//! Test database utilities for quarry.
//!
//! Provides [`TestDatabase`], an in-memory SQLite database wrapper for use in
//! tests. It implements [`DbExecutor`] so it can back a
//! [`Compiler`](quarry_db::query::Compiler) directly, and adds helpers for
//! creating tables from registered model metadata and counting executed
//! statements.
//!
//! ## Example
//!
//! ```rust,no_run
//! use quarry_test::test_database::TestDatabase;
//!
//! async fn example() {
//!     let db = TestDatabase::new();
//!     db.execute_raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
//!         .await
//!         .unwrap();
//! }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use quarry_core::QuarryResult;
use quarry_db::driver::Driver;
use quarry_db::fields::FieldType;
use quarry_db::model::ModelMeta;
use quarry_db::registry::ModelRegistry;
use quarry_db::row::Row;
use quarry_db::value::Value;
use quarry_db::DbExecutor;
use quarry_db_backends::sqlite::SqliteBackend;

/// An in-memory SQLite database for testing.
///
/// Cloning shares both the connection and the statement counter, so a clone
/// handed to a compiler is counted together with the original.
#[derive(Clone, Debug)]
pub struct TestDatabase {
    backend: SqliteBackend,
    query_count: Arc<AtomicUsize>,
}

impl TestDatabase {
    /// Creates a new in-memory SQLite test database.
    ///
    /// # Panics
    ///
    /// Panics if the in-memory database cannot be created.
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::try_new().expect("Failed to create in-memory SQLite database")
    }

    /// Creates a new in-memory SQLite test database, reporting failures.
    pub fn try_new() -> QuarryResult<Self> {
        Ok(Self {
            backend: SqliteBackend::memory()?,
            query_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Wraps the database in the shared handle a compiler expects.
    pub fn shared(&self) -> Arc<dyn DbExecutor> {
        Arc::new(self.clone())
    }

    /// Creates the table described by `meta`.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL execution fails.
    pub async fn setup_table(&self, meta: &ModelMeta) -> QuarryResult<()> {
        let sql = Self::create_table_sql(meta);
        self.execute_raw(&sql).await?;
        Ok(())
    }

    /// Creates a table for every model in `registry`.
    ///
    /// # Errors
    ///
    /// Returns the first failing `CREATE TABLE`.
    pub async fn setup_registry(&self, registry: &ModelRegistry) -> QuarryResult<()> {
        for meta in registry.models() {
            self.setup_table(meta).await?;
        }
        tracing::debug!(tables = registry.models().count(), "test schema created");
        Ok(())
    }

    /// Drops all user-created tables in the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL execution fails.
    pub async fn teardown(&self) -> QuarryResult<()> {
        let rows = self
            .backend
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                &[],
            )
            .await?;

        for row in &rows {
            let table_name: String = row.get("name")?;
            self.backend
                .execute(&format!("DROP TABLE IF EXISTS {}", Driver::Sqlite.quote(&table_name)), &[])
                .await?;
        }
        Ok(())
    }

    /// Executes a raw SQL string with no parameters.
    ///
    /// Increments the query counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL execution fails.
    pub async fn execute_raw(&self, sql: &str) -> QuarryResult<u64> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.backend.execute(sql, &[]).await
    }

    /// Returns the current query count.
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::Relaxed)
    }

    /// Resets the query counter to zero.
    pub fn reset_query_count(&self) {
        self.query_count.store(0, Ordering::Relaxed);
    }

    /// Returns a reference to the inner `SqliteBackend`.
    pub const fn backend(&self) -> &SqliteBackend {
        &self.backend
    }

    /// Generates a `CREATE TABLE IF NOT EXISTS` statement for the concrete
    /// fields of `meta`.
    pub fn create_table_sql(meta: &ModelMeta) -> String {
        let mut col_defs: Vec<String> = Vec::new();

        for field in meta.concrete_fields() {
            let type_str = match &field.field_type {
                FieldType::AutoField
                | FieldType::BigAutoField
                | FieldType::IntegerField
                | FieldType::BigIntegerField
                | FieldType::SmallIntegerField
                | FieldType::BooleanField => "INTEGER",
                FieldType::FloatField | FieldType::DecimalField { .. } => "REAL",
                FieldType::BinaryField => "BLOB",
                _ => "TEXT",
            };

            let mut parts = vec![format!("{} {type_str}", Driver::Sqlite.quote(field.column_name()))];

            if field.primary_key {
                parts.push("PRIMARY KEY".to_string());
                if matches!(
                    field.field_type,
                    FieldType::AutoField | FieldType::BigAutoField
                ) {
                    parts.push("AUTOINCREMENT".to_string());
                }
            } else if !field.null {
                parts.push("NOT NULL".to_string());
            }

            col_defs.push(parts.join(" "));
        }

        let body = col_defs.join(", ");
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({body})",
            Driver::Sqlite.quote(&meta.table)
        )
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DbExecutor for TestDatabase {
    fn driver(&self) -> Driver {
        Driver::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> QuarryResult<u64> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.backend.execute(sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Row>> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.backend.query(sql, params).await
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> QuarryResult<Value> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.backend.insert_returning_id(sql, params).await
    }
}

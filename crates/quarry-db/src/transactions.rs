//! Transaction support.
//!
//! A [`Transaction`] wraps the [`DbExecutor`] it was opened on and is itself a
//! [`DbExecutor`], so every statement a compiled query issues while the
//! transaction is active runs through it. The compiler holds at most one
//! transaction at a time; see
//! [`Compiler::start_transaction`](crate::query::compiler::Compiler::start_transaction).
//!
//! Statements are issued on the wrapped connection, so `BEGIN`/`COMMIT`
//! bracket exactly the work sent through the wrapper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quarry_core::{QuarryError, QuarryResult};

use crate::driver::Driver;
use crate::executor::DbExecutor;
use crate::row::Row;
use crate::value::Value;

/// Transaction isolation levels supported by the major database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// READ UNCOMMITTED - lowest isolation level.
    ReadUncommitted,
    /// READ COMMITTED - prevents dirty reads. PostgreSQL default.
    ReadCommitted,
    /// REPEATABLE READ - prevents non-repeatable reads. MySQL default.
    RepeatableRead,
    /// SERIALIZABLE - strictest isolation level.
    Serializable,
}

impl IsolationLevel {
    /// Returns the SQL syntax for this isolation level.
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    /// Returns the statement selecting this level on `driver`.
    pub fn set_sql(self, driver: Driver) -> String {
        match driver {
            // SQLite has no SET TRANSACTION; only dirty reads are tunable.
            Driver::Sqlite => match self {
                Self::ReadUncommitted => "PRAGMA read_uncommitted = 1".to_string(),
                _ => "PRAGMA read_uncommitted = 0".to_string(),
            },
            Driver::Postgres | Driver::MySql => {
                format!("SET TRANSACTION ISOLATION LEVEL {}", self.as_sql())
            }
        }
    }
}

/// An open transaction on a shared executor.
pub struct Transaction {
    db: Arc<dyn DbExecutor>,
    open: AtomicBool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("driver", &self.db.driver())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Transaction {
    /// Opens a transaction on `db`, optionally at a given isolation level.
    ///
    /// MySQL expects the isolation level before `START TRANSACTION`,
    /// PostgreSQL after `BEGIN`.
    pub async fn begin(
        db: Arc<dyn DbExecutor>,
        isolation: Option<IsolationLevel>,
    ) -> QuarryResult<Arc<Self>> {
        let driver = db.driver();
        match isolation {
            Some(level) if driver == Driver::Postgres => {
                db.begin().await?;
                db.execute(&level.set_sql(driver), &[]).await?;
            }
            Some(level) => {
                db.execute(&level.set_sql(driver), &[]).await?;
                db.begin().await?;
            }
            None => db.begin().await?,
        }
        tracing::debug!(driver = %driver, "transaction started");
        Ok(Arc::new(Self {
            db,
            open: AtomicBool::new(true),
        }))
    }

    /// Returns `true` until the transaction is committed or rolled back.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> QuarryResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(QuarryError::TransactionNil(
                "transaction already committed or rolled back".to_string(),
            ))
        }
    }

    fn close(&self) -> QuarryResult<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            Ok(())
        } else {
            Err(QuarryError::TransactionNil(
                "transaction already committed or rolled back".to_string(),
            ))
        }
    }
}

#[async_trait::async_trait]
impl DbExecutor for Transaction {
    fn driver(&self) -> Driver {
        self.db.driver()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> QuarryResult<u64> {
        self.ensure_open()?;
        self.db.execute(sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Row>> {
        self.ensure_open()?;
        self.db.query(sql, params).await
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> QuarryResult<Value> {
        self.ensure_open()?;
        self.db.insert_returning_id(sql, params).await
    }

    async fn begin(&self) -> QuarryResult<()> {
        Err(QuarryError::TransactionStarted)
    }

    async fn commit(&self) -> QuarryResult<()> {
        self.close()?;
        self.db.commit().await
    }

    async fn rollback(&self) -> QuarryResult<()> {
        self.close()?;
        tracing::warn!(driver = %self.db.driver(), "rolling back transaction");
        self.db.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockExecutor;

    #[test]
    fn test_isolation_sql() {
        assert_eq!(
            IsolationLevel::Serializable.set_sql(Driver::Postgres),
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"
        );
        assert_eq!(
            IsolationLevel::ReadUncommitted.set_sql(Driver::Sqlite),
            "PRAGMA read_uncommitted = 1"
        );
    }

    #[tokio::test]
    async fn test_begin_commit() {
        let db = Arc::new(MockExecutor::new(Driver::Sqlite));
        let tx = Transaction::begin(db.clone(), None).await.unwrap();
        tx.execute("DELETE FROM todos", &[]).await.unwrap();
        tx.commit().await.unwrap();
        assert!(!tx.is_open());
        assert_eq!(db.statements(), vec!["BEGIN", "DELETE FROM todos", "COMMIT"]);
    }

    #[tokio::test]
    async fn test_isolation_order() {
        let db = Arc::new(MockExecutor::new(Driver::Postgres));
        let _tx = Transaction::begin(db.clone(), Some(IsolationLevel::Serializable))
            .await
            .unwrap();
        assert_eq!(
            db.statements(),
            vec!["BEGIN", "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"]
        );

        let db = Arc::new(MockExecutor::new(Driver::MySql));
        let _tx = Transaction::begin(db.clone(), Some(IsolationLevel::ReadCommitted))
            .await
            .unwrap();
        assert_eq!(
            db.statements(),
            vec!["SET TRANSACTION ISOLATION LEVEL READ COMMITTED", "START TRANSACTION"]
        );
    }

    #[tokio::test]
    async fn test_use_after_rollback() {
        let db = Arc::new(MockExecutor::new(Driver::Sqlite));
        let tx = Transaction::begin(db, None).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(matches!(
            tx.execute("SELECT 1", &[]).await,
            Err(QuarryError::TransactionNil(_))
        ));
        assert!(matches!(tx.commit().await, Err(QuarryError::TransactionNil(_))));
    }

    #[tokio::test]
    async fn test_nested_begin_rejected() {
        let db = Arc::new(MockExecutor::new(Driver::Sqlite));
        let tx = Transaction::begin(db, None).await.unwrap();
        assert!(matches!(tx.begin().await, Err(QuarryError::TransactionStarted)));
    }
}

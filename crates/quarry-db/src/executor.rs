//! The driver seam and query cancellation.
//!
//! [`DbExecutor`] is the minimal async surface the engine needs from a
//! connection: run a statement, run a query, report a generated key, and
//! open/close a transaction. Concrete drivers live in `quarry-db-backends`.
//!
//! [`QueryContext`] is the caller-supplied cancellation handle threaded into
//! every compiled query's exec closure.

use std::future::Future;
use std::sync::Arc;

use quarry_core::{QuarryError, QuarryResult};
use tokio::sync::watch;

use crate::driver::Driver;
use crate::row::Row;
use crate::value::Value;

/// Minimal async database executor trait.
///
/// Implementors only need `driver`, `execute`, and `query`; the remaining
/// methods have SQL-level defaults that drivers override when they can do
/// better.
#[async_trait::async_trait]
pub trait DbExecutor: Send + Sync {
    /// The dialect this connection speaks.
    fn driver(&self) -> Driver;

    /// Runs a statement that does not return rows, returning the number of
    /// rows affected.
    async fn execute(&self, sql: &str, params: &[Value]) -> QuarryResult<u64>;

    /// Runs a query and returns all result rows.
    async fn query(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Row>>;

    /// Runs a query expected to return exactly one row.
    async fn query_row(&self, sql: &str, params: &[Value]) -> QuarryResult<Row> {
        let mut rows = self.query(sql, params).await?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            0 => Err(QuarryError::NoRows(sql.to_string())),
            n => Err(QuarryError::MultipleRows(format!("{n} rows for `{sql}`"))),
        }
    }

    /// Executes an INSERT and returns the generated primary key.
    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> QuarryResult<Value> {
        self.execute(sql, params).await?;
        let probe = match self.driver() {
            Driver::Sqlite => "SELECT last_insert_rowid()",
            Driver::MySql => "SELECT LAST_INSERT_ID()",
            Driver::Postgres => "SELECT LASTVAL()",
        };
        let row = self.query_row(probe, &[]).await?;
        row.get_by_index::<Value>(0)
    }

    /// Opens a transaction on this connection.
    async fn begin(&self) -> QuarryResult<()> {
        let sql = match self.driver() {
            Driver::MySql => "START TRANSACTION",
            Driver::Postgres | Driver::Sqlite => "BEGIN",
        };
        self.execute(sql, &[]).await.map(|_| ())
    }

    /// Commits the open transaction.
    async fn commit(&self) -> QuarryResult<()> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    /// Rolls back the open transaction.
    async fn rollback(&self) -> QuarryResult<()> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }
}

/// A cancellation handle for query execution.
///
/// Cloning shares the underlying flag: cancelling any clone cancels all of
/// them. [`QueryContext::run`] races a driver future against cancellation,
/// and the hydrator polls [`QueryContext::is_cancelled`] between rows.
///
/// # Examples
///
/// ```
/// use quarry_db::executor::QueryContext;
///
/// let ctx = QueryContext::background();
/// let handle = ctx.clone();
/// handle.cancel();
/// assert!(ctx.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct QueryContext {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::background()
    }
}

impl QueryContext {
    /// A context that is never cancelled unless [`cancel`](Self::cancel) is
    /// called.
    pub fn background() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { flag: Arc::new(tx) }
    }

    /// Cancels every query running under this context.
    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    /// Returns `true` once cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Fails with [`QuarryError::Cancelled`] if cancelled.
    pub fn check(&self, stage: &str) -> QuarryResult<()> {
        if self.is_cancelled() {
            Err(QuarryError::Cancelled(stage.to_string()))
        } else {
            Ok(())
        }
    }

    /// Resolves when the context is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Runs `fut`, aborting it if the context is cancelled first.
    pub async fn run<T, F>(&self, stage: &str, fut: F) -> QuarryResult<T>
    where
        F: Future<Output = QuarryResult<T>> + Send,
    {
        self.check(stage)?;
        tokio::select! {
            biased;
            () = self.cancelled() => Err(QuarryError::Cancelled(stage.to_string())),
            result = fut => result,
        }
    }
}

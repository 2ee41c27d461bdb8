//! SQLite database backend using `rusqlite`.
//!
//! [`SqliteBackend`] implements [`DbExecutor`] over a single `rusqlite`
//! connection guarded by an async mutex. Every statement runs inside
//! `tokio::task::spawn_blocking` so the runtime is never blocked.
//!
//! Features:
//! - WAL mode by default for file databases
//! - In-memory databases via the `:memory:` path
//! - A `regexp` SQL function backed by the `regex` crate, so the `regex`
//!   and `iregex` lookups work
//! - `RETURNING` on inserts (SQLite 3.35+, bundled)

use std::path::PathBuf;
use std::sync::Arc;

use quarry_core::{QuarryError, QuarryResult};
use quarry_db::driver::Driver;
use quarry_db::executor::DbExecutor;
use quarry_db::row::Row;
use quarry_db::value::Value;
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use tokio::sync::Mutex;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A SQLite database backend.
///
/// Cloning is cheap and shares the connection.
#[derive(Clone)]
pub struct SqliteBackend {
    path: PathBuf,
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Opens a database at `path`, `:memory:` for an in-memory one.
    ///
    /// File databases are switched to WAL journaling. Foreign keys are
    /// enforced either way.
    pub fn open(path: impl Into<PathBuf>) -> QuarryResult<Self> {
        let path = path.into();
        let in_memory = path.to_str() == Some(":memory:");
        let conn = if in_memory {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(&path)
        }
        .map_err(|e| QuarryError::DatabaseError(format!("SQLite open failed: {e}")))?;

        let pragmas = if in_memory {
            "PRAGMA foreign_keys=ON;"
        } else {
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;"
        };
        conn.execute_batch(pragmas)
            .map_err(|e| QuarryError::DatabaseError(format!("Failed to set pragmas: {e}")))?;
        register_regexp(&conn)?;

        tracing::debug!(path = %path.display(), "opened sqlite database");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database.
    pub fn memory() -> QuarryResult<Self> {
        Self::open(":memory:")
    }

    /// The database file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Runs a batch of `;`-separated statements, typically schema DDL.
    pub async fn execute_batch(&self, sql: &str) -> QuarryResult<()> {
        let sql = sql.to_string();
        self.blocking(move |conn| conn.execute_batch(&sql).map_err(db_error))
            .await
    }

    async fn blocking<T, F>(&self, f: F) -> QuarryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> QuarryResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| QuarryError::DatabaseError(format!("Task join error: {e}")))?
    }

    fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> QuarryResult<()> {
        for (i, param) in params.iter().enumerate() {
            let idx = i + 1;
            match param {
                Value::Null => stmt.raw_bind_parameter(idx, rusqlite::types::Null),
                Value::Bool(b) => stmt.raw_bind_parameter(idx, b),
                Value::Int(v) => stmt.raw_bind_parameter(idx, v),
                Value::Float(v) => stmt.raw_bind_parameter(idx, v),
                Value::String(s) => stmt.raw_bind_parameter(idx, s.as_str()),
                Value::Bytes(b) => stmt.raw_bind_parameter(idx, b.as_slice()),
                Value::Date(d) => stmt.raw_bind_parameter(idx, d.to_string()),
                Value::DateTime(dt) => stmt.raw_bind_parameter(idx, dt.to_string()),
                Value::DateTimeTz(dt) => stmt.raw_bind_parameter(idx, dt.to_rfc3339()),
                Value::Time(t) => stmt.raw_bind_parameter(idx, t.to_string()),
                Value::Uuid(u) => stmt.raw_bind_parameter(idx, u.to_string()),
                Value::Json(j) => stmt.raw_bind_parameter(idx, j.to_string()),
                Value::List(vals) => {
                    let json = serde_json::to_string(vals).map_err(|e| {
                        QuarryError::TypeMismatch(format!("cannot bind list parameter: {e}"))
                    })?;
                    stmt.raw_bind_parameter(idx, json)
                }
            }
            .map_err(|e| QuarryError::DatabaseError(format!("Bind error: {e}")))?;
        }
        Ok(())
    }

    fn convert_row(sqlite_row: &rusqlite::Row<'_>, column_names: &[String]) -> Row {
        let values = (0..column_names.len())
            .map(|i| match sqlite_row.get_ref(i).unwrap_or(ValueRef::Null) {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => Value::Int(v),
                ValueRef::Real(v) => Value::Float(v),
                ValueRef::Text(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
                ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
            })
            .collect();
        Row::new(column_names.to_vec(), values)
    }
}

fn db_error(e: rusqlite::Error) -> QuarryError {
    QuarryError::DatabaseError(e.to_string())
}

/// Installs `regexp(pattern, text)`, which SQLite calls for `text REGEXP
/// pattern`. Compiled patterns are cached per statement.
fn register_regexp(conn: &rusqlite::Connection) -> QuarryResult<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let re: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> Result<_, BoxError> {
                Ok(Regex::new(vr.as_str()?)?)
            })?;
            match ctx.get_raw(1) {
                ValueRef::Null => Ok(None),
                text => {
                    let text = text
                        .as_str()
                        .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
                    Ok(Some(re.is_match(text)))
                }
            }
        },
    )
    .map_err(|e| QuarryError::DatabaseError(format!("Failed to register regexp: {e}")))
}

#[async_trait::async_trait]
impl DbExecutor for SqliteBackend {
    fn driver(&self) -> Driver {
        Driver::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> QuarryResult<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(db_error)?;
            Self::bind_params(&mut stmt, &params)?;
            let count = stmt.raw_execute().map_err(db_error)?;
            Ok(count as u64)
        })
        .await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(db_error)?;
            let column_names: Vec<String> =
                stmt.column_names().into_iter().map(String::from).collect();
            Self::bind_params(&mut stmt, &params)?;

            let mut raw_rows = stmt.raw_query();
            let mut rows = Vec::new();
            while let Some(row) = raw_rows.next().map_err(db_error)? {
                rows.push(Self::convert_row(row, &column_names));
            }
            Ok(rows)
        })
        .await
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> QuarryResult<Value> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(db_error)?;
            Self::bind_params(&mut stmt, &params)?;
            stmt.raw_execute().map_err(db_error)?;
            Ok(Value::Int(conn.last_insert_rowid()))
        })
        .await
    }
}

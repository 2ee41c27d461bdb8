//! Query counting assertions for database tests.
//!
//! Provides [`assert_num_queries`] which counts the statements executed
//! during an async closure and asserts that the count matches an expected
//! value. Useful for checking that nested selects load an object graph in
//! one query instead of one per relation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use quarry_test::assert_queries::assert_num_queries;
//! use quarry_test::test_database::TestDatabase;
//! use quarry_db::{DbExecutor, Value};
//!
//! async fn example() {
//!     let db = TestDatabase::new();
//!     db.execute_raw("CREATE TABLE t (id INTEGER PRIMARY KEY, val TEXT)")
//!         .await
//!         .unwrap();
//!
//!     assert_num_queries(&db, 1, || async {
//!         db.execute("INSERT INTO t (val) VALUES (?)", &[Value::from("x")])
//!             .await
//!             .unwrap();
//!     })
//!     .await;
//! }
//! ```

use std::future::Future;

use crate::test_database::TestDatabase;

/// Asserts that exactly `expected_count` statements are executed during the
/// async closure.
///
/// # Panics
///
/// Panics if the number of statements does not match `expected_count`.
pub async fn assert_num_queries<F, Fut>(db: &TestDatabase, expected_count: usize, f: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    db.reset_query_count();
    f().await;
    let actual = db.query_count();
    assert_eq!(
        actual, expected_count,
        "Expected {expected_count} SQL queries, but {actual} were executed"
    );
}

/// Asserts that at most `max_count` statements are executed during the async
/// closure.
///
/// # Panics
///
/// Panics if more than `max_count` statements are executed.
pub async fn assert_max_queries<F, Fut>(db: &TestDatabase, max_count: usize, f: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    db.reset_query_count();
    f().await;
    let actual = db.query_count();
    assert!(
        actual <= max_count,
        "Expected at most {max_count} SQL queries, but {actual} were executed"
    );
}

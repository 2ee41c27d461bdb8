//! Lazy, immutable query sets.
//!
//! A [`QuerySet`] describes a query over one model. Builder methods take
//! `&self` and return a new query set, so a base query can be shared and
//! refined from many places (and threads) without synchronisation. Nothing
//! touches the database until a terminal method (`all`, `get`, `count`,
//! `update`, ...) compiles the accumulated `QuerySpec` and runs it.
//!
//! # Examples
//!
//! ```ignore
//! use quarry_db::query::compiler::Compiler;
//! use quarry_db::query::expressions::Expr;
//! use quarry_db::testing::Todo;
//! # async fn demo(compiler: std::sync::Arc<Compiler>) -> quarry_core::QuarryResult<()> {
//! let open = compiler.objects::<Todo>().filter(("Done", false));
//! let mine = open.filter(("User.Name__iexact", "ann")).order_by(&["-ID"]);
//! let todos = mine.all().await?;
//! let n = open.count().await?; // `open` is unchanged by `mine`
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use quarry_core::logging::query_span;
use quarry_core::{QuarryError, QuarryResult};
use tracing::Instrument;

use super::compiler::{CompiledQuery, Compiler};
use super::expressions::Expr;
use super::hydrate::ObjectRow;
use crate::executor::QueryContext;
use crate::model::Model;
use crate::value::Value;

/// The frozen description of a query.
#[derive(Debug, Clone, Default)]
pub(crate) struct QuerySpec {
    pub select: Vec<String>,
    pub filters: Vec<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Vec<Expr>,
    pub order_by: Vec<(Expr, bool)>,
    pub annotations: IndexMap<String, Expr>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
    pub for_update: bool,
    pub explicit_save: bool,
    pub first_only: bool,
}

/// A lazy query over the model `M`.
pub struct QuerySet<M: Model> {
    compiler: Arc<Compiler>,
    spec: QuerySpec,
    ctx: QueryContext,
    latest: Mutex<Option<String>>,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> Clone for QuerySet<M> {
    fn clone(&self) -> Self {
        Self {
            compiler: Arc::clone(&self.compiler),
            spec: self.spec.clone(),
            ctx: self.ctx.clone(),
            latest: Mutex::new(None),
            _model: PhantomData,
        }
    }
}

impl<M: Model> fmt::Debug for QuerySet<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySet")
            .field("model", &std::any::type_name::<M>())
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl<M: Model> QuerySet<M> {
    /// A query selecting every `M`, with the compiler's query defaults.
    pub fn new(compiler: Arc<Compiler>) -> Self {
        let spec = QuerySpec {
            explicit_save: compiler.settings().explicit_save,
            ..QuerySpec::default()
        };
        Self {
            compiler,
            spec,
            ctx: QueryContext::background(),
            latest: Mutex::new(None),
            _model: PhantomData,
        }
    }

    fn with(&self, edit: impl FnOnce(&mut QuerySpec)) -> Self {
        let mut next = self.clone();
        edit(&mut next.spec);
        next
    }

    // ── Builders ───────────────────────────────────────────────────────

    /// Adds paths to the select list. `*` is every column of the model
    /// (`User.*` after a join); a bare relation name selects its key.
    pub fn select(&self, paths: &[&str]) -> Self {
        self.with(|s| s.select.extend(paths.iter().map(|p| (*p).to_string())))
    }

    /// Adds a filter, AND-ed with the others.
    pub fn filter(&self, filter: impl Into<Expr>) -> Self {
        let filter = filter.into();
        self.with(|s| s.filters.push(filter))
    }

    /// Adds a negated filter.
    pub fn exclude(&self, filter: impl Into<Expr>) -> Self {
        let filter = filter.into().negate();
        self.with(|s| s.filters.push(filter))
    }

    /// Orders by paths or annotation names; a leading `-` sorts descending.
    pub fn order_by(&self, paths: &[&str]) -> Self {
        self.with(|s| {
            for path in paths {
                s.order_by.push(match path.strip_prefix('-') {
                    Some(rest) => (Expr::col(rest), true),
                    None => (Expr::col(path), false),
                });
            }
        })
    }

    /// Orders by an arbitrary expression.
    pub fn order_by_expr(&self, expr: Expr, desc: bool) -> Self {
        self.with(|s| s.order_by.push((expr, desc)))
    }

    /// Groups by paths.
    pub fn group_by(&self, paths: &[&str]) -> Self {
        self.with(|s| s.group_by.extend(paths.iter().map(|p| Expr::col(p))))
    }

    /// Adds a `HAVING` condition.
    pub fn having(&self, condition: impl Into<Expr>) -> Self {
        let condition = condition.into();
        self.with(|s| s.having.push(condition))
    }

    /// Selects `expr` under `name`. Filters, ordering and later
    /// annotations can refer to it by name.
    pub fn annotate(&self, name: &str, expr: impl Into<Expr>) -> Self {
        let expr = expr.into();
        self.with(|s| {
            s.annotations.insert(name.to_string(), expr);
        })
    }

    /// Caps the number of rows.
    pub fn limit(&self, n: u64) -> Self {
        self.with(|s| s.limit = Some(n))
    }

    /// Skips rows.
    pub fn offset(&self, n: u64) -> Self {
        self.with(|s| s.offset = Some(n))
    }

    /// `SELECT DISTINCT`.
    pub fn distinct(&self) -> Self {
        self.with(|s| s.distinct = true)
    }

    /// `SELECT ... FOR UPDATE`, on dialects that have it.
    pub fn for_update(&self) -> Self {
        self.with(|s| s.for_update = true)
    }

    /// Makes `update` write only the fields assigned by raw expressions.
    pub fn explicit_save(&self) -> Self {
        self.with(|s| s.explicit_save = true)
    }

    /// Runs terminal calls under `ctx`, so they can be cancelled.
    pub fn context(&self, ctx: QueryContext) -> Self {
        let mut next = self.clone();
        next.ctx = ctx;
        next
    }

    // ── Inspection ─────────────────────────────────────────────────────

    /// The SELECT `all` would run, with its arguments.
    pub fn to_sql(&self) -> QuarryResult<(String, Vec<Value>)> {
        let query = self.compiler.select::<M>(&self.spec)?;
        Ok((query.sql, query.args))
    }

    /// The SQL of the last terminal call on this query set.
    pub fn latest_query(&self) -> Option<String> {
        self.lock_latest().clone()
    }

    fn lock_latest(&self) -> MutexGuard<'_, Option<String>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run<R>(&self, query: CompiledQuery<R>, op: &'static str) -> QuarryResult<R> {
        *self.lock_latest() = Some(query.sql.clone());
        let span = query_span(query.model, op);
        query.exec(&self.ctx).instrument(span).await
    }

    fn pk_order(&self) -> QuarryResult<Expr> {
        let meta = self.compiler.registry().meta_of::<M>()?;
        Ok(Expr::col(meta.primary().name))
    }

    // ── Reads ──────────────────────────────────────────────────────────

    /// Every matching object.
    pub async fn all(&self) -> QuarryResult<Vec<M>> {
        Ok(self.all_rows().await?.into_iter().map(|r| r.object).collect())
    }

    /// Every matching object with its annotation values.
    pub async fn all_rows(&self) -> QuarryResult<Vec<ObjectRow<M>>> {
        let query = self.compiler.select::<M>(&self.spec)?;
        self.run(query, "all").await
    }

    /// The single matching object.
    ///
    /// # Errors
    ///
    /// [`QuarryError::NoRows`] when nothing matches and
    /// [`QuarryError::MultipleRows`] when more than one object does.
    pub async fn get(&self) -> QuarryResult<M> {
        let query = self.compiler.select::<M>(&self.spec)?;
        let model = query.model;
        let mut rows = self.run(query, "get").await?;
        match rows.len() {
            1 => Ok(rows.remove(0).object),
            0 => Err(QuarryError::NoRows(format!("{model} matching query does not exist"))),
            n => Err(QuarryError::MultipleRows(format!("{n} {model} objects returned"))),
        }
    }

    /// The first object by the query's ordering, or by primary key.
    pub async fn first(&self) -> QuarryResult<Option<M>> {
        let mut spec = self.spec.clone();
        if spec.order_by.is_empty() {
            spec.order_by.push((self.pk_order()?, false));
        }
        spec.first_only = true;
        let query = self.compiler.select::<M>(&spec)?;
        Ok(self.run(query, "first").await?.into_iter().next().map(|r| r.object))
    }

    /// The last object by the query's ordering, or by primary key.
    pub async fn last(&self) -> QuarryResult<Option<M>> {
        let mut spec = self.spec.clone();
        if spec.order_by.is_empty() {
            spec.order_by.push((self.pk_order()?, true));
        } else {
            for (_, desc) in &mut spec.order_by {
                *desc = !*desc;
            }
        }
        spec.first_only = true;
        let query = self.compiler.select::<M>(&spec)?;
        Ok(self.run(query, "last").await?.into_iter().next().map(|r| r.object))
    }

    /// The number of matching objects.
    pub async fn count(&self) -> QuarryResult<i64> {
        let query = self.compiler.count::<M>(&self.spec)?;
        self.run(query, "count").await
    }

    /// Whether anything matches.
    pub async fn exists(&self) -> QuarryResult<bool> {
        let query = self.compiler.exists::<M>(&self.spec)?;
        self.run(query, "exists").await
    }

    /// One positional row per match; items are paths or expressions.
    pub async fn values_list<I, E>(&self, items: I) -> QuarryResult<Vec<Vec<Value>>>
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr>,
    {
        let items = items.into_iter().map(|e| (None, e.into())).collect();
        let query = self.compiler.select_exprs::<M>(&self.spec, items, false)?;
        let rows = self.run(query, "values_list").await?;
        Ok(rows.into_iter().map(crate::row::Row::into_values).collect())
    }

    /// One map per match, keyed by the requested paths.
    pub async fn values(&self, paths: &[&str]) -> QuarryResult<Vec<IndexMap<String, Value>>> {
        let items = paths
            .iter()
            .map(|p| (Some((*p).to_string()), Expr::col(p)))
            .collect();
        let query = self.compiler.select_exprs::<M>(&self.spec, items, false)?;
        let rows = self.run(query, "values").await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                paths
                    .iter()
                    .map(|p| (*p).to_string())
                    .zip(row.into_values())
                    .collect()
            })
            .collect())
    }

    /// Evaluates aggregate expressions over the matching rows.
    ///
    /// Without `group_by`, PostgreSQL and MySQL reject a plain column next to
    /// aggregates; this fails early with [`QuarryError::InvalidExpression`].
    ///
    /// ```ignore
    /// # use indexmap::IndexMap;
    /// # use quarry_db::query::expressions::{functions::count_of, Expr};
    /// # async fn demo(books: quarry_db::query::QuerySet<quarry_db::testing::Book>) -> quarry_core::QuarryResult<()> {
    /// let mut spec = IndexMap::new();
    /// spec.insert("Author".to_string(), Expr::raw_fields("%s", &["Author.Name"])?);
    /// spec.insert("CountBooks".to_string(), count_of(None));
    /// let totals = books.filter(("Author.Name", "Rowling")).group_by(&["Author.Name"]).aggregate(spec).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn aggregate(&self, spec: IndexMap<String, Expr>) -> QuarryResult<IndexMap<String, Value>> {
        let names: Vec<String> = spec.keys().cloned().collect();
        let items = spec.into_iter().map(|(name, expr)| (Some(name), expr)).collect();
        let query = self.compiler.select_exprs::<M>(&self.spec, items, true)?;
        let rows = self.run(query, "aggregate").await?;
        let values = rows
            .into_iter()
            .next()
            .map(crate::row::Row::into_values)
            .unwrap_or_default();
        let mut values = values.into_iter();
        Ok(names
            .into_iter()
            .map(|name| (name, values.next().unwrap_or(Value::Null)))
            .collect())
    }

    // ── Writes ─────────────────────────────────────────────────────────

    /// Inserts `object` and returns it with generated values filled in.
    pub async fn create(&self, object: &M) -> QuarryResult<M> {
        let query = self.compiler.insert(object)?;
        self.run(query, "create").await
    }

    /// The single matching object, or `defaults` freshly inserted. The flag
    /// is `true` when an insert happened.
    pub async fn get_or_create(&self, defaults: &M) -> QuarryResult<(M, bool)> {
        match self.get().await {
            Ok(found) => Ok((found, false)),
            Err(QuarryError::NoRows(_)) => Ok((self.create(defaults).await?, true)),
            Err(e) => Err(e),
        }
    }

    /// Updates the rows matching the filters (and `object`'s primary key
    /// when set). Without [`explicit_save`](Self::explicit_save) the
    /// selected fields, or every field, are written from `object`; `exprs`
    /// are raw assignments built with [`Expr::update`].
    pub async fn update(&self, object: &M, exprs: Vec<Expr>) -> QuarryResult<u64> {
        let query = self
            .compiler
            .update(&self.spec, std::slice::from_ref(object), &exprs)?;
        self.run(query, "update").await
    }

    /// Runs one update per object, in order.
    pub async fn bulk_update(&self, objects: &[M], exprs: Vec<Expr>) -> QuarryResult<u64> {
        if objects.is_empty() {
            return Ok(0);
        }
        let query = self.compiler.update(&self.spec, objects, &exprs)?;
        self.run(query, "bulk_update").await
    }

    /// Deletes every matching row.
    pub async fn delete(&self) -> QuarryResult<u64> {
        let query = self.compiler.delete::<M>(&self.spec)?;
        self.run(query, "delete").await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::driver::Driver;
    use crate::query::expressions::functions::{count_of, upper};
    use crate::testing::{self, row, MockExecutor, Todo};

    fn objects(driver: Driver) -> (Arc<MockExecutor>, QuerySet<Todo>) {
        let mock = MockExecutor::shared(driver);
        let compiler = Compiler::new(mock.clone(), Arc::new(testing::registry()));
        (mock, compiler.objects::<Todo>())
    }

    fn todo_row(id: i64, title: &str) -> crate::row::Row {
        row(
            &["id", "title", "done", "user_id"],
            vec![id.into(), title.into(), false.into(), Value::Null],
        )
    }

    #[test]
    fn test_builders_leave_source_untouched() {
        let (_, base) = objects(Driver::Sqlite);
        let before = base.to_sql().unwrap();
        let narrowed = base.filter(("Done", true)).order_by(&["-ID"]).limit(3);
        assert_eq!(base.to_sql().unwrap(), before);
        assert_ne!(narrowed.to_sql().unwrap(), before);
    }

    #[test]
    fn test_exclude_negates() {
        let (_, qs) = objects(Driver::Sqlite);
        let (sql, _) = qs.select(&["ID"]).exclude(("Done", true)).to_sql().unwrap();
        assert_eq!(sql, r#"SELECT "todos"."id" FROM "todos" WHERE NOT ("todos"."done" = ?)"#);
    }

    #[test]
    fn test_map_filter() {
        let (_, qs) = objects(Driver::Postgres);
        let mut map = BTreeMap::new();
        map.insert("Done", Value::Bool(false));
        map.insert("Title__startswith", Value::from("a"));
        let (sql, args) = qs.select(&["ID"]).filter(map).to_sql().unwrap();
        assert_eq!(
            sql,
            r#"SELECT "todos"."id" FROM "todos" WHERE ("todos"."done" = $1 AND "todos"."title" LIKE $2)"#
        );
        assert_eq!(args, vec![Value::Bool(false), Value::from("a%")]);
    }

    #[test]
    fn test_or_group() {
        let (_, qs) = objects(Driver::Sqlite);
        let (sql, _) = qs
            .select(&["ID"])
            .filter(Expr::filter("ID__lt", 3) | Expr::filter("ID__gt", 9))
            .filter(("Done", false))
            .to_sql()
            .unwrap();
        assert_eq!(
            sql,
            r#"SELECT "todos"."id" FROM "todos" WHERE (("todos"."id" < ? OR "todos"."id" > ?) AND "todos"."done" = ?)"#
        );
    }

    #[test]
    fn test_group_by_having() {
        let (_, qs) = objects(Driver::Sqlite);
        let (sql, args) = qs
            .select(&["User"])
            .annotate("N", count_of(None))
            .group_by(&["User"])
            .having(Expr::filter_expr("N__gt", Expr::value(1)))
            .to_sql()
            .unwrap();
        assert_eq!(
            sql,
            r#"SELECT "todos"."user_id", COUNT(*) AS "N" FROM "todos" GROUP BY "todos"."user_id" HAVING COUNT(*) > ?"#
        );
        assert_eq!(args, vec![Value::Int(1)]);
    }

    #[tokio::test]
    async fn test_get_arity() {
        let (mock, qs) = objects(Driver::Sqlite);
        mock.push_rows(vec![]);
        assert!(matches!(qs.get().await, Err(QuarryError::NoRows(_))));
        mock.push_rows(vec![todo_row(1, "a"), todo_row(2, "b")]);
        assert!(matches!(qs.get().await, Err(QuarryError::MultipleRows(_))));
        mock.push_rows(vec![todo_row(1, "a")]);
        assert_eq!(qs.get().await.unwrap().title, "a");
    }

    #[tokio::test]
    async fn test_first_and_last_order_by_pk() {
        let (mock, qs) = objects(Driver::Sqlite);
        mock.push_rows(vec![todo_row(1, "a")]);
        assert_eq!(qs.select(&["*"]).first().await.unwrap().map(|t| t.id), Some(1));
        assert!(qs.last().await.unwrap().is_none());
        let statements = mock.statements();
        assert!(statements[0].ends_with(r#"ORDER BY "todos"."id" LIMIT ?"#));
        assert!(statements[1].ends_with(r#"ORDER BY "todos"."id" DESC LIMIT ?"#));
    }

    #[tokio::test]
    async fn test_last_flips_ordering() {
        let (mock, qs) = objects(Driver::Sqlite);
        qs.order_by(&["-Title", "ID"]).last().await.unwrap();
        assert!(mock.statements()[0]
            .ends_with(r#"ORDER BY "todos"."title", "todos"."id" DESC LIMIT ?"#));
    }

    #[tokio::test]
    async fn test_first_without_limit_over_to_many_join() {
        let (mock, qs) = objects(Driver::Sqlite);
        qs.select(&["*", "Tags.*"]).first().await.unwrap();
        assert!(!mock.statements()[0].contains("LIMIT"));
    }

    #[tokio::test]
    async fn test_values_and_values_list() {
        let (mock, qs) = objects(Driver::Postgres);
        mock.push_rows(vec![row(&["Title", "User.Name"], vec!["a".into(), "ann".into()])]);
        let maps = qs.values(&["Title", "User.Name"]).await.unwrap();
        assert_eq!(maps[0].get("User.Name"), Some(&Value::from("ann")));
        assert_eq!(
            qs.latest_query().unwrap(),
            r#"SELECT "todos"."title" AS "Title", "users"."name" AS "User.Name" FROM "todos" LEFT JOIN "users" ON "users"."id" = "todos"."user_id""#
        );

        mock.push_rows(vec![row(&["a", "b"], vec![1.into(), "A".into()])]);
        let lists = qs
            .values_list(vec![Expr::col("ID"), upper(Expr::col("Title"))])
            .await
            .unwrap();
        assert_eq!(lists, vec![vec![Value::Int(1), Value::from("A")]]);
    }

    #[tokio::test]
    async fn test_get_or_create() {
        let (mock, qs) = objects(Driver::Postgres);
        let filtered = qs.filter(("Title", "T1"));
        mock.push_rows(vec![]);
        mock.push_rows(vec![todo_row(5, "T1")]);
        let defaults = Todo {
            title: "T1".into(),
            ..Todo::default()
        };
        let (todo, created) = filtered.get_or_create(&defaults).await.unwrap();
        assert!(created);
        assert_eq!(todo.id, 5);

        mock.push_rows(vec![todo_row(5, "T1")]);
        let (_, created) = filtered.get_or_create(&defaults).await.unwrap();
        assert!(!created);
    }

    #[tokio::test]
    async fn test_annotations_returned_with_rows() {
        let (mock, qs) = objects(Driver::Sqlite);
        mock.push_rows(vec![row(&["id", "Shout"], vec![1.into(), "A".into()])]);
        let rows = qs
            .select(&["ID"])
            .annotate("Shout", upper(Expr::col("Title")))
            .all_rows()
            .await
            .unwrap();
        assert_eq!(rows[0].annotations.get("Shout"), Some(&Value::from("A")));
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let (mock, qs) = objects(Driver::Sqlite);
        let ctx = QueryContext::background();
        ctx.cancel();
        let err = qs.context(ctx).all().await.unwrap_err();
        assert!(matches!(err, QuarryError::Cancelled(_)));
        assert!(mock.statements().is_empty());
    }

    #[tokio::test]
    async fn test_clone_has_own_latest_query() {
        let (_, qs) = objects(Driver::Sqlite);
        qs.count().await.unwrap();
        assert!(qs.latest_query().is_some());
        assert!(qs.clone().latest_query().is_none());
    }

    #[test]
    fn test_unknown_field_is_reported() {
        let (_, qs) = objects(Driver::Sqlite);
        let err = qs.filter(("Nope", 1)).to_sql().unwrap_err();
        assert!(matches!(err, QuarryError::FieldNotFound(ref f) if f.contains("Nope")));
    }

    #[test]
    fn test_unsupported_lookup_is_reported() {
        let (_, qs) = objects(Driver::Sqlite);
        let err = qs.filter(("Title__sounds_like", "x")).to_sql().unwrap_err();
        assert!(matches!(err, QuarryError::UnsupportedLookup(_)));
    }
}

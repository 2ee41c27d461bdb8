//! The dialect compiler.
//!
//! A [`Compiler`] owns the registries ([`Engine`]), the database handle and
//! the transaction slot. It turns a frozen [`QuerySpec`] into a
//! [`CompiledQuery`]: the final SQL in the driver's placeholder form, its
//! ordered arguments, and an exec closure that runs it and shapes the result.
//!
//! Statements are assembled with `?` placeholders throughout. Every clause
//! is resolved through one [`ExprContext`], so joins requested by the select
//! list, the filters and the ordering are merged by alias, and the final
//! string is rebound once at the end.
//!
//! # Examples
//!
//! ```ignore
//! use std::sync::Arc;
//! use quarry_db::driver::Driver;
//! use quarry_db::query::compiler::Compiler;
//! use quarry_db::testing::{self, MockExecutor, Todo};
//!
//! let compiler = Compiler::new(MockExecutor::shared(Driver::Postgres), Arc::new(testing::registry()));
//! let (sql, args) = compiler.objects::<Todo>().filter(("Title", "T1")).to_sql().unwrap();
//! assert_eq!(
//!     sql,
//!     r#"SELECT "todos"."id", "todos"."title", "todos"."done", "todos"."user_id" FROM "todos" WHERE "todos"."title" = $1"#
//! );
//! assert_eq!(args.len(), 1);
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use quarry_core::{DatabaseSettings, QuarryError, QuarryResult, QuerySettings, Settings};

use super::alias::AliasGenerator;
use super::expressions::{Clause, Engine, Expr, ExprContext, Fragment, TableColumn};
use super::hydrate::{ObjectRow, RowPlan};
use super::queryset::{QuerySet, QuerySpec};
use crate::driver::{count_placeholders, Driver, Returning};
use crate::executor::{DbExecutor, QueryContext};
use crate::fields::FieldDef;
use crate::model::{pk_value, Instance, Model, ModelMeta};
use crate::registry::ModelRegistry;
use crate::row::Row;
use crate::transactions::{IsolationLevel, Transaction};
use crate::value::Value;

type BoxFuture<T> = Pin<Box<dyn Future<Output = QuarryResult<T>> + Send>>;

/// The exec closure of a compiled query.
pub type ExecFn<R> = Arc<dyn Fn(Arc<dyn DbExecutor>, QueryContext) -> BoxFuture<R> + Send + Sync>;

/// One SQL statement with its arguments, placeholders already rebound.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Final SQL.
    pub sql: String,
    /// Arguments in placeholder order.
    pub args: Vec<Value>,
}

/// A compiled statement ready to run.
pub struct CompiledQuery<R> {
    /// Final SQL; multi-statement updates are joined with `; `.
    pub sql: String,
    /// Arguments in placeholder order.
    pub args: Vec<Value>,
    /// The base model.
    pub model: &'static str,
    db: Arc<dyn DbExecutor>,
    exec: ExecFn<R>,
}

impl<R> fmt::Debug for CompiledQuery<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("model", &self.model)
            .field("sql", &self.sql)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl<R> CompiledQuery<R> {
    /// Runs the query on the handle it was compiled against.
    ///
    /// # Errors
    ///
    /// Driver errors, conversion errors while shaping rows, and
    /// [`QuarryError::Cancelled`] when `ctx` is cancelled first.
    pub async fn exec(&self, ctx: &QueryContext) -> QuarryResult<R> {
        (self.exec)(Arc::clone(&self.db), ctx.clone()).await
    }
}

/// What a SELECT returns.
#[derive(Debug, Clone)]
pub(crate) enum Projection {
    /// Model rows, hydrated through a [`RowPlan`].
    Objects,
    /// Arbitrary expressions, optionally aliased.
    Exprs {
        items: Vec<(Option<String>, Expr)>,
        aggregate: bool,
    },
    /// A single row count.
    Count,
    /// `SELECT 1 ... LIMIT 1`.
    Exists,
}

struct Assembled {
    sql: String,
    args: Vec<Value>,
    plan: RowPlan,
}

/// Compiles and runs query sets against one database handle.
pub struct Compiler {
    engine: Engine,
    db: Arc<dyn DbExecutor>,
    tx: Mutex<Option<Arc<Transaction>>>,
    settings: QuerySettings,
}

impl fmt::Debug for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compiler")
            .field("driver", &self.db.driver())
            .field("in_transaction", &self.in_transaction())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Compiler {
    /// A compiler over `db` with the built-in lookups, functions and casts.
    pub fn new(db: Arc<dyn DbExecutor>, registry: Arc<ModelRegistry>) -> Arc<Self> {
        Self::from_engine(db, Engine::new(registry), QuerySettings::default())
    }

    /// A compiler with custom registries and query defaults.
    pub fn from_engine(db: Arc<dyn DbExecutor>, engine: Engine, settings: QuerySettings) -> Arc<Self> {
        Arc::new(Self {
            engine,
            db,
            tx: Mutex::new(None),
            settings,
        })
    }

    /// Builds a compiler for the `default` database of `settings`, opening
    /// it through `connect`.
    ///
    /// # Errors
    ///
    /// [`QuarryError::NoDatabase`] without a `default` database,
    /// [`QuarryError::UnknownDriver`] for an unrecognised engine, and
    /// whatever `connect` reports.
    pub fn from_settings<F>(
        settings: &Settings,
        registry: Arc<ModelRegistry>,
        connect: F,
    ) -> QuarryResult<Arc<Self>>
    where
        F: FnOnce(&DatabaseSettings) -> QuarryResult<Arc<dyn DbExecutor>>,
    {
        let database = settings.default_database()?;
        let driver: Driver = database.engine.parse()?;
        let db = connect(database)?;
        if db.driver() != driver {
            return Err(QuarryError::ConfigurationError(format!(
                "database `{}` is configured as {driver} but the connection speaks {}",
                database.name,
                db.driver()
            )));
        }
        Ok(Self::from_engine(
            db,
            Engine::new(registry),
            settings.query.clone(),
        ))
    }

    /// The registries.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The model registry.
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.engine.registry
    }

    /// The dialect of the underlying handle.
    pub fn driver(&self) -> Driver {
        self.db.driver()
    }

    /// Query defaults applied to new query sets.
    pub const fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// A fresh query set over `M`.
    pub fn objects<M: Model>(self: &Arc<Self>) -> QuerySet<M> {
        QuerySet::new(Arc::clone(self))
    }

    // ── Transactions ───────────────────────────────────────────────────

    fn lock_tx(&self) -> MutexGuard<'_, Option<Arc<Transaction>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.lock_tx().is_some()
    }

    /// The handle queries run on: the open transaction, or the database.
    pub fn db(&self) -> Arc<dyn DbExecutor> {
        match self.lock_tx().as_ref() {
            Some(tx) => Arc::clone(tx) as Arc<dyn DbExecutor>,
            None => Arc::clone(&self.db),
        }
    }

    /// Opens a transaction; queries compiled until commit or rollback run
    /// inside it.
    ///
    /// # Errors
    ///
    /// [`QuarryError::TransactionStarted`] if one is already open.
    pub async fn start_transaction(&self, isolation: Option<IsolationLevel>) -> QuarryResult<()> {
        let active = self.lock_tx().is_some();
        if active {
            return Err(QuarryError::TransactionStarted);
        }
        let tx = Transaction::begin(Arc::clone(&self.db), isolation).await?;
        let raced = {
            let mut slot = self.lock_tx();
            if slot.is_some() {
                true
            } else {
                *slot = Some(Arc::clone(&tx));
                false
            }
        };
        if raced {
            tx.rollback().await?;
            return Err(QuarryError::TransactionStarted);
        }
        Ok(())
    }

    /// Commits and releases the open transaction.
    ///
    /// # Errors
    ///
    /// [`QuarryError::NoTransaction`] if none is open.
    pub async fn commit(&self) -> QuarryResult<()> {
        let tx = self.lock_tx().take().ok_or(QuarryError::NoTransaction)?;
        tx.commit().await
    }

    /// Rolls back and releases the open transaction.
    ///
    /// # Errors
    ///
    /// [`QuarryError::NoTransaction`] if none is open.
    pub async fn rollback(&self) -> QuarryResult<()> {
        let tx = self.lock_tx().take().ok_or(QuarryError::NoTransaction)?;
        tx.rollback().await
    }

    // ── Terminal compilations ──────────────────────────────────────────

    fn meta<M: Model>(&self) -> QuarryResult<Arc<ModelMeta>> {
        self.engine.registry.meta_of::<M>()
    }

    /// A SELECT returning hydrated objects.
    pub(crate) fn select<M: Model>(
        &self,
        spec: &QuerySpec,
    ) -> QuarryResult<CompiledQuery<Vec<ObjectRow<M>>>> {
        let meta = self.meta::<M>()?;
        let Assembled { sql, args, plan } = self.assemble(&meta, spec, &Projection::Objects)?;
        let plan = Arc::new(plan);
        Ok(self.query_exec(meta.name, sql, args, "select", move |rows, ctx| {
            plan.hydrate::<M>(rows, ctx)
        }))
    }

    /// A SELECT returning raw rows of `items`.
    pub(crate) fn select_exprs<M: Model>(
        &self,
        spec: &QuerySpec,
        items: Vec<(Option<String>, Expr)>,
        aggregate: bool,
    ) -> QuarryResult<CompiledQuery<Vec<Row>>> {
        let meta = self.meta::<M>()?;
        let projection = Projection::Exprs { items, aggregate };
        let Assembled { sql, args, .. } = self.assemble(&meta, spec, &projection)?;
        Ok(self.query_exec(meta.name, sql, args, "values", |rows, _| Ok(rows)))
    }

    /// `SELECT COUNT(...)`.
    pub(crate) fn count<M: Model>(&self, spec: &QuerySpec) -> QuarryResult<CompiledQuery<i64>> {
        let meta = self.meta::<M>()?;
        let Assembled { sql, args, .. } = self.assemble(&meta, spec, &Projection::Count)?;
        Ok(self.query_exec(meta.name, sql, args, "count", |rows, _| {
            rows.first().map_or(Ok(0), |row| row.get_by_index::<i64>(0))
        }))
    }

    /// `SELECT 1 ... LIMIT 1`.
    pub(crate) fn exists<M: Model>(&self, spec: &QuerySpec) -> QuarryResult<CompiledQuery<bool>> {
        let meta = self.meta::<M>()?;
        let Assembled { sql, args, .. } = self.assemble(&meta, spec, &Projection::Exists)?;
        Ok(self.query_exec(meta.name, sql, args, "exists", |rows, _| Ok(!rows.is_empty())))
    }

    /// An INSERT of `object`, reading generated values back the way the
    /// driver allows.
    pub(crate) fn insert<M: Model>(&self, object: &M) -> QuarryResult<CompiledQuery<M>> {
        let meta = self.meta::<M>()?;
        let driver = self.driver();
        let returning = driver.returning();

        let mut columns = Vec::new();
        let mut values = Vec::new();
        for field in meta.concrete_fields() {
            let value = object.get_field(field.name).unwrap_or(Value::Null);
            if field.primary_key && value.is_zero() {
                continue;
            }
            columns.push(driver.quote(field.column_name()));
            values.push(checked(&meta, field, value)?);
        }

        let table = driver.quote(&meta.table);
        let mut sql = if columns.is_empty() {
            match driver {
                Driver::MySql => format!("INSERT INTO {table} () VALUES ()"),
                Driver::Postgres | Driver::Sqlite => format!("INSERT INTO {table} DEFAULT VALUES"),
            }
        } else {
            format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            )
        };
        if returning == Returning::Columns {
            let all: Vec<String> = meta
                .concrete_fields()
                .map(|f| driver.quote(f.column_name()))
                .collect();
            sql.push_str(" RETURNING ");
            sql.push_str(&all.join(", "));
        }
        let sql = self.finish_sql(meta.name, &sql, &values)?;

        let shared = Arc::new((sql.clone(), values.clone(), object.clone(), Arc::clone(&meta)));
        let exec: ExecFn<M> = Arc::new(move |db, ctx| {
            let shared = Arc::clone(&shared);
            Box::pin(async move {
                let (sql, args, object, meta) = &*shared;
                let mut object = object.clone();
                match returning {
                    Returning::Columns => {
                        let rows = ctx.run("insert", db.query(sql, args)).await?;
                        let row = rows
                            .into_iter()
                            .next()
                            .ok_or_else(|| QuarryError::NoRows(sql.clone()))?;
                        apply_returned(meta, &mut object, row)?;
                    }
                    Returning::LastInsertId => {
                        let id = ctx.run("insert", db.insert_returning_id(sql, args)).await?;
                        let pk = meta.primary();
                        if pk_value(meta, &object)?.is_zero() && !id.is_null() {
                            let qualified = format!("{}.{}", meta.name, pk.name);
                            object.set_field(pk.name, id.convert_to(&pk.field_type, &qualified)?)?;
                        }
                    }
                    Returning::None => {
                        ctx.run("insert", db.execute(sql, args)).await?;
                    }
                }
                Ok(object)
            })
        });
        Ok(CompiledQuery {
            sql,
            args: values,
            model: meta.name,
            db: self.db(),
            exec,
        })
    }

    /// One UPDATE per object, run in order; returns the rows affected.
    pub(crate) fn update<M: Model>(
        &self,
        spec: &QuerySpec,
        objects: &[M],
        exprs: &[Expr],
    ) -> QuarryResult<CompiledQuery<u64>> {
        let meta = self.meta::<M>()?;
        let statements = objects
            .iter()
            .map(|object| self.update_statement(&meta, spec, object, exprs))
            .collect::<QuarryResult<Vec<_>>>()?;
        Ok(self.write_exec(meta.name, statements, "update"))
    }

    /// A DELETE of every row the filters match.
    pub(crate) fn delete<M: Model>(&self, spec: &QuerySpec) -> QuarryResult<CompiledQuery<u64>> {
        let meta = self.meta::<M>()?;
        let driver = self.driver();
        let mut ctx = ExprContext::new(&self.engine, driver, Arc::clone(&meta));
        let condition = self.write_condition(&mut ctx, spec.filters.clone())?;

        let mut out = Fragment::sql(&format!("DELETE FROM {}", driver.quote(&meta.table)));
        if !condition.is_empty() {
            out.push_sql(" WHERE ");
            out.push(&condition);
        }
        let sql = self.finish_sql(meta.name, &out.sql, &out.args)?;
        Ok(self.write_exec(
            meta.name,
            vec![Statement {
                sql,
                args: out.args,
            }],
            "delete",
        ))
    }

    // ── SELECT assembly ────────────────────────────────────────────────

    fn assemble(
        &self,
        meta: &Arc<ModelMeta>,
        spec: &QuerySpec,
        projection: &Projection,
    ) -> QuarryResult<Assembled> {
        let driver = self.driver();
        let mut ctx = ExprContext::new(&self.engine, driver, Arc::clone(meta));
        let mut plan = RowPlan::new(Arc::clone(meta));

        ctx.set_clause(Clause::Select);
        let mut annotations = Vec::with_capacity(spec.annotations.len());
        for (name, expr) in &spec.annotations {
            let fragment = expr.fragment(&mut ctx)?;
            ctx.annotate(name, fragment.clone());
            annotations.push((name.clone(), fragment));
        }

        let mut select: Vec<Fragment> = Vec::new();
        let ordered = match projection {
            Projection::Objects => {
                if spec.select.is_empty() {
                    self.project(&mut ctx, &mut plan, "*", &mut select)?;
                } else {
                    for path in &spec.select {
                        self.project(&mut ctx, &mut plan, path, &mut select)?;
                    }
                }
                for (name, fragment) in &annotations {
                    select.push(aliased(fragment.clone(), &ctx.quote(name)));
                    plan.add_annotation(name);
                }
                true
            }
            Projection::Exprs { items, aggregate } => {
                if *aggregate && spec.group_by.is_empty() && driver.requires_full_group_by() {
                    check_ungrouped(&ctx, items)?;
                }
                for (name, expr) in items {
                    let fragment = expr.fragment(&mut ctx)?;
                    select.push(match name {
                        Some(name) => aliased(fragment, &ctx.quote(name)),
                        None => fragment,
                    });
                }
                !aggregate
            }
            Projection::Count | Projection::Exists => false,
        };

        ctx.set_clause(Clause::Where);
        let condition = if spec.filters.is_empty() {
            Fragment::default()
        } else {
            Expr::and(spec.filters.clone()).fragment(&mut ctx)?
        };

        ctx.set_clause(Clause::GroupBy);
        let group_by = spec
            .group_by
            .iter()
            .map(|e| e.fragment(&mut ctx))
            .collect::<QuarryResult<Vec<_>>>()?;

        ctx.set_clause(Clause::Having);
        let having = if spec.having.is_empty() {
            Fragment::default()
        } else {
            Expr::and(spec.having.clone()).fragment(&mut ctx)?
        };

        ctx.set_clause(Clause::OrderBy);
        let mut order_by = Vec::new();
        if ordered {
            for (expr, desc) in &spec.order_by {
                let fragment = expr.fragment(&mut ctx)?;
                order_by.push(if *desc { fragment.suffixed(" DESC") } else { fragment });
            }
        }

        let pk_column = ctx.column_ref(ctx.base_alias(), meta.primary().column_name());
        let joined = !ctx.joins().is_empty();

        // FROM ... [JOIN ...] [WHERE ...] [GROUP BY ...] [HAVING ...]
        let mut body = Fragment::sql(" FROM ");
        body.push_sql(&from_clause(&ctx, meta));
        if joined {
            body.push_sql(" ");
            body.push_sql(&ctx.joins().to_sql(driver));
        }
        if !condition.is_empty() {
            body.push_sql(" WHERE ");
            body.push(&condition);
        }
        if !group_by.is_empty() {
            body.push_sql(" GROUP BY ");
            body.push(&join(&group_by, ", "));
        }
        if !having.is_empty() {
            body.push_sql(" HAVING ");
            body.push(&having);
        }

        let limit = if spec.first_only && !ctx.joins().has_to_many() {
            Some(spec.limit.map_or(1, |l| l.min(1)))
        } else {
            spec.limit
        };
        let mut tail = Fragment::default();
        if !order_by.is_empty() {
            tail.push_sql(" ORDER BY ");
            tail.push(&join(&order_by, ", "));
        }
        push_limit(&mut tail, driver, limit, spec.offset);

        let mut out = Fragment::sql("SELECT ");
        match projection {
            Projection::Count => {
                let wrap = spec.distinct
                    || !group_by.is_empty()
                    || spec.limit.is_some()
                    || spec.offset.is_some();
                if wrap {
                    let mut inner = Fragment::sql("SELECT ");
                    if spec.distinct || joined {
                        inner.push_sql("DISTINCT ");
                    }
                    if group_by.is_empty() {
                        inner.push_sql(&pk_column);
                    } else {
                        inner.push(&join(&group_by, ", "));
                    }
                    inner.push(&body);
                    inner.push(&tail);
                    out.push_sql("COUNT(*) FROM (");
                    out.push(&inner);
                    out.push_sql(") AS ");
                    out.push_sql(&ctx.quote("__count"));
                } else {
                    if joined {
                        out.push_sql(&format!("COUNT(DISTINCT {pk_column})"));
                    } else {
                        out.push_sql("COUNT(*)");
                    }
                    out.push(&body);
                }
            }
            Projection::Exists => {
                out.push_sql("1");
                out.push(&body);
                push_limit(&mut out, driver, Some(1), None);
            }
            Projection::Objects | Projection::Exprs { .. } => {
                if spec.distinct {
                    out.push_sql("DISTINCT ");
                }
                out.push(&join(&select, ", "));
                out.push(&body);
                out.push(&tail);
                if spec.for_update && driver.supports_for_update() {
                    out.push_sql(" FOR UPDATE");
                }
            }
        }

        let sql = self.finish_sql(meta.name, &out.sql, &out.args)?;
        Ok(Assembled {
            sql,
            args: out.args,
            plan,
        })
    }

    /// Adds the columns a select path names to the select list and the plan.
    fn project(
        &self,
        ctx: &mut ExprContext<'_>,
        plan: &mut RowPlan,
        path: &str,
        select: &mut Vec<Fragment>,
    ) -> QuarryResult<()> {
        let resolved = ctx.resolve_path(path)?;
        let node = plan.node(&resolved);
        let fields: Vec<FieldDef> = match &resolved.field {
            Some(field) => vec![field.clone()],
            None => resolved.model.star_fields().cloned().collect(),
        };
        let chain = resolved.chain_key();
        for field in &fields {
            if !plan.add_field(&self.engine.registry, node, field)? {
                continue;
            }
            if field.computed.is_some() {
                let full = if chain.is_empty() {
                    field.name.to_string()
                } else {
                    format!("{chain}.{}", field.name)
                };
                let alias = AliasGenerator::field_alias(&resolved.alias, field.name);
                let rendered = ctx.resolve_column(&full)?;
                select.push(aliased(rendered, &ctx.quote(&alias)));
            } else {
                select.push(Fragment::sql(
                    &ctx.column_ref(&resolved.alias, field.column_name()),
                ));
            }
        }
        Ok(())
    }

    // ── UPDATE / DELETE assembly ───────────────────────────────────────

    fn update_statement(
        &self,
        meta: &Arc<ModelMeta>,
        spec: &QuerySpec,
        object: &dyn Instance,
        exprs: &[Expr],
    ) -> QuarryResult<Statement> {
        let driver = self.driver();
        let mut targets = Vec::with_capacity(exprs.len());
        for expr in exprs {
            let target = expr.update_target().ok_or_else(|| {
                QuarryError::InvalidExpression(format!(
                    "update expressions must assign a field (`![Field] = ...`), got {expr:?}"
                ))
            })?;
            targets.push(target);
        }

        let mut set_ctx = ExprContext::new(&self.engine, driver, Arc::clone(meta));
        set_ctx.set_updating(true);
        set_ctx.set_clause(Clause::Set);

        let mut sets = Vec::new();
        for field in plain_update_fields(meta, spec, !exprs.is_empty())? {
            if targets.contains(&field.name) {
                continue;
            }
            let value = object.get_field(field.name).unwrap_or(Value::Null);
            sets.push(set_ctx.format_column(&TableColumn::Assign {
                column: field.column_name().to_string(),
                value: checked(meta, field, value)?,
            }));
        }
        for expr in exprs {
            sets.push(expr.fragment(&mut set_ctx)?);
        }
        if sets.is_empty() {
            return Err(QuarryError::InvalidExpression(format!(
                "nothing to update on {}",
                meta.name
            )));
        }

        let mut filters = spec.filters.clone();
        let pk = pk_value(meta, object)?;
        if !pk.is_zero() {
            filters.push(Expr::filter(meta.primary().name, pk));
        }
        let mut where_ctx = ExprContext::new(&self.engine, driver, Arc::clone(meta));
        let condition = self.write_condition(&mut where_ctx, filters)?;

        let mut out = Fragment::sql(&format!("UPDATE {} SET ", driver.quote(&meta.table)));
        out.push(&join(&sets, ", "));
        if !condition.is_empty() {
            out.push_sql(" WHERE ");
            out.push(&condition);
        }
        let sql = self.finish_sql(meta.name, &out.sql, &out.args)?;
        Ok(Statement {
            sql,
            args: out.args,
        })
    }

    /// The WHERE of an UPDATE or DELETE. Conditions that need joins are
    /// moved into a primary-key subquery, wrapped twice so MySQL accepts a
    /// subquery over the table being written.
    fn write_condition(&self, ctx: &mut ExprContext<'_>, filters: Vec<Expr>) -> QuarryResult<Fragment> {
        if filters.is_empty() {
            return Ok(Fragment::default());
        }
        ctx.set_clause(Clause::Where);
        let condition = Expr::and(filters).fragment(ctx)?;
        if ctx.joins().is_empty() {
            return Ok(condition);
        }
        let driver = ctx.driver();
        let base = Arc::clone(ctx.base());
        let pk = driver.quote(base.primary().column_name());
        let mut out = Fragment::sql(&format!(
            "{pk} IN (SELECT {pk} FROM (SELECT {} FROM {} {} WHERE ",
            ctx.column_ref(ctx.base_alias(), base.primary().column_name()),
            from_clause(ctx, &base),
            ctx.joins().to_sql(driver),
        ));
        out.push(&condition);
        out.push_sql(") AS ");
        out.push_sql(&driver.quote("__sub"));
        Ok(out.suffixed(")"))
    }

    // ── Plumbing ───────────────────────────────────────────────────────

    /// Checks placeholder alignment, rebinds and logs a statement.
    fn finish_sql(&self, model: &str, sql: &str, args: &[Value]) -> QuarryResult<String> {
        let placeholders = count_placeholders(sql);
        if placeholders != args.len() {
            return Err(QuarryError::InvalidExpression(format!(
                "{placeholders} placeholder(s) for {} argument(s) in `{sql}`",
                args.len()
            )));
        }
        let sql = self.driver().rebind(sql);
        if self.settings.log_queries {
            tracing::info!(target: "quarry::sql", model, sql = %sql, args = args.len(), "compiled");
        } else {
            tracing::debug!(model, sql = %sql, args = args.len(), "compiled");
        }
        Ok(sql)
    }

    fn query_exec<R, F>(
        &self,
        model: &'static str,
        sql: String,
        args: Vec<Value>,
        stage: &'static str,
        finish: F,
    ) -> CompiledQuery<R>
    where
        R: Send + 'static,
        F: Fn(Vec<Row>, &QueryContext) -> QuarryResult<R> + Send + Sync + 'static,
    {
        let shared = Arc::new((sql.clone(), args.clone()));
        let finish = Arc::new(finish);
        let exec: ExecFn<R> = Arc::new(move |db, ctx| {
            let shared = Arc::clone(&shared);
            let finish = Arc::clone(&finish);
            Box::pin(async move {
                let (sql, args) = &*shared;
                let rows = ctx.run(stage, db.query(sql, args)).await?;
                (*finish)(rows, &ctx)
            })
        });
        CompiledQuery {
            sql,
            args,
            model,
            db: self.db(),
            exec,
        }
    }

    fn write_exec(
        &self,
        model: &'static str,
        statements: Vec<Statement>,
        stage: &'static str,
    ) -> CompiledQuery<u64> {
        let sql = statements
            .iter()
            .map(|s| s.sql.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let args = statements.iter().flat_map(|s| s.args.iter().cloned()).collect();
        let statements = Arc::new(statements);
        let exec: ExecFn<u64> = Arc::new(move |db, ctx| {
            let statements = Arc::clone(&statements);
            Box::pin(async move {
                let mut affected = 0;
                for statement in statements.iter() {
                    affected += ctx.run(stage, db.execute(&statement.sql, &statement.args)).await?;
                }
                Ok(affected)
            })
        });
        CompiledQuery {
            sql,
            args,
            model,
            db: self.db(),
            exec,
        }
    }
}

/// Fields an UPDATE writes from the object itself.
fn plain_update_fields<'m>(
    meta: &'m ModelMeta,
    spec: &QuerySpec,
    has_exprs: bool,
) -> QuarryResult<Vec<&'m FieldDef>> {
    let all = || {
        meta.concrete_fields()
            .filter(|f| !f.primary_key)
            .collect::<Vec<_>>()
    };
    if spec.explicit_save {
        return Ok(Vec::new());
    }
    if spec.select.is_empty() {
        return Ok(if has_exprs { Vec::new() } else { all() });
    }
    let mut fields: Vec<&FieldDef> = Vec::new();
    for path in &spec.select {
        let selected = if path == "*" {
            all()
        } else {
            let field = meta
                .field(path)
                .filter(|f| f.is_concrete())
                .ok_or_else(|| QuarryError::FieldNotFound(format!("{}.{path}", meta.name)))?;
            if field.primary_key {
                Vec::new()
            } else {
                vec![field]
            }
        };
        for field in selected {
            if !fields.iter().any(|f| f.name == field.name) {
                fields.push(field);
            }
        }
    }
    Ok(fields)
}

/// Applies the write-side NULL rule: a non-nullable field falls back to its
/// default.
fn checked(meta: &ModelMeta, field: &FieldDef, value: Value) -> QuarryResult<Value> {
    if !value.is_null() || field.null {
        return Ok(value);
    }
    field
        .default
        .clone()
        .ok_or_else(|| QuarryError::FieldNull(format!("{}.{}", meta.name, field.name)))
}

/// Copies `RETURNING` columns back onto the object. Forward keys are left
/// alone since the object already carries the related instance.
fn apply_returned(meta: &ModelMeta, object: &mut dyn Instance, row: Row) -> QuarryResult<()> {
    for (field, value) in meta.concrete_fields().zip(row.into_values()) {
        if field.is_forward_key() {
            continue;
        }
        if value.is_null() {
            if field.null {
                object.set_field(field.name, Value::Null)?;
            }
            continue;
        }
        let qualified = format!("{}.{}", meta.name, field.name);
        object.set_field(field.name, value.convert_to(&field.field_type, &qualified)?)?;
    }
    Ok(())
}

/// Rejects a plain column selected next to aggregates with no GROUP BY.
fn check_ungrouped(ctx: &ExprContext<'_>, items: &[(Option<String>, Expr)]) -> QuarryResult<()> {
    let bare = items
        .iter()
        .filter_map(|(_, expr)| expr.bare_column())
        .find(|path| ctx.annotation(path).is_none());
    let aggregated = items.iter().any(|(_, expr)| expr.bare_column().is_none());
    match bare {
        Some(path) if aggregated => Err(QuarryError::InvalidExpression(format!(
            "`{path}` is selected next to aggregates without GROUP BY on {}; group by it or aggregate it",
            ctx.driver()
        ))),
        _ => Ok(()),
    }
}

fn from_clause(ctx: &ExprContext<'_>, meta: &ModelMeta) -> String {
    let table = ctx.quote(&meta.table);
    if ctx.base_alias() == meta.table {
        table
    } else {
        format!("{table} AS {}", ctx.quote(ctx.base_alias()))
    }
}

fn aliased(fragment: Fragment, alias: &str) -> Fragment {
    let mut out = fragment;
    out.push_sql(" AS ");
    out.push_sql(alias);
    out
}

fn join(parts: &[Fragment], separator: &str) -> Fragment {
    let mut out = Fragment::default();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push_sql(separator);
        }
        out.push(part);
    }
    out
}

fn push_limit(out: &mut Fragment, driver: Driver, limit: Option<u64>, offset: Option<u64>) {
    let bound = |n: u64| Value::Int(i64::try_from(n).unwrap_or(i64::MAX));
    match (limit, offset) {
        (Some(limit), _) => {
            out.push_sql(" LIMIT ");
            out.bind(bound(limit));
        }
        (None, Some(_)) => match driver {
            Driver::Sqlite => out.push_sql(" LIMIT -1"),
            Driver::MySql => out.push_sql(" LIMIT 18446744073709551615"),
            Driver::Postgres => {}
        },
        (None, None) => {}
    }
    if let Some(offset) = offset {
        out.push_sql(" OFFSET ");
        out.bind(bound(offset));
    }
}

//! The per-compilation resolution context.
//!
//! An [`ExprContext`] binds expressions to one driver and one base model. It
//! owns the alias generator and the join plan for the compilation, so every
//! clause resolved through the same context shares aliases and joins.

use std::sync::Arc;

use indexmap::IndexMap;
use quarry_core::{QuarryError, QuarryResult};

use super::cast::CastRegistry;
use super::core::Fragment;
use super::functions::FunctionRegistry;
use super::raw::RawTemplate;
use crate::driver::Driver;
use crate::model::ModelMeta;
use crate::query::alias::AliasGenerator;
use crate::query::lookups::LookupRegistry;
use crate::query::walker::{self, JoinPlan, ResolvedPath};
use crate::registry::ModelRegistry;
use crate::value::Value;

/// The read-only registries a compilation resolves against.
#[derive(Debug, Clone)]
pub struct Engine {
    /// Model metadata.
    pub registry: Arc<ModelRegistry>,
    /// Field lookups.
    pub lookups: LookupRegistry,
    /// SQL functions.
    pub functions: FunctionRegistry,
    /// Cast templates.
    pub casts: CastRegistry,
}

impl Engine {
    /// An engine over `registry` with the built-in lookups, functions and
    /// casts.
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            lookups: LookupRegistry::with_defaults(),
            functions: FunctionRegistry::with_defaults(),
            casts: CastRegistry::with_defaults(),
        }
    }
}

/// The clause currently being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clause {
    /// The select list.
    Select,
    /// `WHERE`.
    Where,
    /// `GROUP BY`.
    GroupBy,
    /// `HAVING`.
    Having,
    /// `ORDER BY`: annotations are referenced by alias.
    OrderBy,
    /// `UPDATE ... SET`.
    Set,
}

/// A column-like item of a select list or `SET` clause.
#[derive(Debug, Clone, PartialEq)]
pub enum TableColumn {
    /// `alias.column`.
    Column {
        /// Table alias.
        alias: String,
        /// Column name.
        column: String,
    },
    /// A bare quoted alias.
    Alias(String),
    /// Pre-rendered SQL.
    Raw(Fragment),
    /// A bound value.
    Value(Value),
    /// `column = ?`, for `SET` lists.
    Assign {
        /// Column name.
        column: String,
        /// Value bound to it.
        value: Value,
    },
}

/// Resolution state for one compilation.
pub struct ExprContext<'e> {
    engine: &'e Engine,
    driver: Driver,
    base: Arc<ModelMeta>,
    base_alias: String,
    aliases: AliasGenerator,
    joins: JoinPlan,
    updating: bool,
    clause: Clause,
    annotations: IndexMap<String, Fragment>,
}

impl std::fmt::Debug for ExprContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExprContext")
            .field("driver", &self.driver)
            .field("base", &self.base.name)
            .field("clause", &self.clause)
            .field("updating", &self.updating)
            .field("joins", &self.joins.len())
            .finish_non_exhaustive()
    }
}

impl<'e> ExprContext<'e> {
    /// A context resolving paths from `base` for `driver`.
    pub fn new(engine: &'e Engine, driver: Driver, base: Arc<ModelMeta>) -> Self {
        let mut aliases = AliasGenerator::new();
        let base_alias = aliases.table_alias(&base.table, "");
        Self {
            engine,
            driver,
            base,
            base_alias,
            aliases,
            joins: JoinPlan::default(),
            updating: false,
            clause: Clause::Where,
            annotations: IndexMap::new(),
        }
    }

    /// The registries.
    pub fn engine(&self) -> &'e Engine {
        self.engine
    }

    /// The target dialect.
    pub const fn driver(&self) -> Driver {
        self.driver
    }

    /// The base model.
    pub fn base(&self) -> &Arc<ModelMeta> {
        &self.base
    }

    /// The base table alias.
    pub fn base_alias(&self) -> &str {
        &self.base_alias
    }

    /// Quotes an identifier for the driver.
    pub fn quote(&self, ident: &str) -> String {
        self.driver.quote(ident)
    }

    /// Joins collected so far.
    pub fn joins(&self) -> &JoinPlan {
        &self.joins
    }

    /// The clause being resolved.
    pub const fn clause(&self) -> Clause {
        self.clause
    }

    /// Switches to another clause.
    pub fn set_clause(&mut self, clause: Clause) {
        self.clause = clause;
    }

    /// Enters or leaves update mode, where base columns print unqualified
    /// and related paths are rejected.
    pub fn set_updating(&mut self, updating: bool) {
        self.updating = updating;
    }

    /// Returns `true` in update mode.
    pub const fn is_updating(&self) -> bool {
        self.updating
    }

    /// Records a resolved annotation so later clauses can reference it by
    /// name.
    pub fn annotate(&mut self, name: &str, fragment: Fragment) {
        self.annotations.insert(name.to_string(), fragment);
    }

    /// A recorded annotation.
    pub fn annotation(&self, name: &str) -> Option<&Fragment> {
        self.annotations.get(name)
    }

    /// Walks `path` and records the joins it needs.
    ///
    /// # Errors
    ///
    /// Propagates walker errors; in update mode a related path is an
    /// [`QuarryError::InvalidExpression`].
    pub fn resolve_path(&mut self, path: &str) -> QuarryResult<ResolvedPath> {
        let resolved = walker::walk(&self.engine.registry, &self.base, path, &mut self.aliases)?;
        if self.updating && resolved.is_related() {
            return Err(QuarryError::InvalidExpression(format!(
                "`{path}` crosses a relation; UPDATE can only assign from {} columns",
                self.base.name
            )));
        }
        for step in &resolved.joins {
            self.joins.add(step.clone());
        }
        Ok(resolved)
    }

    /// Renders a column reference: `"alias"."column"`, or the bare column
    /// for the base table in update mode.
    pub fn column_ref(&self, alias: &str, column: &str) -> String {
        if self.updating && alias == self.base_alias {
            self.quote(column)
        } else {
            format!("{}.{}", self.quote(alias), self.quote(column))
        }
    }

    /// Resolves a field path or annotation name to SQL.
    ///
    /// Annotations are inlined, except in `ORDER BY` where their alias is
    /// used. Computed fields render their template relative to the model
    /// that declares them.
    pub fn resolve_column(&mut self, path: &str) -> QuarryResult<Fragment> {
        if !path.contains('.') {
            if let Some(annotation) = self.annotations.get(path) {
                return Ok(if self.clause == Clause::OrderBy {
                    Fragment::sql(&self.quote(path))
                } else {
                    annotation.clone()
                });
            }
        }

        let resolved = self.resolve_path(path)?;
        let Some(field) = resolved.field.as_ref() else {
            return Err(QuarryError::InvalidExpression(format!(
                "`{path}` selects every field; name a single column"
            )));
        };
        if let Some(template) = &field.computed {
            let prefix = resolved.chain_key();
            let raw = RawTemplate::parse(template, Vec::new())?;
            let rendered = raw.render(self, (!prefix.is_empty()).then_some(prefix.as_str()))?;
            return Ok(rendered.wrapped());
        }
        Ok(Fragment::sql(
            &self.column_ref(&resolved.alias, field.column_name()),
        ))
    }

    /// Formats one select-list or `SET` item.
    pub fn format_column(&self, column: &TableColumn) -> Fragment {
        match column {
            TableColumn::Column { alias, column } => Fragment::sql(&self.column_ref(alias, column)),
            TableColumn::Alias(alias) => Fragment::sql(&self.quote(alias)),
            TableColumn::Raw(fragment) => fragment.clone(),
            TableColumn::Value(value) => Fragment::bound(value.clone()),
            TableColumn::Assign { column, value } => {
                let mut f = Fragment::sql(&self.quote(column));
                f.push_sql(" = ");
                f.bind(value.clone());
                f
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expressions::Expr;
    use crate::testing;

    fn engine() -> Engine {
        Engine::new(Arc::new(testing::registry()))
    }

    fn ctx<'e>(engine: &'e Engine, driver: Driver, model: &str) -> ExprContext<'e> {
        let base = engine.registry.meta(model).unwrap();
        ExprContext::new(engine, driver, base)
    }

    #[test]
    fn test_column_qualified() {
        let engine = engine();
        let mut c = ctx(&engine, Driver::Postgres, "Todo");
        let f = c.resolve_column("Title").unwrap();
        assert_eq!(f.sql, r#""todos"."title""#);
        assert!(c.joins().is_empty());
    }

    #[test]
    fn test_related_column_adds_join() {
        let engine = engine();
        let mut c = ctx(&engine, Driver::MySql, "Todo");
        let f = c.resolve_column("User.Name").unwrap();
        assert_eq!(f.sql, "`users`.`name`");
        assert_eq!(
            c.joins().to_sql(Driver::MySql),
            "LEFT JOIN `users` ON `users`.`id` = `todos`.`user_id`"
        );
    }

    #[test]
    fn test_updating_unqualifies_base_columns() {
        let engine = engine();
        let mut c = ctx(&engine, Driver::Postgres, "Todo");
        c.set_updating(true);
        assert_eq!(c.resolve_column("Title").unwrap().sql, r#""title""#);
        assert!(matches!(
            c.resolve_column("User.Name"),
            Err(QuarryError::InvalidExpression(_))
        ));
    }

    #[test]
    fn test_annotation_reference_by_clause() {
        let engine = engine();
        let mut c = ctx(&engine, Driver::Sqlite, "Todo");
        c.annotate("Shout", Fragment::sql(r#"UPPER("todos"."title")"#));
        c.set_clause(Clause::Where);
        assert_eq!(c.resolve_column("Shout").unwrap().sql, r#"UPPER("todos"."title")"#);
        c.set_clause(Clause::OrderBy);
        assert_eq!(c.resolve_column("Shout").unwrap().sql, r#""Shout""#);
    }

    #[test]
    fn test_computed_field_relative_to_declaring_model() {
        let engine = engine();
        let mut c = ctx(&engine, Driver::Postgres, "Todo");
        let f = c.resolve_column("User.Greeting").unwrap();
        assert_eq!(f.sql, r#"('Hi ' || "users"."name")"#);
    }

    #[test]
    fn test_star_is_not_a_column() {
        let engine = engine();
        let mut c = ctx(&engine, Driver::Postgres, "Todo");
        assert!(matches!(
            c.resolve_column("User.*"),
            Err(QuarryError::InvalidExpression(_))
        ));
    }

    #[test]
    fn test_format_column() {
        let engine = engine();
        let c = ctx(&engine, Driver::Postgres, "Todo");
        let assign = c.format_column(&TableColumn::Assign {
            column: "title".into(),
            value: Value::from("x"),
        });
        assert_eq!(assign.sql, r#""title" = ?"#);
        assert_eq!(assign.args, vec![Value::from("x")]);
        let col = c.format_column(&TableColumn::Column {
            alias: "users".into(),
            column: "name".into(),
        });
        assert_eq!(col.sql, r#""users"."name""#);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let engine = engine();
        let mut c = ctx(&engine, Driver::Postgres, "Todo");
        let expr = Expr::filter("User.Name__icontains", "ann") & Expr::filter("Done", false);
        let once = expr.resolve(&mut c).unwrap();
        let twice = once.resolve(&mut c).unwrap();
        assert_eq!(once, twice);

        let mut sql = String::new();
        let args = twice.sql(&mut sql).unwrap();
        assert_eq!(
            sql,
            r#"(LOWER("users"."name") LIKE LOWER(?) AND "todos"."done" = ?)"#
        );
        assert_eq!(args, vec![Value::from("%ann%"), Value::Bool(false)]);
    }

    #[test]
    fn test_unresolved_sql_fails() {
        let mut sql = String::new();
        assert!(matches!(
            Expr::col("Title").sql(&mut sql),
            Err(QuarryError::InvalidExpression(_))
        ));
    }
}

//! The field-path walker.
//!
//! [`walk`] resolves a dotted path such as `User.Profile.Email` against the
//! registered model graph. Every non-terminal segment must name a forward or
//! reverse relation; each hop allocates a table alias keyed by the chain
//! walked so far and produces the join steps that reach it. Many-to-many hops
//! produce two steps, source to through table and through table to target.
//!
//! Recursive graphs (a model pointing at itself) need no special casing: the
//! chain string is part of the alias key, so `Parent` and `Parent.Parent`
//! land on distinct aliases of the same table.

use std::sync::Arc;

use indexmap::IndexMap;
use quarry_core::{QuarryError, QuarryResult};

use crate::driver::Driver;
use crate::fields::{FieldDef, Relation, RelationKind};
use crate::model::ModelMeta;
use crate::query::alias::AliasGenerator;
use crate::registry::ModelRegistry;

/// The join flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// `LEFT JOIN`: keeps the parent row when the child is missing.
    Left,
    /// `INNER JOIN`.
    Inner,
}

impl JoinKind {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::Left => "LEFT JOIN",
            Self::Inner => "INNER JOIN",
        }
    }
}

/// One equality in a join's `ON` clause: `left_alias.left_column =
/// right_alias.right_column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCondition {
    /// Alias of the joined table.
    pub left_alias: String,
    /// Column on the joined table.
    pub left_column: String,
    /// Alias of the table joined from.
    pub right_alias: String,
    /// Column on the table joined from.
    pub right_column: String,
}

/// A single join produced by one hop of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinStep {
    /// Alias of the table this step joins from.
    pub from_alias: String,
    /// The joined table.
    pub table: String,
    /// The alias the joined table is given.
    pub alias: String,
    /// Join flavour.
    pub kind: JoinKind,
    /// `ON` conditions, AND-ed together.
    pub conditions: Vec<JoinCondition>,
    /// Whether this step can multiply rows of the table it joins from.
    pub to_many: bool,
}

impl JoinStep {
    /// Renders the join clause.
    pub fn to_sql(&self, driver: Driver) -> String {
        let mut sql = format!("{} {}", self.kind.as_sql(), driver.quote(&self.table));
        if self.alias != self.table {
            sql.push_str(" AS ");
            sql.push_str(&driver.quote(&self.alias));
        }
        sql.push_str(" ON ");
        let conditions: Vec<String> = self
            .conditions
            .iter()
            .map(|c| {
                format!(
                    "{}.{} = {}.{}",
                    driver.quote(&c.left_alias),
                    driver.quote(&c.left_column),
                    driver.quote(&c.right_alias),
                    driver.quote(&c.right_column)
                )
            })
            .collect();
        sql.push_str(&conditions.join(" AND "));
        sql
    }
}

/// Joins collected across every clause of one compilation, keyed by alias.
#[derive(Debug, Clone, Default)]
pub struct JoinPlan {
    steps: IndexMap<String, JoinStep>,
}

impl JoinPlan {
    /// Adds a step unless a join under the same alias already exists.
    pub fn add(&mut self, step: JoinStep) {
        self.steps.entry(step.alias.clone()).or_insert(step);
    }

    /// Steps in first-seen order.
    pub fn steps(&self) -> impl Iterator<Item = &JoinStep> {
        self.steps.values()
    }

    /// Returns `true` if no join is needed.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of joined tables.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns `true` if any step can multiply base rows.
    pub fn has_to_many(&self) -> bool {
        self.steps.values().any(|s| s.to_many)
    }

    /// Renders all joins, space separated.
    pub fn to_sql(&self, driver: Driver) -> String {
        self.steps
            .values()
            .map(|s| s.to_sql(driver))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One relation hop of a resolved path.
#[derive(Debug, Clone)]
pub struct Hop {
    /// The relation name as written in the path.
    pub name: String,
    /// The relation descriptor.
    pub relation: Relation,
    /// The model the hop lands on.
    pub model: Arc<ModelMeta>,
    /// The alias of the model the hop lands on.
    pub alias: String,
}

/// A fully resolved field path.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    /// The model owning the terminal field.
    pub model: Arc<ModelMeta>,
    /// The model before the last hop, if any.
    pub parent: Option<Arc<ModelMeta>>,
    /// The terminal field, or `None` for `*`.
    pub field: Option<FieldDef>,
    /// Relation hops from the base model.
    pub hops: Vec<Hop>,
    /// Table alias of the terminal model.
    pub alias: String,
    /// Join steps needed to reach the terminal model.
    pub joins: Vec<JoinStep>,
}

impl ResolvedPath {
    /// Relation names traversed, in order.
    pub fn chain(&self) -> Vec<&str> {
        self.hops.iter().map(|h| h.name.as_str()).collect()
    }

    /// The dotted chain, empty for base fields.
    pub fn chain_key(&self) -> String {
        self.chain().join(".")
    }

    /// Returns `true` if the path leaves the base model.
    pub fn is_related(&self) -> bool {
        !self.hops.is_empty()
    }
}

/// Resolves `path` from `base`, allocating aliases in `aliases`.
///
/// # Errors
///
/// - [`QuarryError::FieldNotFound`] if a segment names nothing on its model,
///   or the path ends on a relation with no column of its own.
/// - [`QuarryError::NotARelation`] if a non-terminal segment is a plain field.
/// - [`QuarryError::NotRegistered`] if a relation target was never registered.
pub fn walk(
    registry: &ModelRegistry,
    base: &Arc<ModelMeta>,
    path: &str,
    aliases: &mut AliasGenerator,
) -> QuarryResult<ResolvedPath> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((terminal, relations)) = segments.split_last() else {
        return Err(QuarryError::FieldNotFound(path.to_string()));
    };

    let mut current = Arc::clone(base);
    let mut parent = None;
    let mut alias = aliases.table_alias(&base.table, "");
    let mut hops = Vec::with_capacity(relations.len());
    let mut joins = Vec::new();
    let mut chain = String::new();

    for segment in relations {
        let Some(relation) = current.relation(segment).cloned() else {
            return Err(if current.field(segment).is_some() {
                QuarryError::NotARelation(format!("{}.{segment} in `{path}`", current.name))
            } else {
                QuarryError::FieldNotFound(format!("{}.{segment} in `{path}`", current.name))
            });
        };
        let target = registry.meta(&relation.target)?;
        if !chain.is_empty() {
            chain.push('.');
        }
        chain.push_str(segment);

        let forward = current.forward.contains_key(*segment);
        let target_alias = aliases.table_alias(&target.table, &chain);
        match relation.kind {
            RelationKind::ManyToMany => {
                joins.extend(many_to_many_steps(
                    registry,
                    &current,
                    &alias,
                    &target,
                    &target_alias,
                    &relation,
                    &chain,
                    aliases,
                )?);
            }
            _ if forward => {
                let field = current
                    .field(segment)
                    .ok_or_else(|| QuarryError::FieldNotFound(format!("{}.{segment}", current.name)))?;
                let referenced = referenced_column(&target, relation.target_field.as_deref())?;
                joins.push(JoinStep {
                    from_alias: alias.clone(),
                    table: target.table.clone(),
                    alias: target_alias.clone(),
                    kind: JoinKind::Left,
                    conditions: vec![JoinCondition {
                        left_alias: target_alias.clone(),
                        left_column: referenced,
                        right_alias: alias.clone(),
                        right_column: field.column_name().to_string(),
                    }],
                    to_many: false,
                });
            }
            _ => {
                let back_name = relation.target_field.as_deref().unwrap_or_default();
                let back = target.field(back_name).ok_or_else(|| {
                    QuarryError::FieldNotFound(format!("{}.{back_name}", target.name))
                })?;
                let referenced = referenced_column(
                    &current,
                    back.relation.as_ref().and_then(|r| r.target_field.as_deref()),
                )?;
                joins.push(JoinStep {
                    from_alias: alias.clone(),
                    table: target.table.clone(),
                    alias: target_alias.clone(),
                    kind: JoinKind::Left,
                    conditions: vec![JoinCondition {
                        left_alias: target_alias.clone(),
                        left_column: back.column_name().to_string(),
                        right_alias: alias.clone(),
                        right_column: referenced,
                    }],
                    to_many: relation.kind.is_to_many(),
                });
            }
        }

        hops.push(Hop {
            name: (*segment).to_string(),
            relation,
            model: Arc::clone(&target),
            alias: target_alias.clone(),
        });
        parent = Some(std::mem::replace(&mut current, target));
        alias = target_alias;
    }

    let field = if *terminal == "*" {
        None
    } else if let Some(field) = current.field(terminal) {
        if field.column.is_none() && field.computed.is_none() {
            return Err(QuarryError::FieldNotFound(format!(
                "{}.{terminal} is a many-to-many relation; select `{terminal}.*` or a field on it",
                current.name
            )));
        }
        Some(field.clone())
    } else if current.reverse.contains_key(*terminal) {
        return Err(QuarryError::FieldNotFound(format!(
            "{}.{terminal} is a reverse relation; select `{terminal}.*` or a field on it",
            current.name
        )));
    } else {
        return Err(QuarryError::FieldNotFound(format!(
            "{}.{terminal}",
            current.name
        )));
    };

    Ok(ResolvedPath {
        model: current,
        parent,
        field,
        hops,
        alias,
        joins,
    })
}

fn referenced_column(model: &ModelMeta, field: Option<&str>) -> QuarryResult<String> {
    match field {
        Some(name) => model
            .field(name)
            .map(|f| f.column_name().to_string())
            .ok_or_else(|| QuarryError::FieldNotFound(format!("{}.{name}", model.name))),
        None => Ok(model.primary().column_name().to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
fn many_to_many_steps(
    registry: &ModelRegistry,
    source: &ModelMeta,
    source_alias: &str,
    target: &ModelMeta,
    target_alias: &str,
    relation: &Relation,
    chain: &str,
    aliases: &mut AliasGenerator,
) -> QuarryResult<[JoinStep; 2]> {
    let through = relation.through.as_ref().ok_or_else(|| {
        QuarryError::ConfigurationError(format!(
            "many-to-many relation {}.{chain} has no through model",
            source.name
        ))
    })?;
    let link = registry.meta(&through.model)?;
    let link_alias = aliases.table_alias(&link.table, &format!("{chain}__through"));
    let key = |name: &str| {
        link.field(name)
            .ok_or_else(|| QuarryError::FieldNotFound(format!("{}.{name}", link.name)))
    };
    let source_key = key(&through.source_field)?;
    let target_key = key(&through.target_field)?;
    let source_col = referenced_column(
        source,
        source_key.relation.as_ref().and_then(|r| r.target_field.as_deref()),
    )?;
    let target_col = referenced_column(
        target,
        target_key.relation.as_ref().and_then(|r| r.target_field.as_deref()),
    )?;

    Ok([
        JoinStep {
            from_alias: source_alias.to_string(),
            table: link.table.clone(),
            alias: link_alias.clone(),
            kind: JoinKind::Left,
            conditions: vec![JoinCondition {
                left_alias: link_alias.clone(),
                left_column: source_key.column_name().to_string(),
                right_alias: source_alias.to_string(),
                right_column: source_col,
            }],
            to_many: true,
        },
        JoinStep {
            from_alias: link_alias.clone(),
            table: target.table.clone(),
            alias: target_alias.to_string(),
            kind: JoinKind::Left,
            conditions: vec![JoinCondition {
                left_alias: target_alias.to_string(),
                left_column: target_col,
                right_alias: link_alias,
                right_column: target_key.column_name().to_string(),
            }],
            to_many: false,
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn resolve(model: &str, path: &str) -> QuarryResult<(ResolvedPath, AliasGenerator)> {
        let registry = testing::registry();
        let base = registry.meta(model)?;
        let mut aliases = AliasGenerator::new();
        let resolved = walk(&registry, &base, path, &mut aliases)?;
        Ok((resolved, aliases))
    }

    #[test]
    fn test_plain_field() {
        let (p, _) = resolve("Todo", "Title").unwrap();
        assert!(!p.is_related());
        assert_eq!(p.alias, "todos");
        assert_eq!(p.field.unwrap().column_name(), "title");
        assert!(p.joins.is_empty());
    }

    #[test]
    fn test_forward_chain() {
        let (p, _) = resolve("Todo", "User.Profile.Email").unwrap();
        assert_eq!(p.chain(), vec!["User", "Profile"]);
        assert_eq!(p.model.name, "Profile");
        assert_eq!(p.parent.unwrap().name, "User");
        assert_eq!(p.joins.len(), 2);
        assert_eq!(
            p.joins[0].to_sql(Driver::Postgres),
            r#"LEFT JOIN "users" ON "users"."id" = "todos"."user_id""#
        );
        assert_eq!(
            p.joins[1].to_sql(Driver::Postgres),
            r#"LEFT JOIN "profiles" ON "profiles"."id" = "users"."profile_id""#
        );
    }

    #[test]
    fn test_reverse_relation() {
        let (p, _) = resolve("User", "TodoSet.Title").unwrap();
        assert!(p.joins[0].to_many);
        assert_eq!(
            p.joins[0].to_sql(Driver::Sqlite),
            r#"LEFT JOIN "todos" ON "todos"."user_id" = "users"."id""#
        );
    }

    #[test]
    fn test_many_to_many_two_steps() {
        let (p, _) = resolve("Todo", "Tags.Name").unwrap();
        assert_eq!(p.joins.len(), 2);
        assert_eq!(
            p.joins[0].to_sql(Driver::MySql),
            "LEFT JOIN `todo_tags` ON `todo_tags`.`todo_id` = `todos`.`id`"
        );
        assert_eq!(
            p.joins[1].to_sql(Driver::MySql),
            "LEFT JOIN `tags` ON `tags`.`id` = `todo_tags`.`tag_id`"
        );
    }

    #[test]
    fn test_reverse_many_to_many() {
        let (p, _) = resolve("Tag", "TodoSet.Title").unwrap();
        assert_eq!(
            p.joins[0].to_sql(Driver::Sqlite),
            r#"LEFT JOIN "todo_tags" ON "todo_tags"."tag_id" = "tags"."id""#
        );
        assert_eq!(
            p.joins[1].to_sql(Driver::Sqlite),
            r#"LEFT JOIN "todos" ON "todos"."id" = "todo_tags"."todo_id""#
        );
    }

    #[test]
    fn test_recursive_aliases() {
        let (p, _) = resolve("Category", "Parent.Parent.Name").unwrap();
        assert_eq!(p.alias, "categories_1");
        assert_eq!(
            p.joins[0].to_sql(Driver::Postgres),
            r#"LEFT JOIN "categories" AS "categories_0" ON "categories_0"."id" = "categories"."parent_id""#
        );
        assert_eq!(
            p.joins[1].to_sql(Driver::Postgres),
            r#"LEFT JOIN "categories" AS "categories_1" ON "categories_1"."id" = "categories_0"."parent_id""#
        );
    }

    #[test]
    fn test_star_terminal() {
        let (p, _) = resolve("Todo", "User.*").unwrap();
        assert!(p.field.is_none());
        assert_eq!(p.model.name, "User");
    }

    #[test]
    fn test_bare_foreign_key_selects_column() {
        let (p, _) = resolve("Todo", "User").unwrap();
        assert!(p.joins.is_empty());
        assert_eq!(p.field.unwrap().column_name(), "user_id");
    }

    #[test]
    fn test_dead_ends() {
        assert!(matches!(
            resolve("Todo", "Nope.Title"),
            Err(QuarryError::FieldNotFound(_))
        ));
        assert!(matches!(
            resolve("Todo", "Title.Name"),
            Err(QuarryError::NotARelation(_))
        ));
        assert!(matches!(
            resolve("Todo", "User.Nope"),
            Err(QuarryError::FieldNotFound(ref m)) if m == "User.Nope"
        ));
        assert!(matches!(
            resolve("User", "TodoSet"),
            Err(QuarryError::FieldNotFound(_))
        ));
    }

    #[test]
    fn test_join_plan_dedupes_by_alias() {
        let registry = testing::registry();
        let base = registry.meta("Todo").unwrap();
        let mut aliases = AliasGenerator::new();
        let mut plan = JoinPlan::default();
        for path in ["User.Name", "User.Profile.Email", "User.ID"] {
            for step in walk(&registry, &base, path, &mut aliases).unwrap().joins {
                plan.add(step);
            }
        }
        assert_eq!(plan.len(), 2);
        assert!(!plan.has_to_many());
    }
}

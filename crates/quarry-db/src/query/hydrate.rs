//! Row hydration.
//!
//! A [`RowPlan`] records, for every selected column, which node of the
//! selection tree it feeds. Node 0 is the base model; every other node is a
//! relation chain (`User`, `User.Profile`) hanging off its parent chain.
//!
//! Hydration rebuilds object graphs from flat join rows. Each node instance
//! lives in an arena slot; a slot maps `relation -> key -> child slot`, so a
//! child repeated across rows (a parent multiplied by a to-many join) is
//! found again instead of duplicated. Keys are the child's primary key when
//! selected, a constant for to-one relations, and the row index otherwise.
//! Related instances are attached bottom-up through
//! [`Instance::set_related`] once every row is read.
//!
//! A node is present in a row when one of its own columns, or one of its
//! descendants' columns, is non-NULL. A forward to-one node that selects no
//! columns of its own (`User` in `User.Profile.*`) is present exactly when
//! the parent's foreign key is, and carries that key.

use std::sync::Arc;

use indexmap::IndexMap;
use quarry_core::{QuarryError, QuarryResult};

use crate::executor::QueryContext;
use crate::fields::FieldDef;
use crate::model::{downcast, Instance, Model, ModelMeta};
use crate::query::walker::ResolvedPath;
use crate::registry::ModelRegistry;
use crate::row::Row;
use crate::value::{Value, ValueKey};

/// A hydrated object plus the annotation values selected with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRow<M> {
    /// The model instance with its selected relations attached.
    pub object: M,
    /// Annotation values by name, in declaration order.
    pub annotations: IndexMap<String, Value>,
}

#[derive(Debug, Clone)]
struct Stub {
    model: Arc<ModelMeta>,
    field: FieldDef,
}

impl Stub {
    fn key(&self, value: Value) -> QuarryResult<Value> {
        value.convert_to(
            &self.field.field_type,
            &format!("{}.{}", self.model.name, self.field.name),
        )
    }
}

#[derive(Debug, Clone)]
struct PlanColumn {
    field: FieldDef,
    index: usize,
    stub: Option<Stub>,
}

#[derive(Debug, Clone)]
struct PlanNode {
    chain: String,
    parent: Option<usize>,
    relation: String,
    to_many: bool,
    model: Arc<ModelMeta>,
    columns: Vec<PlanColumn>,
}

impl PlanNode {
    fn key(&self, values: &[Value]) -> Option<ValueKey> {
        self.columns
            .iter()
            .find(|c| c.field.primary_key)
            .map(|c| values[c.index].key())
    }

    fn any_set(&self, values: &[Value]) -> bool {
        self.columns.iter().any(|c| !values[c.index].is_null())
    }

    /// Builds the node's instance. `link` is the parent column holding the
    /// foreign key this node is reached through; its value fills the key
    /// field when the node does not select it.
    fn build(&self, values: &[Value], link: Option<&PlanColumn>) -> QuarryResult<Box<dyn Instance>> {
        let mut instance = self.model.new_instance();
        for column in &self.columns {
            self.assign(instance.as_mut(), column, values[column.index].clone())?;
        }
        if let Some((column, stub)) = link.and_then(|c| c.stub.as_ref().map(|s| (c, s))) {
            let value = &values[column.index];
            if !value.is_null() && !self.columns.iter().any(|c| c.field.name == stub.field.name) {
                instance.set_field(stub.field.name, stub.key(value.clone())?)?;
            }
        }
        Ok(instance)
    }

    fn assign(&self, instance: &mut dyn Instance, column: &PlanColumn, value: Value) -> QuarryResult<()> {
        let field = &column.field;
        let qualified = format!("{}.{}", self.model.name, field.name);

        let value = if value.is_null() {
            if field.computed.is_some() || (field.null && column.stub.is_some()) {
                return Ok(());
            }
            if field.null {
                return instance.set_field(field.name, Value::Null);
            }
            match &field.default {
                Some(default) => default.clone(),
                None => return Err(QuarryError::FieldNull(qualified)),
            }
        } else {
            value
        };

        match &column.stub {
            Some(stub) => {
                let mut related = stub.model.new_instance();
                related.set_field(stub.field.name, stub.key(value)?)?;
                instance.set_related(field.name, related)
            }
            None => instance.set_field(field.name, value.convert_to(&field.field_type, &qualified)?),
        }
    }
}

/// The column layout of a SELECT and the selection tree it hydrates into.
#[derive(Debug, Clone)]
pub struct RowPlan {
    nodes: Vec<PlanNode>,
    annotations: Vec<(String, usize)>,
    width: usize,
}

impl RowPlan {
    /// A plan rooted at `base` with no columns yet.
    pub fn new(base: Arc<ModelMeta>) -> Self {
        Self {
            nodes: vec![PlanNode {
                chain: String::new(),
                parent: None,
                relation: String::new(),
                to_many: false,
                model: base,
                columns: Vec::new(),
            }],
            annotations: Vec::new(),
            width: 0,
        }
    }

    /// Number of columns each row must carry.
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Returns the node for the chain `resolved` ends on, creating it and
    /// any missing ancestors.
    pub fn node(&mut self, resolved: &ResolvedPath) -> usize {
        let mut current = 0;
        let mut chain = String::new();
        for hop in &resolved.hops {
            if !chain.is_empty() {
                chain.push('.');
            }
            chain.push_str(&hop.name);
            current = match self.nodes.iter().position(|n| n.chain == chain) {
                Some(existing) => existing,
                None => {
                    self.nodes.push(PlanNode {
                        chain: chain.clone(),
                        parent: Some(current),
                        relation: hop.name.clone(),
                        to_many: hop.relation.kind.is_to_many(),
                        model: Arc::clone(&hop.model),
                        columns: Vec::new(),
                    });
                    self.nodes.len() - 1
                }
            };
        }
        current
    }

    /// Allocates the next column to `field` on `node`. Returns `false`
    /// without allocating if the node already selects the field.
    pub fn add_field(
        &mut self,
        registry: &ModelRegistry,
        node: usize,
        field: &FieldDef,
    ) -> QuarryResult<bool> {
        if self.nodes[node].columns.iter().any(|c| c.field.name == field.name) {
            return Ok(false);
        }
        let stub = match field.relation.as_ref().filter(|_| field.is_forward_key()) {
            Some(rel) => {
                let model = registry.meta(&rel.target)?;
                let target = match &rel.target_field {
                    Some(name) => model.field(name).cloned().ok_or_else(|| {
                        QuarryError::FieldNotFound(format!("{}.{name}", model.name))
                    })?,
                    None => model.primary().clone(),
                };
                Some(Stub {
                    model,
                    field: target,
                })
            }
            None => None,
        };
        self.nodes[node].columns.push(PlanColumn {
            field: field.clone(),
            index: self.width,
            stub,
        });
        self.width += 1;
        Ok(true)
    }

    /// The parent column holding the foreign key a forward to-one node is
    /// reached through, if the parent selects it.
    fn link(&self, node: &PlanNode) -> Option<&PlanColumn> {
        if node.to_many {
            return None;
        }
        self.nodes[node.parent?]
            .columns
            .iter()
            .find(|c| c.field.name == node.relation && c.stub.is_some())
    }

    /// Which nodes have data in a row: a node is live when it or any
    /// descendant has a non-NULL column. Children always follow their
    /// parent in `nodes`.
    fn live(&self, values: &[Value]) -> Vec<bool> {
        let mut live: Vec<bool> = self.nodes.iter().map(|n| n.any_set(values)).collect();
        for n in (1..self.nodes.len()).rev() {
            if let (true, Some(parent)) = (live[n], self.nodes[n].parent) {
                live[parent] = true;
            }
        }
        live
    }

    /// Allocates the next column to an annotation.
    pub fn add_annotation(&mut self, name: &str) {
        self.annotations.push((name.to_string(), self.width));
        self.width += 1;
    }

    /// Builds one object graph per distinct base row.
    ///
    /// # Errors
    ///
    /// Fails on a row of the wrong width, a conversion error, a NULL for a
    /// non-nullable field without default, or cancellation of `ctx`.
    pub fn hydrate<M: Model>(
        &self,
        rows: Vec<Row>,
        ctx: &QueryContext,
    ) -> QuarryResult<Vec<ObjectRow<M>>> {
        let total = rows.len();
        let mut arena: Vec<Slot> = Vec::new();
        let mut roots: IndexMap<ValueKey, (usize, IndexMap<String, Value>)> = IndexMap::new();

        for (row_index, row) in rows.into_iter().enumerate() {
            ctx.check("hydrate")?;
            if row.len() != self.width {
                return Err(QuarryError::DatabaseError(format!(
                    "row {row_index} has {} columns, expected {}",
                    row.len(),
                    self.width
                )));
            }
            let values = row.into_values();
            let position = ValueKey::Int(i64::try_from(row_index).unwrap_or(i64::MAX));
            let mut placed: Vec<Option<usize>> = vec![None; self.nodes.len()];
            let live = self.live(&values);

            for (n, node) in self.nodes.iter().enumerate() {
                let Some(parent) = node.parent else {
                    let key = node.key(&values).unwrap_or_else(|| position.clone());
                    let id = match roots.get(&key) {
                        Some((id, _)) => *id,
                        None => {
                            let id = alloc(&mut arena, node.build(&values, None)?);
                            let annotations = self
                                .annotations
                                .iter()
                                .map(|(name, i)| (name.clone(), values[*i].clone()))
                                .collect();
                            roots.insert(key, (id, annotations));
                            id
                        }
                    };
                    placed[n] = Some(id);
                    continue;
                };

                let Some(parent_id) = placed[parent] else {
                    continue;
                };
                let link = self.link(node);
                let present = match link {
                    Some(column) if node.columns.is_empty() => !values[column.index].is_null(),
                    _ => live[n],
                };
                if !present {
                    continue;
                }
                let key = node.key(&values).unwrap_or_else(|| {
                    if node.to_many {
                        position.clone()
                    } else {
                        ValueKey::Null
                    }
                });
                let existing = arena[parent_id]
                    .children
                    .get(&node.relation)
                    .and_then(|children| children.get(&key))
                    .copied();
                let id = match existing {
                    Some(id) => id,
                    None => {
                        let id = alloc(&mut arena, node.build(&values, link)?);
                        arena[parent_id]
                            .children
                            .entry(node.relation.clone())
                            .or_default()
                            .insert(key, id);
                        id
                    }
                };
                placed[n] = Some(id);
            }
        }

        let mut out = Vec::with_capacity(roots.len());
        for (_, (id, annotations)) in roots {
            let instance = finish(&mut arena, id)?;
            out.push(ObjectRow {
                object: downcast::<M>(instance)?,
                annotations,
            });
        }
        tracing::trace!(rows = total, objects = out.len(), nodes = arena.len(), "hydrated");
        Ok(out)
    }
}

struct Slot {
    instance: Option<Box<dyn Instance>>,
    children: IndexMap<String, IndexMap<ValueKey, usize>>,
}

fn alloc(arena: &mut Vec<Slot>, instance: Box<dyn Instance>) -> usize {
    arena.push(Slot {
        instance: Some(instance),
        children: IndexMap::new(),
    });
    arena.len() - 1
}

fn finish(arena: &mut [Slot], id: usize) -> QuarryResult<Box<dyn Instance>> {
    let children = std::mem::take(&mut arena[id].children);
    let mut instance = arena[id]
        .instance
        .take()
        .ok_or_else(|| QuarryError::NilPointer(format!("hydration slot {id} used twice")))?;
    for (relation, kids) in children {
        for kid in kids.into_values() {
            let child = finish(arena, kid)?;
            instance.set_related(&relation, child)?;
        }
    }
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::alias::AliasGenerator;
    use crate::query::walker::walk;
    use crate::testing::{self, Category, Todo};

    fn plan(model: &str, paths: &[&str]) -> RowPlan {
        let registry = testing::registry();
        let base = registry.meta(model).unwrap();
        let mut aliases = AliasGenerator::new();
        let mut plan = RowPlan::new(Arc::clone(&base));
        for path in paths {
            let resolved = walk(&registry, &base, path, &mut aliases).unwrap();
            let node = plan.node(&resolved);
            match &resolved.field {
                Some(field) => {
                    plan.add_field(&registry, node, field).unwrap();
                }
                None => {
                    for field in resolved.model.star_fields() {
                        plan.add_field(&registry, node, field).unwrap();
                    }
                }
            }
        }
        plan
    }

    fn row(values: Vec<Value>) -> Row {
        let columns = (0..values.len()).map(|i| format!("c{i}")).collect();
        Row::new(columns, values)
    }

    #[test]
    fn test_to_many_join_dedupes_parents() {
        // todos: id, title, done, user_id | tags: id, name
        let plan = plan("Todo", &["*", "Tags.*"]);
        assert_eq!(plan.width(), 6);
        let rows = vec![
            row(vec![1.into(), "a".into(), false.into(), Value::Null, 10.into(), "x".into()]),
            row(vec![1.into(), "a".into(), false.into(), Value::Null, 11.into(), "y".into()]),
            row(vec![2.into(), "b".into(), true.into(), Value::Null, Value::Null, Value::Null]),
        ];
        let todos: Vec<Todo> = plan
            .hydrate::<Todo>(rows, &QueryContext::background())
            .unwrap()
            .into_iter()
            .map(|r| r.object)
            .collect();
        assert_eq!(todos.len(), 2);
        assert_eq!(todos[0].tags.iter().map(|t| t.id).collect::<Vec<_>>(), vec![10, 11]);
        assert!(todos[1].tags.is_empty());
        assert!(todos[1].done);
    }

    #[test]
    fn test_forward_key_becomes_stub() {
        let plan = plan("Todo", &["*"]);
        let rows = vec![row(vec![1.into(), "a".into(), 0.into(), 7.into()])];
        let todo = &plan.hydrate::<Todo>(rows, &QueryContext::background()).unwrap()[0].object;
        assert_eq!(todo.user.as_ref().map(|u| u.id), Some(7));
        assert!(!todo.done);
    }

    #[test]
    fn test_intermediate_nodes_and_recursion() {
        // categories: id, name, parent_id | Parent: id | Parent.Parent: id, name, parent_id
        let plan = plan("Category", &["*", "Parent.ID", "Parent.Parent.*"]);
        let rows = vec![row(vec![
            3.into(),
            "Grandchild".into(),
            2.into(),
            2.into(),
            1.into(),
            "Root".into(),
            Value::Null,
        ])];
        let cat: Category = plan
            .hydrate::<Category>(rows, &QueryContext::background())
            .unwrap()
            .remove(0)
            .object;
        let parent = cat.parent.unwrap();
        assert_eq!(parent.id, 2);
        assert_eq!(parent.name, "");
        let grandparent = parent.parent.unwrap();
        assert_eq!(grandparent.name, "Root");
        assert!(grandparent.parent.is_none());
    }

    #[test]
    fn test_missing_relation_is_skipped() {
        let plan = plan("Todo", &["*", "User.*"]);
        let mut values = vec![1.into(), "a".into(), false.into(), Value::Null];
        values.extend(std::iter::repeat(Value::Null).take(plan.width() - 4));
        let todo = &plan
            .hydrate::<Todo>(vec![row(values)], &QueryContext::background())
            .unwrap()[0]
            .object;
        assert!(todo.user.is_none());
    }

    #[test]
    fn test_columnless_intermediate_keeps_foreign_key() {
        // todos: id, title, done, user_id | User: none | User.Profile: id, name, email, image_id
        let plan = plan("Todo", &["*", "User.Profile.*"]);
        assert_eq!(plan.width(), 8);
        let rows = vec![
            row(vec![
                1.into(),
                "a".into(),
                false.into(),
                5.into(),
                9.into(),
                "n".into(),
                "e".into(),
                Value::Null,
            ]),
            row(vec![
                2.into(),
                "b".into(),
                false.into(),
                Value::Null,
                Value::Null,
                Value::Null,
                Value::Null,
                Value::Null,
            ]),
        ];
        let todos: Vec<Todo> = plan
            .hydrate::<Todo>(rows, &QueryContext::background())
            .unwrap()
            .into_iter()
            .map(|r| r.object)
            .collect();
        assert_eq!(todos.len(), 2);

        let user = todos[0].user.as_ref().unwrap();
        assert_eq!(user.id, 5);
        let profile = user.profile.as_ref().unwrap();
        assert_eq!(profile.id, 9);
        assert_eq!(profile.email, "e");

        assert!(todos[1].user.is_none());
    }

    #[test]
    fn test_columnless_intermediate_without_link_follows_descendants() {
        // User.Profile is reached without selecting todos.user_id
        let plan = plan("Todo", &["ID", "User.Profile.ID"]);
        let rows = vec![
            row(vec![1.into(), 9.into()]),
            row(vec![2.into(), Value::Null]),
        ];
        let todos: Vec<Todo> = plan
            .hydrate::<Todo>(rows, &QueryContext::background())
            .unwrap()
            .into_iter()
            .map(|r| r.object)
            .collect();
        let profile = todos[0].user.as_ref().and_then(|u| u.profile.as_ref());
        assert_eq!(profile.map(|p| p.id), Some(9));
        assert!(todos[1].user.is_none());
    }

    #[test]
    fn test_null_into_required_field() {
        let plan = plan("Todo", &["ID", "Title"]);
        let err = plan
            .hydrate::<Todo>(vec![row(vec![1.into(), Value::Null])], &QueryContext::background())
            .unwrap_err();
        assert!(matches!(err, QuarryError::FieldNull(ref f) if f == "Todo.Title"));
    }

    #[test]
    fn test_default_fills_null() {
        let plan = plan("Todo", &["ID", "Done"]);
        let rows = vec![row(vec![1.into(), Value::Null])];
        let todo = &plan.hydrate::<Todo>(rows, &QueryContext::background()).unwrap()[0].object;
        assert!(!todo.done);
    }

    #[test]
    fn test_width_mismatch() {
        let plan = plan("Todo", &["ID"]);
        let err = plan
            .hydrate::<Todo>(vec![row(vec![1.into(), 2.into()])], &QueryContext::background())
            .unwrap_err();
        assert!(matches!(err, QuarryError::DatabaseError(_)));
    }

    #[test]
    fn test_cancelled_between_rows() {
        let plan = plan("Todo", &["ID"]);
        let ctx = QueryContext::background();
        ctx.cancel();
        let err = plan.hydrate::<Todo>(vec![row(vec![1.into()])], &ctx).unwrap_err();
        assert!(matches!(err, QuarryError::Cancelled(_)));
    }

    #[test]
    fn test_annotations_carried() {
        let mut plan = plan("Todo", &["ID"]);
        plan.add_annotation("Shout");
        let rows = vec![row(vec![1.into(), "A".into()])];
        let out = plan.hydrate::<Todo>(rows, &QueryContext::background()).unwrap();
        assert_eq!(out[0].annotations.get("Shout"), Some(&Value::from("A")));
    }
}

//! The model metadata registry.
//!
//! Registration happens in two phases. A [`RegistryBuilder`] collects model
//! definitions; [`RegistryBuilder::build`] closes registration, validates every
//! relation, derives the reverse relation maps by scanning all registered
//! models once, and returns an immutable [`ModelRegistry`] that can be shared
//! between threads.
//!
//! Code that prefers registering at startup from scattered call-sites can use
//! the [`global`] facade, which rebuilds its registry lazily after each new
//! registration.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use quarry_core::{QuarryError, QuarryResult};

use crate::fields::{Relation, RelationKind};
use crate::model::{new_boxed, Instance, Model, ModelDef, ModelMeta};

struct Entry {
    def: ModelDef,
    type_id: TypeId,
    factory: fn() -> Box<dyn Instance>,
}

/// Collects model definitions before the registry is built.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: IndexMap<&'static str, Entry>,
}

impl RegistryBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `M`. Registering the same name again replaces the earlier
    /// definition.
    pub fn register<M: Model>(&mut self) -> &mut Self {
        let def = M::definition();
        self.entries.insert(
            def.name,
            Entry {
                def,
                type_id: TypeId::of::<M>(),
                factory: new_boxed::<M>,
            },
        );
        self
    }

    /// Closes registration and resolves all relations.
    ///
    /// # Errors
    ///
    /// - [`QuarryError::NotRegistered`] if a relation targets an unknown model.
    /// - [`QuarryError::ConfigurationError`] for a model without exactly one
    ///   primary key, a many-to-many field without a valid through model, or
    ///   two reverse relations sharing a name.
    pub fn build(&self) -> QuarryResult<ModelRegistry> {
        let mut metas: IndexMap<&'static str, ModelMeta> = IndexMap::new();
        for (name, entry) in &self.entries {
            let primaries: Vec<usize> = entry
                .def
                .fields
                .iter()
                .enumerate()
                .filter(|(_, f)| f.primary_key)
                .map(|(i, _)| i)
                .collect();
            let [primary] = primaries[..] else {
                return Err(QuarryError::ConfigurationError(format!(
                    "model {name} must declare exactly one primary key, found {}",
                    primaries.len()
                )));
            };

            let forward = entry
                .def
                .fields
                .iter()
                .filter_map(|f| f.relation.clone().map(|r| (f.name.to_string(), r)))
                .collect();

            metas.insert(
                name,
                ModelMeta {
                    name,
                    table: entry.def.table.clone(),
                    fields: entry.def.fields.clone(),
                    forward,
                    reverse: IndexMap::new(),
                    primary,
                    type_id: entry.type_id,
                    factory: entry.factory,
                },
            );
        }

        let mut reverse: Vec<(String, String, Relation)> = Vec::new();
        for meta in metas.values() {
            for (field_name, rel) in &meta.forward {
                let Some(target) = metas.get(rel.target.as_str()) else {
                    return Err(QuarryError::NotRegistered(format!(
                        "{} (target of {}.{field_name})",
                        rel.target, meta.name
                    )));
                };
                if let Some(target_field) = &rel.target_field {
                    if target.field(target_field).is_none() {
                        return Err(QuarryError::FieldNotFound(format!(
                            "{}.{target_field} (referenced by {}.{field_name})",
                            target.name, meta.name
                        )));
                    }
                }
                if rel.kind == RelationKind::ManyToMany {
                    validate_through(&metas, meta.name, field_name, rel)?;
                }

                let default_name = if rel.kind.reversed().is_to_many() {
                    format!("{}Set", meta.name)
                } else {
                    meta.name.to_string()
                };
                let name = rel.related_name.clone().unwrap_or(default_name);
                let mut back = Relation::new(rel.kind.reversed(), meta.name);
                back.target_field = Some(field_name.clone());
                back.through = rel.through.as_ref().map(crate::fields::Through::swapped);
                reverse.push((rel.target.clone(), name, back));
            }
        }

        for (target, name, rel) in reverse {
            let Some(meta) = metas.get_mut(target.as_str()) else {
                continue;
            };
            if meta.forward.contains_key(&name) || meta.field(&name).is_some() {
                return Err(QuarryError::ConfigurationError(format!(
                    "reverse relation {target}.{name} clashes with a declared field"
                )));
            }
            if meta.reverse.insert(name.clone(), rel).is_some() {
                return Err(QuarryError::ConfigurationError(format!(
                    "reverse relation {target}.{name} is declared twice; set related_name"
                )));
            }
        }

        let by_type = metas.values().map(|m| (m.type_id, m.name)).collect();
        let models = metas
            .into_iter()
            .map(|(name, meta)| (name, Arc::new(meta)))
            .collect();
        tracing::debug!(models = self.entries.len(), "model registry built");
        Ok(ModelRegistry { models, by_type })
    }
}

fn validate_through(
    metas: &IndexMap<&'static str, ModelMeta>,
    model: &str,
    field: &str,
    rel: &Relation,
) -> QuarryResult<()> {
    let Some(through) = &rel.through else {
        return Err(QuarryError::ConfigurationError(format!(
            "many-to-many field {model}.{field} needs a through model"
        )));
    };
    let Some(through_meta) = metas.get(through.model.as_str()) else {
        return Err(QuarryError::NotRegistered(format!(
            "{} (through model of {model}.{field})",
            through.model
        )));
    };
    for (key, expected) in [
        (&through.source_field, model),
        (&through.target_field, rel.target.as_str()),
    ] {
        let points_at = through_meta
            .field(key)
            .filter(|f| f.is_forward_key())
            .and_then(|f| f.relation.as_ref())
            .map(|r| r.target.as_str());
        if points_at != Some(expected) {
            return Err(QuarryError::ConfigurationError(format!(
                "through model {}.{key} must be a foreign key to {expected} (for {model}.{field})",
                through.model
            )));
        }
    }
    Ok(())
}

/// The immutable, shareable model registry.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<&'static str, Arc<ModelMeta>>,
    by_type: HashMap<TypeId, &'static str>,
}

impl ModelRegistry {
    /// Starts a new builder.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Returns the metadata registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::NotRegistered`] for an unknown name.
    pub fn meta(&self, name: &str) -> QuarryResult<Arc<ModelMeta>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| QuarryError::NotRegistered(name.to_string()))
    }

    /// Returns the metadata for the Rust type `M`.
    pub fn meta_of<M: Model>(&self) -> QuarryResult<Arc<ModelMeta>> {
        self.by_type
            .get(&TypeId::of::<M>())
            .and_then(|name| self.models.get(name))
            .cloned()
            .ok_or_else(|| QuarryError::NotRegistered(std::any::type_name::<M>().to_string()))
    }

    /// Builds a fresh default instance of the model registered under `name`.
    pub fn new_instance(&self, name: &str) -> QuarryResult<Box<dyn Instance>> {
        Ok(self.meta(name)?.new_instance())
    }

    /// Iterates registered models in registration order.
    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelMeta>> {
        self.models.values()
    }

    /// Returns `true` if no model is registered.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Process-wide registration facade.
///
/// Call [`global::register`] during startup, then [`global::registry`] to get
/// the built registry. The reverse maps are derived on the first
/// [`global::registry`] call after the latest registration.
pub mod global {
    use std::sync::{Arc, RwLock};

    use once_cell::sync::Lazy;
    use quarry_core::{QuarryError, QuarryResult};

    use super::{ModelRegistry, RegistryBuilder};
    use crate::model::Model;

    #[derive(Default)]
    struct State {
        builder: RegistryBuilder,
        built: Option<Arc<ModelRegistry>>,
    }

    static STATE: Lazy<RwLock<State>> = Lazy::new(|| RwLock::new(State::default()));

    fn poisoned() -> QuarryError {
        QuarryError::ConfigurationError("global model registry lock poisoned".to_string())
    }

    /// Registers `M` globally and invalidates the built registry.
    pub fn register<M: Model>() -> QuarryResult<()> {
        let mut state = STATE.write().map_err(|_| poisoned())?;
        state.builder.register::<M>();
        state.built = None;
        Ok(())
    }

    /// Returns the global registry, building it if registration changed.
    pub fn registry() -> QuarryResult<Arc<ModelRegistry>> {
        if let Some(built) = STATE.read().map_err(|_| poisoned())?.built.clone() {
            return Ok(built);
        }
        let mut state = STATE.write().map_err(|_| poisoned())?;
        if let Some(built) = state.built.clone() {
            return Ok(built);
        }
        let built = Arc::new(state.builder.build()?);
        state.built = Some(Arc::clone(&built));
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldDef, FieldType};
    use crate::testing::{self, Author, Category, Tag, Todo, TodoTag, User};

    #[test]
    fn test_meta_tables_and_primary() {
        let registry = testing::registry();
        let todo = registry.meta("Todo").unwrap();
        assert_eq!(todo.table, "todos");
        assert_eq!(todo.primary().name, "ID");
        assert!(todo.is::<Todo>());
        assert_eq!(registry.meta_of::<User>().unwrap().name, "User");
    }

    #[test]
    fn test_not_registered() {
        let registry = testing::registry();
        assert!(matches!(
            registry.meta("Ghost"),
            Err(QuarryError::NotRegistered(ref n)) if n == "Ghost"
        ));
    }

    #[test]
    fn test_forward_relations() {
        let registry = testing::registry();
        let todo = registry.meta("Todo").unwrap();
        let user = todo.forward.get("User").unwrap();
        assert_eq!(user.kind, RelationKind::ManyToOne);
        assert_eq!(user.target, "User");
    }

    #[test]
    fn test_reverse_relations_default_names() {
        let registry = testing::registry();
        let user = registry.meta("User").unwrap();
        let todos = user.reverse.get("TodoSet").unwrap();
        assert_eq!(todos.kind, RelationKind::OneToMany);
        assert_eq!(todos.target, "Todo");
        assert_eq!(todos.target_field.as_deref(), Some("User"));

        // One-to-one reverse keeps the bare model name.
        let profile = registry.meta("Profile").unwrap();
        assert_eq!(profile.reverse.get("User").unwrap().kind, RelationKind::OneToOne);
    }

    #[test]
    fn test_reverse_relation_related_name() {
        let registry = testing::registry();
        let author = registry.meta_of::<Author>().unwrap();
        assert!(author.reverse.contains_key("Books"));
    }

    #[test]
    fn test_reverse_many_to_many_swaps_through() {
        let registry = testing::registry();
        let tag = registry.meta_of::<Tag>().unwrap();
        let todos = tag.reverse.get("TodoSet").unwrap();
        assert_eq!(todos.kind, RelationKind::ManyToMany);
        let through = todos.through.as_ref().unwrap();
        assert_eq!(through.model, "TodoTag");
        assert_eq!(through.source_field, "Tag");
        assert_eq!(through.target_field, "Todo");
    }

    #[test]
    fn test_self_reference() {
        let registry = testing::registry();
        let cat = registry.meta_of::<Category>().unwrap();
        assert_eq!(cat.forward.get("Parent").unwrap().target, "Category");
        assert!(cat.reverse.contains_key("CategorySet"));
    }

    #[test]
    fn test_missing_target_fails_build() {
        let mut builder = RegistryBuilder::new();
        builder.register::<Todo>();
        assert!(matches!(builder.build(), Err(QuarryError::NotRegistered(_))));
    }

    #[test]
    fn test_through_must_point_at_both_ends() {
        #[derive(Debug, Default, Clone)]
        struct BadLink;

        impl Instance for BadLink {
            fn model_name(&self) -> &'static str {
                "TodoTag"
            }
            fn get_field(&self, _: &str) -> Option<crate::value::Value> {
                None
            }
            fn set_field(&mut self, _: &str, _: crate::value::Value) -> QuarryResult<()> {
                Ok(())
            }
        }

        impl Model for BadLink {
            fn definition() -> ModelDef {
                ModelDef::new("TodoTag", "todo_tags")
                    .field(FieldDef::new("ID", FieldType::BigAutoField).primary_key())
                    .field(FieldDef::foreign_key("Todo", "Todo", "todo_id"))
                    .field(FieldDef::new("Tag", FieldType::BigIntegerField))
            }
        }

        let mut builder = testing::builder();
        builder.register::<BadLink>();
        let err = builder.build().unwrap_err();
        assert!(matches!(err, QuarryError::ConfigurationError(ref m) if m.contains("TodoTag.Tag")));
    }

    #[test]
    fn test_primary_key_required() {
        #[derive(Debug, Default, Clone)]
        struct NoPk;

        impl Instance for NoPk {
            fn model_name(&self) -> &'static str {
                "NoPk"
            }
            fn get_field(&self, _: &str) -> Option<crate::value::Value> {
                None
            }
            fn set_field(&mut self, _: &str, _: crate::value::Value) -> QuarryResult<()> {
                Ok(())
            }
        }

        impl Model for NoPk {
            fn definition() -> ModelDef {
                ModelDef::new("NoPk", "nopk").field(FieldDef::new("Name", FieldType::CharField))
            }
        }

        let mut builder = RegistryBuilder::new();
        builder.register::<NoPk>();
        assert!(matches!(
            builder.build(),
            Err(QuarryError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut builder = testing::builder();
        builder.register::<TodoTag>();
        let registry = builder.build().unwrap();
        assert_eq!(
            registry.models().filter(|m| m.name == "TodoTag").count(),
            1
        );
    }

    #[test]
    fn test_global_facade_rebuilds() {
        global::register::<Author>().unwrap();
        global::register::<crate::testing::Book>().unwrap();
        let first = global::registry().unwrap();
        assert!(first.meta("Book").is_ok());
        let again = global::registry().unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }
}

//! Model traits and metadata.
//!
//! The engine never reflects over Rust types. Each model instead implements:
//!
//! - [`Instance`], the object-safe accessor surface the hydrator and the
//!   write paths use (`get_field`, `set_field`, `set_related`);
//! - [`Model`], which adds the static [`ModelDef`] descriptor and the
//!   `Default + Clone` bounds needed to build fresh instances.
//!
//! `#[derive(Model)]` from `quarry-macros` generates both; they can also be
//! written by hand. A registered model's resolved metadata lives in
//! [`ModelMeta`], built by the [`registry`](crate::registry).

use std::any::{Any, TypeId};
use std::fmt;

use indexmap::IndexMap;
use quarry_core::{QuarryError, QuarryResult};

use crate::fields::{FieldDef, Relation};
use crate::value::Value;

/// `Any` plumbing for trait objects, implemented for every `'static` type.
pub trait AsAny {
    /// Upcasts to `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
    /// Upcasts to `&mut dyn Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Upcasts a box to `Box<dyn Any>`.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Object-safe access to a model instance's fields.
///
/// Field names are the names used in query paths (`Title`, `User`), not
/// column names. For a forward key, `get_field` returns the key value (the
/// related instance's primary key, or NULL).
pub trait Instance: AsAny + Send + Sync + fmt::Debug + 'static {
    /// The registered model name.
    fn model_name(&self) -> &'static str;

    /// Reads a field value, or `None` if the model has no such field.
    fn get_field(&self, field: &str) -> Option<Value>;

    /// Writes a scalar field value, already converted to the field's type.
    fn set_field(&mut self, field: &str, value: Value) -> QuarryResult<()>;

    /// Attaches a related instance under `relation`.
    ///
    /// To-one relations replace the current value; to-many relations append.
    fn set_related(&mut self, relation: &str, related: Box<dyn Instance>) -> QuarryResult<()> {
        let _ = related;
        Err(QuarryError::NotARelation(format!(
            "{}.{relation}",
            self.model_name()
        )))
    }
}

/// A registrable model type.
pub trait Model: Instance + Default + Clone {
    /// Describes the model: name, table, and ordered fields.
    fn definition() -> ModelDef;
}

/// The static description of a model, as declared.
#[derive(Debug, Clone)]
pub struct ModelDef {
    /// The model name used to key the registry and in relation targets.
    pub name: &'static str,
    /// The database table.
    pub table: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldDef>,
}

impl ModelDef {
    /// Starts a definition for `name` stored in `table`.
    pub fn new(name: &'static str, table: &str) -> Self {
        Self {
            name,
            table: table.to_string(),
            fields: Vec::new(),
        }
    }

    /// Appends a field.
    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }
}

/// Resolved metadata for a registered model.
///
/// Holds the declared fields plus the forward and reverse relation maps the
/// registry derives. Shared read-only between threads behind an `Arc`.
pub struct ModelMeta {
    /// The model name.
    pub name: &'static str,
    /// The database table.
    pub table: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldDef>,
    /// Forward relations by field name.
    pub forward: IndexMap<String, Relation>,
    /// Reverse relations by related name.
    pub reverse: IndexMap<String, Relation>,
    pub(crate) primary: usize,
    pub(crate) type_id: TypeId,
    pub(crate) factory: fn() -> Box<dyn Instance>,
}

impl fmt::Debug for ModelMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelMeta")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("fields", &self.fields.iter().map(|f| f.name).collect::<Vec<_>>())
            .field("forward", &self.forward.keys().collect::<Vec<_>>())
            .field("reverse", &self.reverse.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ModelMeta {
    /// The primary key field.
    pub fn primary(&self) -> &FieldDef {
        &self.fields[self.primary]
    }

    /// Looks up a declared field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Looks up a forward or reverse relation by name.
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.forward.get(name).or_else(|| self.reverse.get(name))
    }

    /// Fields stored in this model's own table, in declaration order.
    pub fn concrete_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_concrete())
    }

    /// Fields selected by `*`: concrete columns plus computed fields.
    pub fn star_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields
            .iter()
            .filter(|f| f.is_concrete() || f.computed.is_some())
    }

    /// Builds a fresh default instance of this model.
    pub fn new_instance(&self) -> Box<dyn Instance> {
        (self.factory)()
    }

    /// Returns `true` if this metadata describes the Rust type `M`.
    pub fn is<M: Model>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }
}

/// Builds a boxed default instance of `M`; used as the registry factory.
pub(crate) fn new_boxed<M: Model>() -> Box<dyn Instance> {
    Box::new(M::default())
}

/// Downcasts a boxed instance to the concrete model type.
///
/// # Errors
///
/// Returns [`QuarryError::TypeMismatch`] if the instance is another model.
pub fn downcast<M: Model>(instance: Box<dyn Instance>) -> QuarryResult<M> {
    let name = instance.model_name();
    AsAny::into_any(instance)
        .downcast::<M>()
        .map(|boxed| *boxed)
        .map_err(|_| {
            QuarryError::TypeMismatch(format!(
                "expected {}, got {name}",
                std::any::type_name::<M>()
            ))
        })
}

/// Borrows an instance as the concrete model type, if it is one.
pub fn downcast_ref<M: Model>(instance: &dyn Instance) -> Option<&M> {
    instance.as_any().downcast_ref::<M>()
}

/// Returns the primary key value of a model instance.
///
/// # Errors
///
/// Returns [`QuarryError::FieldNotFound`] if the instance does not expose
/// its primary key field.
pub fn pk_value(meta: &ModelMeta, instance: &dyn Instance) -> QuarryResult<Value> {
    let pk = meta.primary().name;
    instance
        .get_field(pk)
        .ok_or_else(|| QuarryError::FieldNotFound(format!("{}.{pk}", meta.name)))
}

/// Returns the primary key value of a typed model instance, or NULL if the
/// model exposes none.
pub fn pk_of<M: Model>(instance: &M) -> Value {
    M::definition()
        .fields
        .iter()
        .find(|f| f.primary_key)
        .and_then(|f| instance.get_field(f.name))
        .unwrap_or(Value::Null)
}

//! Storage adapters for relation fields.
//!
//! `#[derive(Model)]` does not know the concrete shape of a relation field,
//! only that it holds instances of the target model. These traits bridge the
//! two supported shapes: `Option<Box<T>>` for to-one relations and `Vec<T>`
//! for to-many ones.

use quarry_core::{QuarryError, QuarryResult};

use crate::model::{downcast, Instance, Model};
use crate::value::Value;

/// The name of `T`'s primary key field.
///
/// # Errors
///
/// Returns [`QuarryError::FieldNotFound`] if `T` declares no primary key.
pub fn primary_name<T: Model>() -> QuarryResult<&'static str> {
    let def = T::definition();
    def.fields
        .iter()
        .find(|f| f.primary_key)
        .map(|f| f.name)
        .ok_or_else(|| QuarryError::FieldNotFound(format!("{}.<primary key>", def.name)))
}

/// A field holding at most one related instance.
pub trait ToOneSlot {
    /// The related model.
    type Target: Model;

    /// The key the relation stores: `key_field` of the related instance,
    /// or NULL when empty.
    fn key(&self, key_field: &str) -> Value;

    /// Replaces the slot with a stub carrying only `key_field`, or empties
    /// it for NULL.
    fn set_key(&mut self, key_field: &str, value: Value) -> QuarryResult<()>;

    /// Replaces the slot with a fully hydrated instance.
    fn attach(&mut self, related: Box<dyn Instance>) -> QuarryResult<()>;
}

fn stub<T: Model>(key_field: &str, value: Value) -> QuarryResult<T> {
    let mut related = T::default();
    related.set_field(key_field, value)?;
    Ok(related)
}

impl<T: Model> ToOneSlot for Option<Box<T>> {
    type Target = T;

    fn key(&self, key_field: &str) -> Value {
        self.as_deref()
            .and_then(|r| r.get_field(key_field))
            .unwrap_or(Value::Null)
    }

    fn set_key(&mut self, key_field: &str, value: Value) -> QuarryResult<()> {
        *self = if value.is_null() {
            None
        } else {
            Some(Box::new(stub(key_field, value)?))
        };
        Ok(())
    }

    fn attach(&mut self, related: Box<dyn Instance>) -> QuarryResult<()> {
        *self = Some(Box::new(downcast(related)?));
        Ok(())
    }
}

/// A field collecting related instances.
pub trait ToManySlot {
    /// The related model.
    type Target: Model;

    /// Appends a hydrated instance.
    fn push_related(&mut self, related: Box<dyn Instance>) -> QuarryResult<()>;
}

impl<T: Model> ToManySlot for Vec<T> {
    type Target = T;

    fn push_related(&mut self, related: Box<dyn Instance>) -> QuarryResult<()> {
        self.push(downcast(related)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Tag, User};

    #[test]
    fn test_primary_name() {
        assert_eq!(primary_name::<User>().unwrap(), "ID");
    }

    #[test]
    fn test_boxed_slot_roundtrip() {
        let mut slot: Option<Box<User>> = None;
        assert_eq!(slot.key("ID"), Value::Null);
        slot.set_key("ID", Value::Int(4)).unwrap();
        assert_eq!(slot.key("ID"), Value::Int(4));
        slot.set_key("ID", Value::Null).unwrap();
        assert!(slot.is_none());
    }

    #[test]
    fn test_boxed_slot_attach() {
        let mut slot: Option<Box<User>> = None;
        let user = User {
            id: 9,
            name: "ann".to_string(),
            ..User::default()
        };
        slot.attach(Box::new(user)).unwrap();
        assert_eq!(slot.as_ref().map(|u| u.name.as_str()), Some("ann"));
        assert_eq!(slot.key("ID"), Value::Int(9));
    }

    #[test]
    fn test_attach_wrong_model() {
        let mut slot: Option<Box<User>> = None;
        let err = slot.attach(Box::new(Tag::default())).unwrap_err();
        assert!(matches!(err, QuarryError::TypeMismatch(_)));
    }

    #[test]
    fn test_vec_slot_appends() {
        let mut tags: Vec<Tag> = Vec::new();
        tags.push_related(Box::new(Tag::default())).unwrap();
        tags.push_related(Box::new(Tag::default())).unwrap();
        assert_eq!(tags.len(), 2);
    }
}

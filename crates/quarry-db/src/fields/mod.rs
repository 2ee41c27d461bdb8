//! Field definitions and relation descriptors.
//!
//! This module provides the [`FieldDef`] struct and [`FieldType`] enum that
//! describe model fields and their column mappings, plus the [`Relation`]
//! descriptors the path walker follows. [`slots`] adapts relation-holding
//! struct fields for derived models.

pub mod slots;
pub mod types;

pub use slots::{ToManySlot, ToOneSlot};
pub use types::{FieldDef, FieldType, Relation, RelationKind, Through};

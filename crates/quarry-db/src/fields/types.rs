//! Field and relation definitions.
//!
//! A [`FieldDef`] describes one declared field of a model: its name, column,
//! scalar type, nullability, and optionally the [`Relation`] it carries.
//! Fields without a column are *virtual*: many-to-many containers and
//! computed fields backed by a raw SQL template.

use crate::value::Value;

/// The scalar type of a model field, used to convert scanned values.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum FieldType {
    /// Auto-incrementing 32-bit integer primary key.
    AutoField,
    /// Auto-incrementing 64-bit integer primary key.
    BigAutoField,
    /// Variable-length string.
    CharField,
    /// Unlimited-length text.
    TextField,
    /// 32-bit signed integer.
    IntegerField,
    /// 64-bit signed integer.
    BigIntegerField,
    /// 16-bit signed integer.
    SmallIntegerField,
    /// 64-bit floating-point number.
    FloatField,
    /// Fixed-precision decimal number.
    DecimalField {
        /// Maximum total digits.
        max_digits: u32,
        /// Digits after the decimal point.
        decimal_places: u32,
    },
    /// Boolean (true/false).
    BooleanField,
    /// Date without time.
    DateField,
    /// Date and time.
    DateTimeField,
    /// Time without date.
    TimeField,
    /// UUID field.
    UuidField,
    /// Raw binary data.
    BinaryField,
    /// JSON data.
    JsonField,
}

/// The cardinality of a relation, seen from the model that declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum RelationKind {
    /// A unique foreign key, or its reverse side.
    OneToOne,
    /// A foreign key (forward side).
    ManyToOne,
    /// The reverse side of a foreign key.
    OneToMany,
    /// A link through an intermediate model.
    ManyToMany,
}

impl RelationKind {
    /// Returns `true` if following this relation can yield several rows.
    pub const fn is_to_many(self) -> bool {
        matches!(self, Self::OneToMany | Self::ManyToMany)
    }

    /// Returns the kind seen from the other end of the relation.
    pub const fn reversed(self) -> Self {
        match self {
            Self::OneToOne => Self::OneToOne,
            Self::ManyToOne => Self::OneToMany,
            Self::OneToMany => Self::ManyToOne,
            Self::ManyToMany => Self::ManyToMany,
        }
    }
}

/// The intermediate model of a many-to-many relation.
///
/// `source_field` is the foreign key on the through model pointing back at the
/// declaring model; `target_field` points at the relation's target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Through {
    /// The registered name of the through model.
    pub model: String,
    /// Foreign key field (on the through model) referencing the source model.
    pub source_field: String,
    /// Foreign key field (on the through model) referencing the target model.
    pub target_field: String,
}

impl Through {
    /// Creates a through descriptor.
    pub fn new(
        model: impl Into<String>,
        source_field: impl Into<String>,
        target_field: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            source_field: source_field.into(),
            target_field: target_field.into(),
        }
    }

    /// The same through model walked from the other end.
    #[must_use]
    pub fn swapped(&self) -> Self {
        Self {
            model: self.model.clone(),
            source_field: self.target_field.clone(),
            target_field: self.source_field.clone(),
        }
    }
}

/// A relation descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Cardinality.
    pub kind: RelationKind,
    /// Registered name of the related model.
    pub target: String,
    /// For forward keys, the referenced field on the target (defaults to its
    /// primary key). For reverse relations, the foreign key field on the
    /// target that points back here.
    pub target_field: Option<String>,
    /// Intermediate model for many-to-many relations.
    pub through: Option<Through>,
    /// Name under which the reverse side is exposed on the target.
    pub related_name: Option<String>,
}

impl Relation {
    /// Creates a relation of `kind` pointing at `target`.
    pub fn new(kind: RelationKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            target_field: None,
            through: None,
            related_name: None,
        }
    }
}

/// Complete definition of a model field.
///
/// Typically generated by `#[derive(Model)]`, or written by hand when
/// implementing [`Model`](crate::model::Model) directly.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// The field name used in paths (e.g. `Title`, `User`).
    pub name: &'static str,
    /// The database column, or `None` for virtual fields.
    pub column: Option<String>,
    /// The scalar type (for foreign keys, the type of the key column).
    pub field_type: FieldType,
    /// Whether this field is the primary key.
    pub primary_key: bool,
    /// Whether NULL is allowed.
    pub null: bool,
    /// Value assumed when a non-nullable field scans as NULL.
    pub default: Option<Value>,
    /// The relation this field carries, if any.
    pub relation: Option<Relation>,
    /// Raw template computing a virtual field (see [`FieldDef::computed`]).
    pub computed: Option<String>,
}

impl FieldDef {
    /// Creates a new plain field whose column equals its name.
    pub fn new(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            column: Some(name.to_string()),
            field_type,
            primary_key: false,
            null: false,
            default: None,
            relation: None,
            computed: None,
        }
    }

    /// Creates a many-to-one foreign key stored in `column`.
    pub fn foreign_key(name: &'static str, target: &str, column: &str) -> Self {
        Self {
            relation: Some(Relation::new(RelationKind::ManyToOne, target)),
            ..Self::new(name, FieldType::BigIntegerField).column(column)
        }
    }

    /// Creates a one-to-one key stored in `column`.
    pub fn one_to_one(name: &'static str, target: &str, column: &str) -> Self {
        Self {
            relation: Some(Relation::new(RelationKind::OneToOne, target)),
            ..Self::new(name, FieldType::BigIntegerField).column(column)
        }
    }

    /// Creates a virtual many-to-many field joined through `through`.
    pub fn many_to_many(name: &'static str, target: &str, through: Through) -> Self {
        let mut relation = Relation::new(RelationKind::ManyToMany, target);
        relation.through = Some(through);
        Self {
            column: None,
            relation: Some(relation),
            ..Self::new(name, FieldType::BigIntegerField)
        }
    }

    /// Creates a virtual field computed from a raw template.
    ///
    /// The template uses the raw-expression syntax, with `![Name]` resolved
    /// relative to the declaring model:
    /// `FieldDef::computed("Label", "![Title] || '!'", FieldType::TextField)`.
    pub fn computed(name: &'static str, template: &str, field_type: FieldType) -> Self {
        Self {
            column: None,
            computed: Some(template.to_string()),
            ..Self::new(name, field_type)
        }
    }

    /// Sets the database column name.
    #[must_use]
    pub fn column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }

    /// Marks this field as the primary key.
    #[must_use]
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Allows NULL values.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    /// Sets the value assumed when the field scans as NULL.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Sets the scalar type.
    #[must_use]
    pub fn field_type(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    /// Sets the field referenced on the relation's target.
    #[must_use]
    pub fn to_field(mut self, field: &str) -> Self {
        if let Some(rel) = self.relation.as_mut() {
            rel.target_field = Some(field.to_string());
        }
        self
    }

    /// Names the reverse side of this relation on its target.
    #[must_use]
    pub fn related_name(mut self, name: &str) -> Self {
        if let Some(rel) = self.relation.as_mut() {
            rel.related_name = Some(name.to_string());
        }
        self
    }

    /// Returns `true` if this field is stored in a column of its own table.
    pub const fn is_concrete(&self) -> bool {
        self.column.is_some() && self.computed.is_none()
    }

    /// Returns `true` for a forward key whose value lives in this table.
    pub fn is_forward_key(&self) -> bool {
        self.is_concrete()
            && self.relation.as_ref().is_some_and(|r| {
                matches!(r.kind, RelationKind::ManyToOne | RelationKind::OneToOne)
            })
    }

    /// The column name, or the field name for virtual fields.
    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(self.name)
    }
}

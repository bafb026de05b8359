//! Field definitions: value types, index flags and relations.

use serde_json::Value;

// ============================================================================
// Value types
// ============================================================================

/// Declared type of a scalar field. Arrays of the declared type are accepted
/// for multi-valued fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Number,
    Boolean,
    /// Milliseconds since the Unix epoch.
    Date,
    /// Any JSON value.
    Json,
}

impl ValueType {
    pub fn accepts(self, value: &Value) -> bool {
        match value {
            Value::Null => true,
            Value::Array(items) if self != ValueType::Json => {
                items.iter().all(|item| !item.is_array() && self.accepts(item))
            }
            _ => match self {
                ValueType::String => value.is_string(),
                ValueType::Number | ValueType::Date => value.is_number(),
                ValueType::Boolean => value.is_boolean(),
                ValueType::Json => true,
            },
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ValueType::String => "a string",
            ValueType::Number => "a number",
            ValueType::Boolean => "a boolean",
            ValueType::Date => "a timestamp in milliseconds",
            ValueType::Json => "any value",
        }
    }
}

// ============================================================================
// Relations
// ============================================================================

/// What happens to a referencing entity when the entity it points at is
/// deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Delete the referencing entity as well.
    Cascade,
    /// Remove the reference and keep the referencing entity.
    #[default]
    Unset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    /// Store names this relation may point at.
    pub targets: Vec<String>,
    /// Holds an ordered list of references instead of a single one.
    pub many: bool,
    pub on_delete: DeletePolicy,
}

// ============================================================================
// FieldDef
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub key: bool,
    pub index: bool,
    pub unique: bool,
    /// Relation is kept as an unresolved reference when materialized.
    pub lazy: bool,
    /// Composite index group this field belongs to.
    pub group: Option<String>,
    pub value_type: ValueType,
    pub relation: Option<RelationDef>,
}

impl FieldDef {
    fn scalar(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            key: false,
            index: false,
            unique: false,
            lazy: false,
            group: None,
            value_type,
            relation: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::scalar(name, ValueType::String)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::scalar(name, ValueType::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::scalar(name, ValueType::Boolean)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::scalar(name, ValueType::Date)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::scalar(name, ValueType::Json)
    }

    /// A single reference to an entity of `target`.
    pub fn relation(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::relation_to(name, [target.into()])
    }

    /// A single reference to an entity of any of `targets`.
    pub fn relation_to(
        name: impl Into<String>,
        targets: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut field = Self::scalar(name, ValueType::String);
        field.relation = Some(RelationDef {
            targets: targets.into_iter().map(Into::into).collect(),
            many: false,
            on_delete: DeletePolicy::default(),
        });
        field
    }

    /// An ordered list of references to entities of `target`.
    pub fn relations(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::relation(name, target).many()
    }

    pub fn key(mut self) -> Self {
        self.key = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Marks a relation as multi-valued. No effect on scalar fields.
    pub fn many(mut self) -> Self {
        if let Some(relation) = self.relation.as_mut() {
            relation.many = true;
        }
        self
    }

    pub fn cascade(mut self) -> Self {
        if let Some(relation) = self.relation.as_mut() {
            relation.on_delete = DeletePolicy::Cascade;
        }
        self
    }

    pub fn unset(mut self) -> Self {
        if let Some(relation) = self.relation.as_mut() {
            relation.on_delete = DeletePolicy::Unset;
        }
        self
    }

    pub fn is_relation(&self) -> bool {
        self.relation.is_some()
    }

    pub fn is_many(&self) -> bool {
        self.relation.as_ref().map(|r| r.many).unwrap_or(false)
    }

    /// Whether the indexed store maintains a single-field index for this field.
    pub fn has_index(&self) -> bool {
        self.key || self.index || self.unique || self.relation.is_some()
    }
}

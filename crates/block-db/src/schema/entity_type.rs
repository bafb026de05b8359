//! Entity type builder with a fluent `.field()` API.
//!
//! Base fields (`id`, `scope`, `createdAt`) are injected by `build()`. Global
//! types drop `scope`. The primary-key path is derived once here and frozen
//! into the resulting [`EntityType`].

use std::sync::OnceLock;

use serde_json::Value;

use super::field::{FieldDef, ValueType};
use crate::error::{SchemaError, StorageError};
use crate::types::{IndexableValue, Key, Record};

// ============================================================================
// Regex
// ============================================================================

static NAME_REGEX: OnceLock<regex::Regex> = OnceLock::new();

fn name_regex() -> &'static regex::Regex {
    NAME_REGEX.get_or_init(|| {
        regex::Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_\-]*$").expect("name regex is valid")
    })
}

pub(crate) fn validate_name(kind: &'static str, name: &str) -> Result<(), SchemaError> {
    if name_regex().is_match(name) {
        Ok(())
    } else {
        Err(SchemaError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

pub const ID_FIELD: &str = "id";
pub const SCOPE_FIELD: &str = "scope";
pub const CREATED_FIELD: &str = "createdAt";

/// Field names injected by `build()` that user definitions may not redeclare.
pub(crate) const BASE_FIELDS: &[&str] = &[ID_FIELD, SCOPE_FIELD, CREATED_FIELD];

// ============================================================================
// EntityType
// ============================================================================

/// A frozen entity type definition.
#[derive(Debug, Clone)]
pub struct EntityType {
    pub collection: String,
    pub store: String,
    /// Primary keys are generated numbers rather than record fields.
    pub auto_key: bool,
    pub audited: bool,
    /// Shared across all scopes; has no `scope` field.
    pub global: bool,
    pub compound: bool,
    /// Rows are append-only snapshots.
    pub snapshot: bool,
    pub version: u32,
    /// Base fields followed by user fields, in declaration order.
    pub fields: Vec<FieldDef>,
    pub key_path: Vec<String>,
    /// Composite index groups as `(group, fields)` in declaration order.
    pub groups: Vec<(String, Vec<String>)>,
}

impl EntityType {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn relation_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_relation())
    }

    pub fn is_base_field(&self, name: &str) -> bool {
        BASE_FIELDS.contains(&name)
    }

    /// Derive the primary key of a serialized record.
    pub fn derive_key(&self, record: &Record) -> Result<Key, StorageError> {
        self.key_path
            .iter()
            .map(|field| {
                record
                    .get(field)
                    .and_then(IndexableValue::from_value)
                    .ok_or_else(|| StorageError::MissingKey {
                        store: self.store.clone(),
                        field: field.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Key)
    }

    /// Whether the key path is just the identifier, so a reference can be
    /// resolved with a direct key lookup.
    pub fn keyed_by_id(&self) -> bool {
        self.key_path.len() == 1 && self.key_path[0] == ID_FIELD
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Start defining an entity type stored as `store` inside `collection`.
pub fn entity_type(collection: impl Into<String>, store: impl Into<String>) -> EntityTypeBuilder {
    EntityTypeBuilder {
        collection: collection.into(),
        store: store.into(),
        auto_key: false,
        audited: false,
        global: false,
        compound: false,
        snapshot: false,
        version: 1,
        fields: Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct EntityTypeBuilder {
    collection: String,
    store: String,
    auto_key: bool,
    audited: bool,
    global: bool,
    compound: bool,
    snapshot: bool,
    version: u32,
    fields: Vec<FieldDef>,
}

impl EntityTypeBuilder {
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn auto_key(mut self) -> Self {
        self.auto_key = true;
        self
    }

    pub fn audited(mut self) -> Self {
        self.audited = true;
        self
    }

    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    pub fn compound(mut self) -> Self {
        self.compound = true;
        self
    }

    pub fn snapshot(mut self) -> Self {
        self.snapshot = true;
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version.max(1);
        self
    }

    pub fn build(self) -> Result<EntityType, SchemaError> {
        validate_name("collection", &self.collection)?;
        validate_name("store", &self.store)?;

        let mut fields = vec![FieldDef::string(ID_FIELD).key()];
        if !self.global {
            fields.push(FieldDef::string(SCOPE_FIELD).indexed());
        }
        fields.push(FieldDef::date(CREATED_FIELD).indexed());

        for field in self.fields {
            validate_name("field", &field.name)?;
            if BASE_FIELDS.contains(&field.name.as_str())
                || fields.iter().any(|f| f.name == field.name)
            {
                return Err(SchemaError::InvalidName {
                    kind: "field",
                    name: field.name,
                });
            }
            if field.relation.is_some() && field.value_type != ValueType::String {
                return Err(SchemaError::FieldKind {
                    store: self.store,
                    field: field.name,
                    expected: "a reference",
                });
            }
            fields.push(field);
        }

        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for field in &fields {
            if let Some(group) = &field.group {
                match groups.iter_mut().find(|(name, _)| name == group) {
                    Some((_, members)) => members.push(field.name.clone()),
                    None => groups.push((group.clone(), vec![field.name.clone()])),
                }
            }
        }

        let key_path = if self.auto_key {
            Vec::new()
        } else if self.compound {
            let grouped: Vec<String> = fields
                .iter()
                .filter(|f| f.group.is_some())
                .map(|f| f.name.clone())
                .collect();
            if grouped.is_empty() {
                return Err(SchemaError::EmptyKeyPath(self.store));
            }
            let mut path = Vec::with_capacity(grouped.len() + 1);
            if !self.global {
                path.push(SCOPE_FIELD.to_string());
            }
            path.extend(grouped);
            path
        } else {
            fields
                .iter()
                .filter(|f| f.key)
                .map(|f| f.name.clone())
                .collect()
        };

        Ok(EntityType {
            collection: self.collection,
            store: self.store,
            auto_key: self.auto_key,
            audited: self.audited,
            global: self.global,
            compound: self.compound,
            snapshot: self.snapshot,
            version: self.version,
            fields,
            key_path,
            groups,
        })
    }
}

/// Read a string field from a record.
pub(crate) fn record_str<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

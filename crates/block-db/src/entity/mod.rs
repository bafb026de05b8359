//! Entity: a typed, persisted record with a stable identifier.
//!
//! Scalar fields hold JSON values. Relation fields hold either a resolved
//! child (`Arc<Entity>`, shared between parents and live caches) or a lazy
//! [`Reference`]. Entities are cheap to clone: children are shared, so a
//! clone followed by mutation only copies the mutated node.
//!
//! The lifecycle operations that touch storage (`commit`, `delete`,
//! `discard`) live in [`lifecycle`].

pub mod lifecycle;
pub mod reference;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::diff::{differences, json_equal};
use crate::error::{Result, SchemaError, StorageError};
use crate::schema::entity_type::{record_str, EntityType, CREATED_FIELD, ID_FIELD, SCOPE_FIELD};
use crate::types::{DuplicateOptions, IndexableValue, Key, Record};

pub use reference::Reference;

// ============================================================================
// Field values
// ============================================================================

/// A relation slot: either a loaded child or an unresolved pointer.
#[derive(Clone)]
pub enum Relation {
    Resolved(Arc<Entity>),
    Lazy(Reference),
}

impl Relation {
    pub fn reference(&self) -> Reference {
        match self {
            Relation::Resolved(entity) => entity.reference(),
            Relation::Lazy(reference) => reference.clone(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Relation::Resolved(entity) => entity.id(),
            Relation::Lazy(reference) => &reference.id,
        }
    }

    pub fn entity(&self) -> Option<&Arc<Entity>> {
        match self {
            Relation::Resolved(entity) => Some(entity),
            Relation::Lazy(_) => None,
        }
    }
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relation::Resolved(entity) => write!(f, "Resolved({})", entity.reference()),
            Relation::Lazy(reference) => write!(f, "Lazy({reference})"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FieldValue {
    Value(Value),
    One(Relation),
    Many(Vec<Relation>),
}

impl FieldValue {
    fn to_value(&self) -> Value {
        match self {
            FieldValue::Value(value) => value.clone(),
            FieldValue::One(relation) => relation.reference().into(),
            FieldValue::Many(relations) => {
                Value::Array(relations.iter().map(|r| r.reference().into()).collect())
            }
        }
    }
}

// ============================================================================
// Entity
// ============================================================================

#[derive(Clone)]
pub struct Entity {
    ty: Arc<EntityType>,
    id: String,
    scope: Option<String>,
    created_at: i64,
    fields: BTreeMap<String, FieldValue>,
    /// Last persisted (or received) state, used for diffing.
    shadow: Option<Record>,
}

impl Entity {
    /// A fresh, unpersisted entity with a new identifier.
    pub fn new(ty: &Arc<EntityType>) -> Self {
        Self {
            ty: Arc::clone(ty),
            id: uuid::Uuid::new_v4().to_string(),
            scope: if ty.global { None } else { Some(String::new()) },
            created_at: chrono::Utc::now().timestamp_millis(),
            fields: BTreeMap::new(),
            shadow: None,
        }
    }

    /// Rebuild an entity from a serialized record. Relation fields are left
    /// as lazy references; the store resolves them.
    pub(crate) fn from_record(ty: &Arc<EntityType>, record: &Record) -> Result<Self> {
        let id = record_str(record, ID_FIELD)
            .ok_or_else(|| StorageError::MissingKey {
                store: ty.store.clone(),
                field: ID_FIELD.to_string(),
            })?
            .to_string();
        let scope = if ty.global {
            None
        } else {
            record_str(record, SCOPE_FIELD).map(str::to_string)
        };
        let created_at = record
            .get(CREATED_FIELD)
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .unwrap_or_default();

        let mut fields = BTreeMap::new();
        for def in &ty.fields {
            if ty.is_base_field(&def.name) {
                continue;
            }
            let Some(value) = record.get(&def.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let parsed = match &def.relation {
                None => Some(FieldValue::Value(value.clone())),
                Some(relation) if relation.many => {
                    let references = parse_references(value);
                    Some(FieldValue::Many(
                        references.into_iter().map(Relation::Lazy).collect(),
                    ))
                }
                Some(_) => match Reference::from_value(value) {
                    Some(reference) => Some(FieldValue::One(Relation::Lazy(reference))),
                    None => {
                        tracing::warn!(
                            store = %ty.store,
                            id = %id,
                            field = %def.name,
                            "skipping malformed reference"
                        );
                        None
                    }
                },
            };
            if let Some(parsed) = parsed {
                fields.insert(def.name.clone(), parsed);
            }
        }

        Ok(Self {
            ty: Arc::clone(ty),
            id,
            scope,
            created_at,
            fields,
            shadow: Some(record.clone()),
        })
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.ty
    }

    pub fn store(&self) -> &str {
        &self.ty.store
    }

    pub fn reference(&self) -> Reference {
        Reference::new(&self.ty.collection, &self.ty.store, &self.id)
    }

    /// Primary key derived from the entity's current field values.
    pub fn key(&self) -> Result<Key, StorageError> {
        // Generated keys are never exposed; auto-key stores are addressed by id.
        if self.ty.auto_key {
            return Ok(Key::single(self.id.as_str()));
        }
        self.ty
            .key_path
            .iter()
            .map(|field| {
                IndexableValue::from_value(&self.field_value(field)).ok_or_else(|| {
                    StorageError::MissingKey {
                        store: self.ty.store.clone(),
                        field: field.clone(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Key)
    }

    /// Last persisted state, if the entity has been committed or loaded.
    pub fn shadow(&self) -> Option<&Record> {
        self.shadow.as_ref()
    }

    pub fn is_persisted(&self) -> bool {
        self.shadow.is_some()
    }

    // ------------------------------------------------------------------
    // Field access
    // ------------------------------------------------------------------

    pub fn set_scope(&mut self, scope: impl Into<String>) -> Result<&mut Self> {
        if self.ty.global {
            return Err(SchemaError::UnknownField {
                store: self.ty.store.clone(),
                field: SCOPE_FIELD.to_string(),
            }
            .into());
        }
        self.scope = Some(scope.into());
        Ok(self)
    }

    /// Assign a scalar field. Assigning null clears it.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<&mut Self> {
        let value = value.into();
        if field == SCOPE_FIELD {
            return match value {
                Value::String(scope) => self.set_scope(scope),
                _ => Err(self.kind_error(field, "a string")),
            };
        }
        let def = self.user_field(field)?;
        if def.is_relation() {
            return Err(self.kind_error(field, "an entity or reference"));
        }
        if !def.value_type.accepts(&value) {
            return Err(self.kind_error(field, def.value_type.describe()));
        }
        if value.is_null() {
            self.fields.remove(field);
        } else {
            self.fields
                .insert(field.to_string(), FieldValue::Value(value));
        }
        Ok(self)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        match self.fields.get(field) {
            Some(FieldValue::Value(value)) => Some(value),
            _ => None,
        }
    }

    /// Point a single-valued relation at `entity`.
    pub fn set_related(&mut self, field: &str, entity: Arc<Entity>) -> Result<&mut Self> {
        self.check_relation(field, false, entity.store())?;
        self.fields
            .insert(field.to_string(), FieldValue::One(Relation::Resolved(entity)));
        Ok(self)
    }

    /// Replace the entries of a multi-valued relation.
    pub fn set_related_many(
        &mut self,
        field: &str,
        entities: impl IntoIterator<Item = Arc<Entity>>,
    ) -> Result<&mut Self> {
        let mut relations = Vec::new();
        for entity in entities {
            self.check_relation(field, true, entity.store())?;
            relations.push(Relation::Resolved(entity));
        }
        self.check_relation_kind(field, true)?;
        self.fields
            .insert(field.to_string(), FieldValue::Many(relations));
        Ok(self)
    }

    /// Append to a multi-valued relation.
    pub fn push_related(&mut self, field: &str, entity: Arc<Entity>) -> Result<&mut Self> {
        self.check_relation(field, true, entity.store())?;
        match self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| FieldValue::Many(Vec::new()))
        {
            FieldValue::Many(relations) => relations.push(Relation::Resolved(entity)),
            other => *other = FieldValue::Many(vec![Relation::Resolved(entity)]),
        }
        Ok(self)
    }

    /// Link a relation without loading the target.
    pub fn set_reference(&mut self, field: &str, reference: Reference) -> Result<&mut Self> {
        let many = self.user_field(field)?.is_many();
        self.check_relation(field, many, &reference.store)?;
        let relation = Relation::Lazy(reference);
        let value = if many {
            FieldValue::Many(vec![relation])
        } else {
            FieldValue::One(relation)
        };
        self.fields.insert(field.to_string(), value);
        Ok(self)
    }

    pub fn unset(&mut self, field: &str) -> Result<&mut Self> {
        self.user_field(field)?;
        self.fields.remove(field);
        Ok(self)
    }

    /// The raw slot of a user field.
    pub fn field(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// The resolved child of a single-valued relation.
    pub fn related(&self, field: &str) -> Option<&Arc<Entity>> {
        match self.fields.get(field) {
            Some(FieldValue::One(relation)) => relation.entity(),
            _ => None,
        }
    }

    /// The resolved children of a multi-valued relation.
    pub fn related_many(&self, field: &str) -> Vec<&Arc<Entity>> {
        match self.fields.get(field) {
            Some(FieldValue::Many(relations)) => {
                relations.iter().filter_map(Relation::entity).collect()
            }
            _ => Vec::new(),
        }
    }

    /// References held by a relation field, resolved or not.
    pub fn references(&self, field: &str) -> Vec<Reference> {
        match self.fields.get(field) {
            Some(FieldValue::One(relation)) => vec![relation.reference()],
            Some(FieldValue::Many(relations)) => {
                relations.iter().map(Relation::reference).collect()
            }
            _ => Vec::new(),
        }
    }

    /// The serialized value of a single field (null when absent).
    pub fn field_value(&self, field: &str) -> Value {
        match field {
            ID_FIELD => Value::String(self.id.clone()),
            SCOPE_FIELD if !self.ty.global => self
                .scope
                .as_ref()
                .map(|s| Value::String(s.clone()))
                .unwrap_or(Value::Null),
            CREATED_FIELD => Value::from(self.created_at),
            _ => self
                .fields
                .get(field)
                .map(FieldValue::to_value)
                .unwrap_or(Value::Null),
        }
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Every declared field, with relations as reference strings and absent
    /// values as null.
    pub fn to_record(&self) -> Record {
        self.ty
            .fields
            .iter()
            .map(|def| (def.name.clone(), self.field_value(&def.name)))
            .collect()
    }

    /// Fields that differ from the last persisted state, mapped to their
    /// previous values.
    pub fn changed_fields(&self) -> Record {
        let empty = Record::new();
        differences(
            self.shadow.as_ref().unwrap_or(&empty),
            &self.to_record(),
            self.ty.field_names(),
        )
    }

    /// Serialize this entity and every resolved descendant, keyed by
    /// reference string.
    pub fn graph_records(&self) -> BTreeMap<String, Record> {
        let mut out = BTreeMap::new();
        out.insert(self.reference().to_string(), self.to_record());
        let mut stack: Vec<Arc<Entity>> = self.children().into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            let key = node.reference().to_string();
            if out.contains_key(&key) {
                continue;
            }
            out.insert(key, node.to_record());
            stack.extend(node.children().into_iter().rev());
        }
        out
    }

    // ------------------------------------------------------------------
    // Graph traversal
    // ------------------------------------------------------------------

    /// Resolved relation children in field order.
    pub fn children(&self) -> Vec<Arc<Entity>> {
        self.child_slots().into_iter().map(|(_, _, c)| c).collect()
    }

    /// Resolved children with the field and list position they occupy.
    pub(crate) fn child_slots(&self) -> Vec<(String, Option<usize>, Arc<Entity>)> {
        let mut out = Vec::new();
        for def in self.ty.relation_fields() {
            match self.fields.get(&def.name) {
                Some(FieldValue::One(Relation::Resolved(child))) => {
                    out.push((def.name.clone(), None, Arc::clone(child)));
                }
                Some(FieldValue::Many(relations)) => {
                    for (i, relation) in relations.iter().enumerate() {
                        if let Relation::Resolved(child) = relation {
                            out.push((def.name.clone(), Some(i), Arc::clone(child)));
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    pub(crate) fn replace_child(&mut self, field: &str, slot: Option<usize>, child: Arc<Entity>) {
        match (self.fields.get_mut(field), slot) {
            (Some(FieldValue::One(relation)), None) => *relation = Relation::Resolved(child),
            (Some(FieldValue::Many(relations)), Some(i)) if i < relations.len() => {
                relations[i] = Relation::Resolved(child);
            }
            _ => {}
        }
    }

    /// First descendant of `store` (optionally with `field == value`),
    /// searched depth-first. The entity itself is not considered.
    pub fn find(&self, store: &str, filter: Option<(&str, &Value)>) -> Option<Arc<Entity>> {
        self.search(store, filter, true).into_iter().next()
    }

    /// Every descendant of `store` matching the optional field filter.
    pub fn find_all(&self, store: &str, filter: Option<(&str, &Value)>) -> Vec<Arc<Entity>> {
        self.search(store, filter, false)
    }

    fn search(
        &self,
        store: &str,
        filter: Option<(&str, &Value)>,
        first_only: bool,
    ) -> Vec<Arc<Entity>> {
        let mut visited: HashSet<Reference> = HashSet::new();
        visited.insert(self.reference());
        let mut stack: Vec<Arc<Entity>> = self.children().into_iter().rev().collect();
        let mut found = Vec::new();

        while let Some(node) = stack.pop() {
            if !visited.insert(node.reference()) {
                continue;
            }
            let matches = node.store() == store
                && filter
                    .map(|(field, value)| json_equal(&node.field_value(field), value))
                    .unwrap_or(true);
            if matches {
                found.push(Arc::clone(&node));
                if first_only {
                    break;
                }
            }
            stack.extend(node.children().into_iter().rev());
        }
        found
    }

    // ------------------------------------------------------------------
    // Duplication
    // ------------------------------------------------------------------

    /// A new, unpersisted entity with a fresh identifier and the same field
    /// values. With `cascade`, resolved children are duplicated too;
    /// otherwise they are shared by reference.
    pub fn duplicate(&self, options: DuplicateOptions) -> Entity {
        let mut memo: HashMap<Reference, Arc<Entity>> = HashMap::new();
        self.duplicate_with(options.cascade, &mut memo)
    }

    fn duplicate_with(&self, cascade: bool, memo: &mut HashMap<Reference, Arc<Entity>>) -> Entity {
        let mut copy = Entity::new(&self.ty);
        copy.scope = self.scope.clone();
        for (name, value) in &self.fields {
            let value = match value {
                FieldValue::One(Relation::Resolved(child)) if cascade => {
                    FieldValue::One(Relation::Resolved(duplicate_child(child, memo)))
                }
                FieldValue::Many(relations) if cascade => FieldValue::Many(
                    relations
                        .iter()
                        .map(|relation| match relation {
                            Relation::Resolved(child) => {
                                Relation::Resolved(duplicate_child(child, memo))
                            }
                            lazy => lazy.clone(),
                        })
                        .collect(),
                ),
                other => other.clone(),
            };
            copy.fields.insert(name.clone(), value);
        }
        copy
    }

    // ------------------------------------------------------------------
    // Crate-internal state handling
    // ------------------------------------------------------------------

    pub(crate) fn set_shadow(&mut self, record: Option<Record>) {
        self.shadow = record;
    }

    pub(crate) fn insert_field(&mut self, field: &str, value: Option<FieldValue>) {
        match value {
            Some(value) => {
                self.fields.insert(field.to_string(), value);
            }
            None => {
                self.fields.remove(field);
            }
        }
    }

    /// Take over every field of `other` (same identity) including its shadow.
    pub(crate) fn replace_state(&mut self, other: Entity) {
        self.scope = other.scope;
        self.created_at = other.created_at;
        self.fields = other.fields;
        self.shadow = other.shadow;
    }

    pub(crate) fn set_base(&mut self, field: &str, value: &Value) {
        match field {
            SCOPE_FIELD if !self.ty.global => {
                self.scope = value.as_str().map(str::to_string);
            }
            CREATED_FIELD => {
                if let Some(ts) = value.as_i64().or_else(|| value.as_f64().map(|f| f as i64)) {
                    self.created_at = ts;
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Validation helpers
    // ------------------------------------------------------------------

    fn user_field(&self, field: &str) -> Result<&crate::schema::FieldDef> {
        match self.ty.field(field) {
            Some(def) if !self.ty.is_base_field(field) => Ok(def),
            _ => Err(SchemaError::UnknownField {
                store: self.ty.store.clone(),
                field: field.to_string(),
            }
            .into()),
        }
    }

    fn check_relation_kind(&self, field: &str, many: bool) -> Result<()> {
        let def = self.user_field(field)?;
        match &def.relation {
            Some(relation) if relation.many == many => Ok(()),
            Some(_) if many => Err(self.kind_error(field, "a single reference")),
            Some(_) => Err(self.kind_error(field, "a list of references")),
            None => Err(self.kind_error(field, "a scalar value")),
        }
    }

    fn check_relation(&self, field: &str, many: bool, target: &str) -> Result<()> {
        self.check_relation_kind(field, many)?;
        let targets_ok = self
            .ty
            .field(field)
            .and_then(|def| def.relation.as_ref())
            .map(|relation| relation.targets.iter().any(|t| t == target))
            .unwrap_or(false);
        if targets_ok {
            Ok(())
        } else {
            Err(self.kind_error(field, "a reference to one of its declared targets"))
        }
    }

    fn kind_error(&self, field: &str, expected: &'static str) -> crate::error::BlockDbError {
        SchemaError::FieldKind {
            store: self.ty.store.clone(),
            field: field.to_string(),
            expected,
        }
        .into()
    }
}

fn duplicate_child(child: &Arc<Entity>, memo: &mut HashMap<Reference, Arc<Entity>>) -> Arc<Entity> {
    let key = child.reference();
    if let Some(done) = memo.get(&key) {
        return Arc::clone(done);
    }
    let copy = Arc::new(child.duplicate_with(true, memo));
    memo.insert(key, Arc::clone(&copy));
    copy
}

/// Parse a serialized relation value into references, skipping malformed
/// entries.
pub(crate) fn parse_references(value: &Value) -> Vec<Reference> {
    match value {
        Value::Array(items) => items.iter().filter_map(Reference::from_value).collect(),
        other => Reference::from_value(other).into_iter().collect(),
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("store", &self.ty.store)
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("fields", &self.fields)
            .field("persisted", &self.shadow.is_some())
            .finish()
    }
}

//! IndexedStore: an in-memory, indexed object store.
//!
//! Records live in one object store per entity type, grouped into one
//! database per collection. Every indexed field gets a multi-entry index
//! (array values index each scalar element, nulls are not indexed) and every
//! declared field group gets a composite index. Databases are opened lazily:
//! the first access after the collection's schema version changed creates
//! missing object stores and indexes and backfills them.
//!
//! All state sits behind one `parking_lot::Mutex`, held only for the
//! synchronous body of each operation and never across an `.await`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::adapter::{QueryOutput, StorageAdapter};
use super::planner::{plan_query, Access, Lookup, QueryPlan};
use super::references::{fix_up_references, holds_reference, ReferenceAccess};
use crate::audit::audit_row;
use crate::error::{Result, StorageError};
use crate::query::{sort_records, QueryDescriptor, SortClause, SortDirection};
use crate::schema::{EntityType, SchemaRegistry, ID_FIELD};
use crate::types::{ChangeMessage, IndexableValue, Key, Method, Record};

// ============================================================================
// Index
// ============================================================================

type IndexEntry = Vec<IndexableValue>;

/// Scalar values a field contributes to an index.
fn scalars(value: Option<&Value>) -> Vec<IndexableValue> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(IndexableValue::from_value).collect(),
        Some(value) => IndexableValue::from_value(value).into_iter().collect(),
        None => Vec::new(),
    }
}

#[derive(Debug)]
struct Index {
    name: String,
    fields: Vec<String>,
    unique: bool,
    entries: BTreeMap<IndexEntry, BTreeSet<Key>>,
}

impl Index {
    fn new(name: impl Into<String>, fields: Vec<String>, unique: bool) -> Self {
        Self {
            name: name.into(),
            fields,
            unique,
            entries: BTreeMap::new(),
        }
    }

    /// Every entry `record` occupies: the cartesian product of each field's
    /// scalar values. A field without scalars keeps the record out.
    fn entries_for(&self, record: &Record) -> Vec<IndexEntry> {
        let mut combos: Vec<IndexEntry> = vec![Vec::new()];
        for field in &self.fields {
            let values = scalars(record.get(field));
            if values.is_empty() {
                return Vec::new();
            }
            combos = combos
                .into_iter()
                .flat_map(|prefix| {
                    values.iter().map(move |v| {
                        let mut next = prefix.clone();
                        next.push(v.clone());
                        next
                    })
                })
                .collect();
        }
        combos.sort();
        combos.dedup();
        combos
    }

    fn insert(&mut self, key: &Key, record: &Record) {
        for entry in self.entries_for(record) {
            self.entries.entry(entry).or_default().insert(key.clone());
        }
    }

    fn remove(&mut self, key: &Key, record: &Record) {
        for entry in self.entries_for(record) {
            if let Some(keys) = self.entries.get_mut(&entry) {
                keys.remove(key);
                if keys.is_empty() {
                    self.entries.remove(&entry);
                }
            }
        }
    }

    fn check_unique(&self, store: &str, key: &Key, record: &Record) -> Result<(), StorageError> {
        if !self.unique {
            return Ok(());
        }
        for entry in self.entries_for(record) {
            let conflict = self
                .entries
                .get(&entry)
                .and_then(|keys| keys.iter().find(|k| *k != key));
            if let Some(existing) = conflict {
                return Err(StorageError::UniqueConstraint {
                    store: store.to_string(),
                    index: self.name.clone(),
                    existing: existing.to_string(),
                    value: Value::Array(entry.iter().map(IndexableValue::to_value).collect()),
                });
            }
        }
        Ok(())
    }

    fn lookup(&self, lookup: &Lookup) -> BTreeSet<Key> {
        let mut out = BTreeSet::new();
        match lookup {
            Lookup::Exact(value) => {
                if let Some(keys) = self.entries.get(std::slice::from_ref(value)) {
                    out.extend(keys.iter().cloned());
                }
            }
            Lookup::Range { lower, upper } => {
                if let (Some(lo), Some(hi)) = (lower, upper) {
                    if lo > hi {
                        return out;
                    }
                }
                let lo = lower
                    .as_ref()
                    .map(|v| Bound::Included(vec![v.clone()]))
                    .unwrap_or(Bound::Unbounded);
                let hi = upper
                    .as_ref()
                    .map(|v| Bound::Included(vec![v.clone()]))
                    .unwrap_or(Bound::Unbounded);
                for keys in self.entries.range((lo, hi)).map(|(_, keys)| keys) {
                    out.extend(keys.iter().cloned());
                }
            }
            Lookup::AnyOf(values) => {
                let (Some(first), Some(last)) = (values.first(), values.last()) else {
                    return out;
                };
                // Merge walk: advance through the sorted values alongside the
                // ordered index entries.
                let mut wanted = values.iter().peekable();
                let range = self
                    .entries
                    .range(vec![first.clone()]..=vec![last.clone()]);
                for (entry, keys) in range {
                    let Some(value) = entry.first() else {
                        continue;
                    };
                    while wanted.peek().is_some_and(|w| *w < value) {
                        wanted.next();
                    }
                    match wanted.peek() {
                        None => break,
                        Some(w) if *w == value => out.extend(keys.iter().cloned()),
                        Some(_) => {}
                    }
                }
            }
        }
        out
    }
}

// ============================================================================
// ObjectStore
// ============================================================================

#[derive(Debug)]
struct ObjectStore {
    store: String,
    next_key: u64,
    records: BTreeMap<Key, Record>,
    /// Single-field indexes by field name.
    indexes: BTreeMap<String, Index>,
    /// Composite indexes by group name.
    composites: BTreeMap<String, Index>,
}

impl ObjectStore {
    fn new(ty: &EntityType) -> Self {
        Self {
            store: ty.store.clone(),
            next_key: 0,
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
            composites: BTreeMap::new(),
        }
    }

    /// Create indexes `ty` declares but this store lacks, backfilling them.
    /// Returns the number of indexes created.
    fn ensure_indexes(&mut self, ty: &EntityType) -> usize {
        let mut created = Vec::new();
        for field in ty.fields.iter().filter(|f| f.has_index()) {
            if !self.indexes.contains_key(&field.name) {
                let index = Index::new(&field.name, vec![field.name.clone()], field.unique);
                self.indexes.insert(field.name.clone(), index);
                created.push((false, field.name.clone()));
            }
        }
        for (group, fields) in &ty.groups {
            if !self.composites.contains_key(group) {
                let index = Index::new(group, fields.clone(), false);
                self.composites.insert(group.clone(), index);
                created.push((true, group.clone()));
            }
        }
        for (composite, name) in &created {
            let index = if *composite {
                self.composites.get_mut(name)
            } else {
                self.indexes.get_mut(name)
            };
            if let Some(index) = index {
                for (key, record) in &self.records {
                    index.insert(key, record);
                }
            }
        }
        created.len()
    }

    fn all_indexes_mut(&mut self) -> impl Iterator<Item = &mut Index> {
        self.indexes.values_mut().chain(self.composites.values_mut())
    }

    fn index(&self, field: &str) -> Result<&Index, StorageError> {
        self.indexes.get(field).ok_or_else(|| {
            StorageError::backend(format!("no index on {}.{}", self.store, field))
        })
    }

    /// Resolve a caller-supplied key. Auto-key stores are addressed by id.
    fn resolve(&self, ty: &EntityType, key: &Key) -> Option<Key> {
        if !ty.auto_key {
            return Some(key.clone());
        }
        let [IndexableValue::String(id)] = key.0.as_slice() else {
            return Some(key.clone());
        };
        let lookup = Lookup::Exact(IndexableValue::String(id.clone()));
        match self.indexes.get(ID_FIELD) {
            Some(index) => index.lookup(&lookup).into_iter().next_back(),
            None => self
                .records
                .iter()
                .rev()
                .find(|(_, r)| r.get(ID_FIELD).and_then(Value::as_str) == Some(id))
                .map(|(k, _)| k.clone()),
        }
    }

    /// The key a write of `record` lands on. Snapshot stores always append.
    fn key_for(&mut self, ty: &EntityType, record: &Record) -> Result<Key, StorageError> {
        if !ty.auto_key {
            return ty.derive_key(record);
        }
        if !ty.snapshot {
            if let Some(id) = record.get(ID_FIELD).and_then(Value::as_str) {
                if let Some(existing) = self.resolve(ty, &Key::single(id)) {
                    if self.records.contains_key(&existing) {
                        return Ok(existing);
                    }
                }
            }
        }
        self.next_key += 1;
        Ok(Key(vec![IndexableValue::Number(self.next_key as f64)]))
    }

    fn put(&mut self, key: Key, record: Record) -> Result<Option<Record>, StorageError> {
        for index in self.indexes.values() {
            index.check_unique(&self.store, &key, &record)?;
        }
        let previous = self.records.remove(&key);
        for index in self.all_indexes_mut() {
            if let Some(previous) = &previous {
                index.remove(&key, previous);
            }
            index.insert(&key, &record);
        }
        self.records.insert(key, record);
        Ok(previous)
    }

    fn remove(&mut self, key: &Key) -> Option<Record> {
        let record = self.records.remove(key)?;
        for index in self.all_indexes_mut() {
            index.remove(key, &record);
        }
        Some(record)
    }

    fn fetch(&self, keys: BTreeSet<Key>) -> Vec<Record> {
        keys.iter()
            .filter_map(|key| self.records.get(key).cloned())
            .collect()
    }

    /// Rows for `plan.access`, before residual filtering.
    fn scan(&self, ty: &EntityType, plan: &QueryPlan) -> Result<Vec<Record>, StorageError> {
        match &plan.access {
            Access::FullScan => Ok(self.records.values().cloned().collect()),
            Access::OrderedScan { field, direction } => self.ordered_scan(ty, field, *direction),
            Access::Index { field, lookup } => Ok(self.fetch(self.index(field)?.lookup(lookup))),
            Access::Composite { group, values } => {
                let keys = self
                    .composites
                    .get(group)
                    .and_then(|index| index.entries.get(values))
                    .cloned()
                    .unwrap_or_default();
                Ok(self.fetch(keys))
            }
            Access::Intersect(lookups) => {
                let mut keys: Option<BTreeSet<Key>> = None;
                for (field, lookup) in lookups {
                    let found = self.index(field)?.lookup(lookup);
                    keys = Some(match keys {
                        None => found,
                        Some(acc) => acc.intersection(&found).cloned().collect(),
                    });
                    if keys.as_ref().is_some_and(BTreeSet::is_empty) {
                        break;
                    }
                }
                Ok(self.fetch(keys.unwrap_or_default()))
            }
        }
    }

    /// Walk the index of `field` in order. Records whose value is not a
    /// single scalar sort after every scalar (before, when descending), so
    /// they are ordered in memory and appended.
    fn ordered_scan(
        &self,
        ty: &EntityType,
        field: &str,
        direction: SortDirection,
    ) -> Result<Vec<Record>, StorageError> {
        let index = self.index(field)?;
        let groups: Box<dyn Iterator<Item = &BTreeSet<Key>> + '_> = match direction {
            SortDirection::Asc => Box::new(index.entries.values()),
            SortDirection::Desc => Box::new(index.entries.values().rev()),
        };

        let mut seen: BTreeSet<&Key> = BTreeSet::new();
        let mut ordered = Vec::new();
        for keys in groups {
            for key in keys {
                let Some(record) = self.records.get(key) else {
                    continue;
                };
                let scalar = record.get(field).and_then(IndexableValue::from_value);
                if scalar.is_some() && seen.insert(key) {
                    ordered.push(record.clone());
                }
            }
        }

        let rest: Vec<Record> = self
            .records
            .iter()
            .filter(|(key, _)| !seen.contains(key))
            .map(|(_, record)| record.clone())
            .collect();
        let clause = SortClause {
            field: field.to_string(),
            direction,
        };
        let mut rest = sort_records(ty, rest, std::slice::from_ref(&clause));
        Ok(match direction {
            SortDirection::Asc => {
                ordered.append(&mut rest);
                ordered
            }
            SortDirection::Desc => {
                rest.append(&mut ordered);
                rest
            }
        })
    }
}

// ============================================================================
// Databases
// ============================================================================

#[derive(Debug, Default)]
struct Database {
    version: u32,
    stores: HashMap<String, ObjectStore>,
}

#[derive(Debug, Default)]
struct State {
    databases: HashMap<String, Database>,
}

impl State {
    /// Open the object store of `ty`, upgrading its collection first when
    /// the registered schema version moved.
    fn open(&mut self, registry: &SchemaRegistry, ty: &EntityType) -> &mut ObjectStore {
        let version = registry.collection_version(&ty.collection);
        let db = self.databases.entry(ty.collection.clone()).or_default();
        if db.version != version {
            let types = registry.collection_types(&ty.collection);
            let mut created = 0;
            for t in &types {
                created += db
                    .stores
                    .entry(t.store.clone())
                    .or_insert_with(|| ObjectStore::new(t))
                    .ensure_indexes(t);
            }
            tracing::info!(
                collection = %ty.collection,
                from = db.version,
                to = version,
                stores = types.len(),
                indexes = created,
                "upgraded collection schema"
            );
            db.version = version;
        }
        let store = db
            .stores
            .entry(ty.store.clone())
            .or_insert_with(|| ObjectStore::new(ty));
        store.ensure_indexes(ty);
        store
    }

    fn write(
        &mut self,
        registry: &SchemaRegistry,
        ty: &EntityType,
        record: Record,
        reason: Option<&str>,
    ) -> Result<()> {
        let store = self.open(registry, ty);
        let key = store.key_for(ty, &record)?;
        let audit = ty.audited.then(|| record.clone());
        let previous = store.put(key, record)?;
        if let Some(state) = audit {
            let method = if previous.is_some() {
                Method::Update
            } else {
                Method::Insert
            };
            self.append_audit(registry, ty, method, &state, reason)?;
        }
        Ok(())
    }

    fn remove(
        &mut self,
        registry: &SchemaRegistry,
        ty: &EntityType,
        key: &Key,
        reason: Option<&str>,
    ) -> Result<Option<Record>> {
        let store = self.open(registry, ty);
        let Some(key) = store.resolve(ty, key) else {
            return Ok(None);
        };
        let removed = store.remove(&key);
        if let (Some(record), true) = (&removed, ty.audited) {
            self.append_audit(registry, ty, Method::Delete, record, reason)?;
        }
        Ok(removed)
    }

    fn append_audit(
        &mut self,
        registry: &SchemaRegistry,
        ty: &EntityType,
        method: Method,
        state: &Record,
        reason: Option<&str>,
    ) -> Result<()> {
        let Some(audit_ty) = registry.audit_type(&ty.store) else {
            return Ok(());
        };
        let row = audit_row(method, state, reason);
        let store = self.open(registry, &audit_ty);
        let key = store.key_for(&audit_ty, &row)?;
        store.put(key, row)?;
        Ok(())
    }
}

/// Fix-up access over the locked state.
struct Fixup<'a> {
    state: &'a mut State,
    registry: &'a SchemaRegistry,
    reason: Option<&'a str>,
}

impl ReferenceAccess for Fixup<'_> {
    fn find_referencing(
        &mut self,
        entity_type: &EntityType,
        field: &str,
        reference: &str,
    ) -> Result<Vec<Record>> {
        let store = self.state.open(self.registry, entity_type);
        let keys = store
            .index(field)?
            .lookup(&Lookup::Exact(IndexableValue::String(reference.to_string())));
        Ok(store
            .fetch(keys)
            .into_iter()
            .filter(|record| holds_reference(record.get(field), reference))
            .collect())
    }

    fn remove(&mut self, entity_type: &EntityType, record: &Record) -> Result<Option<Record>> {
        let key = if entity_type.auto_key {
            Key::single(record.get(ID_FIELD).and_then(Value::as_str).unwrap_or_default())
        } else {
            entity_type.derive_key(record)?
        };
        self.state
            .remove(self.registry, entity_type, &key, self.reason)
    }

    fn replace(&mut self, entity_type: &EntityType, record: Record) -> Result<()> {
        self.state
            .write(self.registry, entity_type, record, self.reason)
    }
}

// ============================================================================
// IndexedStore
// ============================================================================

/// In-memory indexed [`StorageAdapter`].
pub struct IndexedStore {
    registry: Arc<SchemaRegistry>,
    state: Mutex<State>,
}

impl IndexedStore {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(State::default()),
        }
    }

    /// Number of records currently held for `ty`.
    pub fn count(&self, ty: &EntityType) -> usize {
        self.state.lock().open(&self.registry, ty).records.len()
    }

    /// Every record of `ty` in primary-key order.
    pub fn records(&self, ty: &EntityType) -> Vec<Record> {
        self.state
            .lock()
            .open(&self.registry, ty)
            .records
            .values()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for IndexedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        let mut collections: Vec<(&String, u32)> = state
            .databases
            .iter()
            .map(|(name, db)| (name, db.version))
            .collect();
        collections.sort();
        f.debug_struct("IndexedStore")
            .field("collections", &collections)
            .finish()
    }
}

#[async_trait]
impl StorageAdapter for IndexedStore {
    async fn get(&self, entity_type: &EntityType, key: &Key) -> Result<Option<Record>> {
        let mut state = self.state.lock();
        let store = state.open(&self.registry, entity_type);
        Ok(store
            .resolve(entity_type, key)
            .and_then(|key| store.records.get(&key).cloned()))
    }

    async fn set(
        &self,
        entity_type: &EntityType,
        record: Record,
        reason: Option<&str>,
    ) -> Result<()> {
        self.state
            .lock()
            .write(&self.registry, entity_type, record, reason)
    }

    async fn set_many(
        &self,
        entity_type: &EntityType,
        records: Vec<Record>,
        reasons: &[Option<String>],
    ) -> Result<()> {
        let mut state = self.state.lock();
        for (i, record) in records.into_iter().enumerate() {
            let reason = reasons.get(i).and_then(|r| r.as_deref());
            state.write(&self.registry, entity_type, record, reason)?;
        }
        Ok(())
    }

    async fn delete(
        &self,
        entity_type: &EntityType,
        key: &Key,
        reason: Option<&str>,
    ) -> Result<Vec<ChangeMessage>> {
        let mut state = self.state.lock();
        let Some(record) = state.remove(&self.registry, entity_type, key, reason)? else {
            return Ok(Vec::new());
        };
        let mut changes = Vec::new();
        if let Some(id) = record.get(ID_FIELD).and_then(Value::as_str) {
            let mut access = Fixup {
                state: &mut *state,
                registry: &self.registry,
                reason,
            };
            fix_up_references(&self.registry, &mut access, entity_type, id, &mut changes)?;
        }
        Ok(changes)
    }

    async fn execute_query(&self, query: &QueryDescriptor) -> Result<QueryOutput> {
        let ty = query.entity_type();
        let plan = plan_query(query);
        tracing::trace!(query = %query, ?plan, "executing query");

        let mut rows = {
            let mut state = self.state.lock();
            state.open(&self.registry, ty).scan(ty, &plan)?
        };
        rows.retain(|row| plan.residual.iter().all(|f| f.matches(row)));
        if !plan.provides_sort {
            rows = sort_records(ty, rows, query.sort());
        }
        if let Some(limit) = plan.limit {
            rows.truncate(limit);
        }

        Ok(if query.is_first() {
            QueryOutput::One(rows.into_iter().next())
        } else {
            QueryOutput::Many(rows)
        })
    }
}

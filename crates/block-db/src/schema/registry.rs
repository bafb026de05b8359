//! SchemaRegistry: the single place entity types are registered.
//!
//! Registration freezes an [`EntityType`], derives its audit companion, and
//! indexes every relation field into the reverse-reference map consulted by
//! delete fix-up. The registry also owns the pending-materialization map
//! that coalesces concurrent loads of the same entity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;

use super::entity_type::EntityType;
use super::field::DeletePolicy;
use crate::audit::{derive_audit_type, AUDIT_COLLECTION};
use crate::entity::Entity;
use crate::error::SchemaError;

/// `referencing store → referencing field → policy`
type ReferencingFields = BTreeMap<String, BTreeMap<String, DeletePolicy>>;

/// One relation field pointing at a given store.
#[derive(Debug, Clone)]
pub struct Referrer {
    pub entity_type: Arc<EntityType>,
    pub field: String,
    pub policy: DeletePolicy,
}

/// Shared slot for an in-flight materialization.
pub(crate) type PendingCell = Arc<OnceCell<Arc<Entity>>>;

#[derive(Default)]
pub struct SchemaRegistry {
    types: RwLock<HashMap<String, Arc<EntityType>>>,
    audit_types: RwLock<HashMap<String, Arc<EntityType>>>,
    /// referenced store → referencing store → field → policy
    references: RwLock<HashMap<String, ReferencingFields>>,
    pending: Mutex<HashMap<String, PendingCell>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ty`. A store name may be registered only once.
    pub fn register(&self, ty: EntityType) -> Result<Arc<EntityType>, SchemaError> {
        if ty.collection == AUDIT_COLLECTION {
            return Err(SchemaError::InvalidName {
                kind: "collection",
                name: ty.collection,
            });
        }
        let mut types = self.types.write();
        if types.contains_key(&ty.store) {
            return Err(SchemaError::DuplicateStore(ty.store));
        }

        let ty = Arc::new(ty);
        {
            let mut references = self.references.write();
            for field in ty.relation_fields() {
                let Some(relation) = &field.relation else {
                    continue;
                };
                for target in &relation.targets {
                    references
                        .entry(target.clone())
                        .or_default()
                        .entry(ty.store.clone())
                        .or_default()
                        .insert(field.name.clone(), relation.on_delete);
                }
            }
        }

        if ty.audited {
            self.audit_types
                .write()
                .insert(ty.store.clone(), Arc::new(derive_audit_type(&ty)));
        }

        types.insert(ty.store.clone(), Arc::clone(&ty));
        Ok(ty)
    }

    pub fn get(&self, store: &str) -> Result<Arc<EntityType>, SchemaError> {
        self.find(store)
            .ok_or_else(|| SchemaError::UnknownStore(store.to_string()))
    }

    pub fn find(&self, store: &str) -> Option<Arc<EntityType>> {
        self.types.read().get(store).cloned()
    }

    /// The derived audit type of an audited store.
    pub fn audit_type(&self, store: &str) -> Option<Arc<EntityType>> {
        self.audit_types.read().get(store).cloned()
    }

    /// Every type whose records live in `collection`, sorted by store name.
    pub fn collection_types(&self, collection: &str) -> Vec<Arc<EntityType>> {
        let mut types: Vec<Arc<EntityType>> = if collection == AUDIT_COLLECTION {
            self.audit_types.read().values().cloned().collect()
        } else {
            self.types
                .read()
                .values()
                .filter(|ty| ty.collection == collection)
                .cloned()
                .collect()
        };
        types.sort_by(|a, b| a.store.cmp(&b.store));
        types
    }

    /// Schema version of a collection: the sum of its types' versions.
    pub fn collection_version(&self, collection: &str) -> u32 {
        self.collection_types(collection)
            .iter()
            .map(|ty| ty.version)
            .sum()
    }

    /// Relation fields on other types that point at `store`.
    pub fn referrers(&self, store: &str) -> Vec<Referrer> {
        let references = self.references.read();
        let Some(stores) = references.get(store) else {
            return Vec::new();
        };
        let types = self.types.read();
        let mut out = Vec::new();
        for (referencing, fields) in stores {
            let Some(entity_type) = types.get(referencing) else {
                continue;
            };
            for (field, policy) in fields {
                out.push(Referrer {
                    entity_type: Arc::clone(entity_type),
                    field: field.clone(),
                    policy: *policy,
                });
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Pending materializations
    // ------------------------------------------------------------------

    /// The shared slot for `reference`, creating it if no load is in flight.
    pub(crate) fn pending_cell(&self, reference: &str) -> PendingCell {
        self.pending
            .lock()
            .entry(reference.to_string())
            .or_default()
            .clone()
    }

    /// The entity a finished load left in the slot for `reference`. Never
    /// waits on a load still in flight.
    pub(crate) fn pending_value(&self, reference: &str) -> Option<Arc<Entity>> {
        self.pending
            .lock()
            .get(reference)
            .and_then(|cell| cell.get().cloned())
    }

    /// Drop the slot for `reference` once it is no longer in flight.
    pub(crate) fn clear_pending(&self, reference: &str, cell: &PendingCell) {
        let mut pending = self.pending.lock();
        if pending
            .get(reference)
            .map(|current| Arc::ptr_eq(current, cell))
            .unwrap_or(false)
        {
            pending.remove(reference);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stores: Vec<String> = self.types.read().keys().cloned().collect();
        stores.sort();
        f.debug_struct("SchemaRegistry")
            .field("stores", &stores)
            .field("pending", &self.pending_count())
            .finish()
    }
}

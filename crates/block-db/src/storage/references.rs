//! Reference fix-up after a delete.
//!
//! When an entity is removed, every relation field that points at its store
//! (per the registry's reverse-reference index) is searched for the deleted
//! reference. `Cascade` fields delete the referencing entity, which repeats
//! the process for it; `Unset` fields drop the reference and rewrite the
//! record. Adapters call [`fix_up_references`] from their `delete` with an
//! implementation of [`ReferenceAccess`] over their own storage.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::entity::Reference;
use crate::error::Result;
use crate::schema::{DeletePolicy, EntityType, SchemaRegistry, ID_FIELD};
use crate::types::{ChangeMessage, Method, Record};

/// Synchronous record access used during fix-up. Implementations run inside
/// whatever lock or transaction the adapter's `delete` already holds.
pub trait ReferenceAccess {
    /// Records of `entity_type` whose `field` holds `reference` (directly or
    /// as an element of a list).
    fn find_referencing(
        &mut self,
        entity_type: &EntityType,
        field: &str,
        reference: &str,
    ) -> Result<Vec<Record>>;

    /// Remove a record, returning its last state.
    fn remove(&mut self, entity_type: &EntityType, record: &Record) -> Result<Option<Record>>;

    /// Overwrite a record.
    fn replace(&mut self, entity_type: &EntityType, record: Record) -> Result<()>;
}

/// Fix up everything that referenced `id` of `deleted`, appending one change
/// message per affected entity to `out`.
pub fn fix_up_references(
    registry: &SchemaRegistry,
    access: &mut impl ReferenceAccess,
    deleted: &EntityType,
    id: &str,
    out: &mut Vec<ChangeMessage>,
) -> Result<()> {
    let mut queue: VecDeque<Reference> = VecDeque::new();
    let mut visited: HashSet<Reference> = HashSet::new();
    let first = Reference::new(&deleted.collection, &deleted.store, id);
    visited.insert(first.clone());
    queue.push_back(first);

    while let Some(target) = queue.pop_front() {
        let target_text = target.to_string();
        for referrer in registry.referrers(&target.store) {
            let ty: &Arc<EntityType> = &referrer.entity_type;
            let records = access.find_referencing(ty, &referrer.field, &target_text)?;
            for mut record in records {
                let Some(record_id) = record.get(ID_FIELD).and_then(Value::as_str) else {
                    continue;
                };
                let record_id = record_id.to_string();
                match referrer.policy {
                    DeletePolicy::Cascade => {
                        let next = Reference::new(&ty.collection, &ty.store, &record_id);
                        if !visited.insert(next.clone()) {
                            continue;
                        }
                        if access.remove(ty, &record)?.is_some() {
                            tracing::debug!(
                                store = %ty.store,
                                id = %record_id,
                                reference = %target_text,
                                "cascade delete"
                            );
                            out.push(ChangeMessage::deleted(&ty.store, &record_id));
                            queue.push_back(next);
                        }
                    }
                    DeletePolicy::Unset => {
                        if !unset_reference(&mut record, &referrer.field, &target_text) {
                            continue;
                        }
                        access.replace(ty, record.clone())?;
                        out.push(ChangeMessage::new(&ty.store, Method::Update, record));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Remove `reference` from `field`. Returns whether the record changed.
fn unset_reference(record: &mut Record, field: &str, reference: &str) -> bool {
    match record.get_mut(field) {
        Some(Value::Array(items)) => {
            let before = items.len();
            items.retain(|item| item.as_str() != Some(reference));
            items.len() != before
        }
        Some(Value::String(current)) if current == reference => {
            record.remove(field);
            true
        }
        _ => false,
    }
}

/// Whether a serialized relation value points at `reference`.
pub(crate) fn holds_reference(value: Option<&Value>, reference: &str) -> bool {
    match value {
        Some(Value::String(s)) => s == reference,
        Some(Value::Array(items)) => items.iter().any(|item| item.as_str() == Some(reference)),
        _ => false,
    }
}

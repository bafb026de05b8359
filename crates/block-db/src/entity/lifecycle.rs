//! Storage-facing entity operations: commit, delete, discard.
//!
//! Commits are optimistic: subscribers see the new state before the durable
//! write happens. When the write fails the affected entities are reloaded
//! from storage, subscribers are reconciled to the stored state, and the
//! caller gets [`BlockDbError::CommitFailed`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use uuid::Uuid;

use super::{Entity, Reference};
use crate::error::{BlockDbError, Result};
use crate::schema::EntityType;
use crate::store::Store;
use crate::types::{ChangeMessage, CommitOptions, DeleteOptions, Key, Method, Record};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ============================================================================
// Batch
// ============================================================================

/// Writes collected by one (possibly cascading) commit, flushed together
/// once the whole tree has been staged.
struct Batch {
    token: Uuid,
    reason: Option<String>,
    writes: Vec<(Arc<EntityType>, ChangeMessage)>,
}

impl Batch {
    fn new(reason: Option<String>) -> Self {
        Self {
            token: Uuid::new_v4(),
            reason,
            writes: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// One `set_many` per store, in first-staged order.
    async fn flush(&self, store: &Store) -> Result<()> {
        let mut order: Vec<&str> = Vec::new();
        let mut groups: BTreeMap<&str, (&Arc<EntityType>, Vec<Record>)> = BTreeMap::new();
        for (ty, message) in &self.writes {
            let group = groups.entry(ty.store.as_str()).or_insert_with(|| {
                order.push(ty.store.as_str());
                (ty, Vec::new())
            });
            group.1.push(message.state.clone());
        }
        for name in order {
            let Some((ty, records)) = groups.remove(name) else {
                continue;
            };
            let reasons = vec![self.reason.clone(); records.len()];
            store.adapter().set_many(ty, records, &reasons).await?;
        }
        tracing::debug!(batch = %self.token, writes = self.writes.len(), "batch flushed");
        Ok(())
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl Entity {
    /// Persist this entity, and with `cascade` every resolved descendant
    /// that changed. Committing unchanged state is a no-op.
    pub async fn commit(&mut self, store: &Store, options: CommitOptions) -> Result<()> {
        if let Some(scope) = &options.scope {
            if !self.ty.global {
                self.set_scope(scope.clone())?;
            }
        }

        let original = self.clone();
        let mut batch = Batch::new(options.reason.clone());
        let mut memo = HashMap::new();
        self.stage(&mut batch, options.cascade, &mut memo);
        if batch.is_empty() {
            return Ok(());
        }

        let staged: HashMap<Reference, Record> = batch
            .writes
            .iter()
            .filter_map(|(ty, message)| {
                let id = message.id()?;
                let reference = Reference::new(&ty.collection, &ty.store, id);
                Some((reference, message.state.clone()))
            })
            .collect();
        store.open_batch(batch.token, staged);
        for (_, message) in &batch.writes {
            store.dispatch(message.clone(), false).await;
        }
        let flushed = batch.flush(store).await;
        store.close_batch(batch.token);

        let Err(err) = flushed else {
            return Ok(());
        };

        tracing::warn!(
            store = %self.ty.store,
            id = %self.id,
            batch = %batch.token,
            error = %err,
            "durable write failed; rolling back"
        );
        *self = original;
        for (ty, message) in &batch.writes {
            let Some(id) = message.id() else {
                continue;
            };
            if ty.store == self.ty.store && id == self.id {
                continue;
            }
            if let Err(reconcile_err) = store.reconcile(ty, id).await {
                tracing::warn!(store = %ty.store, id = %id, error = %reconcile_err, "reconcile failed");
            }
        }
        if let Err(discard_err) = self.discard(store).await {
            tracing::warn!(
                store = %self.ty.store,
                id = %self.id,
                error = %discard_err,
                "reconcile failed"
            );
        }
        Err(BlockDbError::CommitFailed {
            store: self.ty.store.clone(),
            id: self.id.clone(),
            message: err.to_string(),
        })
    }

    /// Stage this entity (and with `cascade` its changed descendants) into
    /// `batch`, updating shadows. Returns whether anything under this node
    /// changed, in which case the caller must take the updated node.
    fn stage(
        &mut self,
        batch: &mut Batch,
        cascade: bool,
        memo: &mut HashMap<Reference, Option<Arc<Entity>>>,
    ) -> bool {
        memo.insert(self.reference(), None);
        let mut descendants_changed = false;

        if cascade {
            for (field, slot, child) in self.child_slots() {
                let reference = child.reference();
                let staged = match memo.get(&reference) {
                    Some(done) => done.clone(),
                    None => {
                        let mut copy = (*child).clone();
                        let staged = copy.stage(batch, cascade, memo).then(|| Arc::new(copy));
                        memo.insert(reference, staged.clone());
                        staged
                    }
                };
                if let Some(child) = staged {
                    self.replace_child(&field, slot, child);
                    descendants_changed = true;
                }
            }
        }

        if self.is_persisted() && self.changed_fields().is_empty() {
            return descendants_changed;
        }
        let method = if self.is_persisted() {
            Method::Update
        } else {
            Method::Insert
        };
        let record = self.to_record();
        batch
            .writes
            .push((Arc::clone(&self.ty), ChangeMessage::new(&self.ty.store, method, record.clone())));
        self.shadow = Some(record);
        true
    }

    /// Remove this entity from storage and from every live result. With
    /// `cascade`, every entity it relates to is deleted as well. Entities
    /// that reference this one are fixed up by the adapter according to
    /// their delete policy.
    pub async fn delete(&mut self, store: &Store, options: DeleteOptions) -> Result<()> {
        let mut visited = HashSet::new();
        self.delete_with(store, &options, &mut visited).await
    }

    fn delete_with<'a>(
        &'a mut self,
        store: &'a Store,
        options: &'a DeleteOptions,
        visited: &'a mut HashSet<Reference>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            visited.insert(self.reference());
            let key = self.storage_key()?;
            let fixups = store
                .adapter()
                .delete(&self.ty, &key, options.reason.as_deref())
                .await?;
            self.shadow = None;

            store
                .dispatch(ChangeMessage::deleted(&self.ty.store, &self.id), false)
                .await;
            for message in fixups {
                store.dispatch(message, false).await;
            }

            if !options.cascade {
                return Ok(());
            }
            let references: Vec<Reference> = self
                .ty
                .relation_fields()
                .flat_map(|def| self.references(&def.name))
                .collect();
            for reference in references {
                if visited.contains(&reference) {
                    continue;
                }
                let Some(child) = store.resolve(&reference).await? else {
                    visited.insert(reference);
                    continue;
                };
                let mut child = (*child).clone();
                child.delete_with(store, options, visited).await?;
            }
            Ok(())
        })
    }

    /// Drop local edits: reload the stored state into this entity and push
    /// it to subscribers. Returns `false` (and marks the entity unpersisted)
    /// when nothing is stored any more.
    pub async fn discard(&mut self, store: &Store) -> Result<bool> {
        match store.reconcile(&self.ty, &self.id).await? {
            Some(record) => {
                let fresh = store.materialize(&self.ty, &record).await?;
                self.replace_state((*fresh).clone());
                Ok(true)
            }
            None => {
                self.shadow = None;
                Ok(false)
            }
        }
    }

    /// The key this entity is stored under: derived from the persisted state
    /// when there is one, since key fields may have been edited since.
    fn storage_key(&self) -> Result<Key> {
        if self.ty.auto_key {
            return Ok(Key::single(self.id.as_str()));
        }
        match &self.shadow {
            Some(shadow) => Ok(self.ty.derive_key(shadow)?),
            None => Ok(self.key()?),
        }
    }
}

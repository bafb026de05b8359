//! LiveSubscription: one cached, continuously re-evaluated query.
//!
//! A subscription owns the materialized result of its descriptor and keeps it
//! current by folding every [`ChangeMessage`] into the cache without going
//! back to storage, except where the cache cannot decide on its own
//! (single-result queries losing their only entry).
//!
//! # Locking
//!
//! `gate` (a `tokio::sync::Mutex`) serializes the initial load against
//! `evaluate`, so a change arriving while the first query is in flight waits
//! for it instead of racing it. `state` is a `parking_lot::Mutex` and is never
//! held across an await or while callbacks run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::emitter::{Emitter, ListenerId};
use crate::entity::{Entity, Reference};
use crate::error::Result;
use crate::query::{sort_by_clauses, QueryDescriptor, QueryResult};
use crate::store::Store;
use crate::types::{ChangeMessage, Method};

// ============================================================================
// QueryUpdate
// ============================================================================

/// Delivered to subscription callbacks: the full current result plus the
/// entity and method that caused it (both `None` for the initial load).
#[derive(Debug, Clone)]
pub struct QueryUpdate {
    pub result: QueryResult,
    pub entity: Option<Arc<Entity>>,
    pub method: Option<Method>,
}

// ============================================================================
// LiveSubscription
// ============================================================================

#[derive(Default)]
struct LiveState {
    /// `None` until the initial query has completed.
    cache: Option<Vec<Arc<Entity>>>,
    /// Latest debounced update not yet delivered.
    pending: Option<QueryUpdate>,
}

pub struct LiveSubscription {
    descriptor: QueryDescriptor,
    canonical: String,
    pub(crate) emitter: Emitter<QueryUpdate>,
    state: Mutex<LiveState>,
    gate: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    retired: AtomicBool,
}

impl LiveSubscription {
    pub(crate) fn new(descriptor: QueryDescriptor) -> Self {
        let canonical = descriptor.canonical();
        Self {
            descriptor,
            canonical,
            emitter: Emitter::new(),
            state: Mutex::new(LiveState::default()),
            gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            retired: AtomicBool::new(false),
        }
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().cache.is_some()
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.state.lock().pending = None;
    }

    /// The cached result, if the initial load has completed.
    pub fn current(&self) -> Option<QueryResult> {
        self.state
            .lock()
            .cache
            .clone()
            .map(|entities| QueryResult::from_entities(entities, self.descriptor.is_first()))
    }

    /// Cached root entities (empty before the initial load).
    pub(crate) fn entities(&self) -> Vec<Arc<Entity>> {
        self.state.lock().cache.clone().unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// Load the result if nobody has yet, then hand the current result to
    /// `listener`.
    pub(crate) async fn activate(&self, store: &Store, listener: ListenerId) -> Result<()> {
        let _gate = self.gate.lock().await;
        if !self.is_loaded() {
            let entities = store.execute_fresh(&self.descriptor).await?;
            self.state.lock().cache = Some(entities);
            tracing::debug!(query = %self.canonical, "subscription loaded");
        }
        if let Some(result) = self.current() {
            let update = QueryUpdate {
                result,
                entity: None,
                method: None,
            };
            self.emitter.emit_to(listener, &update);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Fold one change into the cache and notify listeners if the result
    /// changed. `debounce` delays delivery so bursts of remote or bulk
    /// changes collapse into one callback.
    pub(crate) async fn evaluate(
        self: &Arc<Self>,
        store: &Store,
        message: &ChangeMessage,
        debounce: bool,
    ) -> Result<()> {
        if self.is_retired() {
            return Ok(());
        }
        let _gate = self.gate.lock().await;
        let Some(id) = message.id() else {
            return Ok(());
        };
        let Some(cached) = self.state.lock().cache.clone() else {
            return Ok(());
        };

        let same_store = message.store == self.descriptor.store();
        let position = if same_store {
            cached.iter().position(|e| e.id() == id)
        } else {
            None
        };
        let matches = same_store
            && message.method != Method::Delete
            && self.descriptor.matches(&message.store, &message.state);

        let outcome = if position.is_some() || matches {
            let method = if matches { message.method } else { Method::Delete };
            Some(
                self.apply_direct(store, cached, position, method, message)
                    .await?,
            )
        } else if message.method.is_upsert() {
            self.apply_descendant(store, &cached, message).await?
        } else {
            None
        };

        let Some((next, entity, method)) = outcome else {
            return Ok(());
        };
        let update = QueryUpdate {
            result: QueryResult::from_entities(next.clone(), self.descriptor.is_first()),
            entity,
            method: Some(method),
        };
        self.state.lock().cache = Some(next);
        if debounce {
            self.schedule(update, store.config().debounce());
        } else {
            self.notify(update);
        }
        Ok(())
    }

    /// The changed entity itself is (or was) part of the result.
    async fn apply_direct(
        &self,
        store: &Store,
        cached: Vec<Arc<Entity>>,
        position: Option<usize>,
        method: Method,
        message: &ChangeMessage,
    ) -> Result<(Vec<Arc<Entity>>, Option<Arc<Entity>>, Method)> {
        let first = self.descriptor.is_first();

        if method == Method::Delete {
            let removed = position.map(|i| Arc::clone(&cached[i]));
            let mut next = cached;
            if let Some(i) = position {
                next.remove(i);
            }
            if first && removed.is_some() {
                next = store.execute_fresh(&self.descriptor).await?;
            }
            return Ok((next, removed, method));
        }

        let ty = self.descriptor.entity_type();
        let entity = match position {
            Some(i) => store.adopt(&cached[i], &message.state).await?,
            None => store.materialize(ty, &message.state).await?,
        };
        let mut next = cached;
        match position {
            Some(i) => next[i] = Arc::clone(&entity),
            None => next.push(Arc::clone(&entity)),
        }
        next = sort_by_clauses(
            next,
            self.descriptor.sort(),
            |e| e.key().ok(),
            |e, field| e.field_value(field),
        );
        if first {
            if position.is_some() {
                // The sole entry may have ranked itself out; storage decides.
                next = store.execute_fresh(&self.descriptor).await?;
            } else {
                next.truncate(1);
            }
        }
        Ok((next, Some(entity), method))
    }

    /// The changed entity is not a root of the result but may be nested
    /// inside one. Rewrites every ancestor path up to the affected roots,
    /// leaving untouched subtrees shared.
    async fn apply_descendant(
        &self,
        store: &Store,
        cached: &[Arc<Entity>],
        message: &ChangeMessage,
    ) -> Result<Option<(Vec<Arc<Entity>>, Option<Arc<Entity>>, Method)>> {
        let Some(id) = message.id() else {
            return Ok(None);
        };
        let id_value = serde_json::Value::String(id.to_string());
        let Some(existing) = cached
            .iter()
            .find_map(|root| root.find(&message.store, Some(("id", &id_value))))
        else {
            return Ok(None);
        };
        let replacement = store.adopt(&existing, &message.state).await?;
        if Arc::ptr_eq(&replacement, &existing) {
            return Ok(None);
        }

        let target = existing.reference();
        let mut memo: HashMap<Reference, Option<Arc<Entity>>> = HashMap::new();
        let mut changed = false;
        let next: Vec<Arc<Entity>> = cached
            .iter()
            .map(|root| match rewrite_path(root, &target, &replacement, &mut memo) {
                Some(rewritten) => {
                    changed = true;
                    rewritten
                }
                None => Arc::clone(root),
            })
            .collect();
        if !changed {
            return Ok(None);
        }
        Ok(Some((next, Some(replacement), message.method)))
    }

    // ------------------------------------------------------------------
    // Notification
    // ------------------------------------------------------------------

    fn notify(&self, update: QueryUpdate) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state.lock().pending = None;
        self.emitter.emit(&update);
    }

    /// Deliver `update` after `delay` unless a newer update supersedes it.
    fn schedule(self: &Arc<Self>, update: QueryUpdate, delay: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.lock().pending = Some(update);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.generation.load(Ordering::Acquire) != generation || this.is_retired() {
                return;
            }
            let update = this.state.lock().pending.take();
            if let Some(update) = update {
                this.emitter.emit(&update);
            }
        });
    }
}

impl std::fmt::Debug for LiveSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSubscription")
            .field("query", &self.canonical)
            .field("listeners", &self.emitter.len())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Copy-on-write rewrite of every path from `node` down to `target`.
/// Returns `None` when nothing under `node` changed. `memo` doubles as the
/// visited set, so shared subtrees are rewritten once and cycles terminate.
fn rewrite_path(
    node: &Arc<Entity>,
    target: &Reference,
    replacement: &Arc<Entity>,
    memo: &mut HashMap<Reference, Option<Arc<Entity>>>,
) -> Option<Arc<Entity>> {
    let reference = node.reference();
    if let Some(done) = memo.get(&reference) {
        return done.clone();
    }
    memo.insert(reference.clone(), None);

    let mut copy: Option<Entity> = None;
    for (field, slot, child) in node.child_slots() {
        let new_child = if child.reference() == *target {
            (!Arc::ptr_eq(&child, replacement)).then(|| Arc::clone(replacement))
        } else {
            rewrite_path(&child, target, replacement, memo)
        };
        if let Some(new_child) = new_child {
            copy.get_or_insert_with(|| (**node).clone())
                .replace_child(&field, slot, new_child);
        }
    }

    let result = copy.map(Arc::new);
    memo.insert(reference, result.clone());
    result
}

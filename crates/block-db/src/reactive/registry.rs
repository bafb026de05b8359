//! SubscriptionRegistry: live subscriptions keyed by canonical descriptor.
//!
//! Equivalent descriptors share one [`LiveSubscription`]: the second
//! subscriber attaches its callback to the existing entry instead of issuing
//! another storage query. A subscription is retired when its last
//! [`SubscriptionHandle`] is dropped.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use super::emitter::{ListenerFn, ListenerId};
use super::live::{LiveSubscription, QueryUpdate};
use crate::diff::json_equal;
use crate::entity::{Entity, Reference};
use crate::error::Result;
use crate::query::{QueryDescriptor, QueryResult};
use crate::storage::StorageAdapter;
use crate::store::Store;
use crate::types::ChangeMessage;

struct RegistryInner {
    adapter: Arc<dyn StorageAdapter>,
    subscriptions: Mutex<BTreeMap<String, Arc<LiveSubscription>>>,
}

impl RegistryInner {
    /// Drop `live` if it has no listeners left and is still the registered
    /// entry for its descriptor.
    fn retire(&self, live: &Arc<LiveSubscription>) {
        let removed = {
            let mut subscriptions = self.subscriptions.lock();
            let current = subscriptions
                .get(live.canonical())
                .is_some_and(|entry| Arc::ptr_eq(entry, live));
            if current && live.emitter.is_empty() {
                subscriptions.remove(live.canonical());
                live.retire();
                true
            } else {
                false
            }
        };
        if removed {
            self.adapter.on_subscription_stop(live.descriptor());
            tracing::debug!(query = %live.canonical(), "subscription retired");
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                adapter,
                subscriptions: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live subscription registered for `descriptor`, if any.
    pub fn get(&self, descriptor: &QueryDescriptor) -> Option<Arc<LiveSubscription>> {
        self.inner
            .subscriptions
            .lock()
            .get(&descriptor.canonical())
            .cloned()
    }

    /// Attach `callback` to the subscription for `descriptor`, creating and
    /// loading it if needed. The callback receives the current result before
    /// this returns.
    pub(crate) async fn subscribe(
        &self,
        store: &Store,
        descriptor: &QueryDescriptor,
        callback: Arc<ListenerFn<QueryUpdate>>,
    ) -> Result<SubscriptionHandle> {
        let (live, listener, created) = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let canonical = descriptor.canonical();
            let (live, created) = match subscriptions.get(&canonical) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let live = Arc::new(LiveSubscription::new(descriptor.clone()));
                    subscriptions.insert(canonical, Arc::clone(&live));
                    (live, true)
                }
            };
            let listener = live.emitter.on_shared(callback);
            (live, listener, created)
        };

        if created {
            self.inner.adapter.on_subscription_start(descriptor);
            tracing::debug!(query = %live.canonical(), "subscription started");
        }

        let handle = SubscriptionHandle {
            registry: Arc::downgrade(&self.inner),
            live: Arc::clone(&live),
            listener: Some(listener),
        };
        // On failure the handle drops here and detaches the listener.
        live.activate(store, listener).await?;
        Ok(handle)
    }

    /// Run `message` through every live subscription.
    pub(crate) async fn evaluate(&self, store: &Store, message: &ChangeMessage, debounce: bool) {
        let snapshot: Vec<Arc<LiveSubscription>> =
            self.inner.subscriptions.lock().values().cloned().collect();
        for live in snapshot {
            if let Err(err) = live.evaluate(store, message, debounce).await {
                tracing::warn!(
                    query = %live.canonical(),
                    store = %message.store,
                    error = %err,
                    "failed to apply change to subscription"
                );
            }
        }
    }

    /// The loaded result of an equivalent live subscription.
    pub fn find_cached(&self, descriptor: &QueryDescriptor) -> Option<QueryResult> {
        self.get(descriptor).and_then(|live| live.current())
    }

    /// Search loaded subscriptions of the same collection and scope for an
    /// entity of `store` whose `field` equals `value`, at any depth.
    pub fn find_entity(
        &self,
        descriptor: &QueryDescriptor,
        field: &str,
        value: &Value,
    ) -> Option<Arc<Entity>> {
        let collection = &descriptor.entity_type().collection;
        let store = descriptor.store();
        self.loaded()
            .into_iter()
            .filter(|live| {
                live.descriptor().entity_type().collection == *collection
                    && live.descriptor().scope() == descriptor.scope()
            })
            .flat_map(|live| live.entities())
            .find_map(|root| {
                if root.store() == store && json_equal(&root.field_value(field), value) {
                    Some(root)
                } else {
                    root.find(store, Some((field, value)))
                }
            })
    }

    /// The cached instance of `reference` held by any subscription.
    pub(crate) fn find_reference(&self, reference: &Reference) -> Option<Arc<Entity>> {
        let id = Value::String(reference.id.clone());
        self.loaded()
            .into_iter()
            .flat_map(|live| live.entities())
            .find_map(|root| {
                if root.reference() == *reference {
                    Some(root)
                } else {
                    root.find(&reference.store, Some(("id", &id)))
                        .filter(|found| found.entity_type().collection == reference.collection)
                }
            })
    }

    fn loaded(&self) -> Vec<Arc<LiveSubscription>> {
        self.inner
            .subscriptions
            .lock()
            .values()
            .filter(|live| live.is_loaded())
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queries: Vec<String> = self.inner.subscriptions.lock().keys().cloned().collect();
        f.debug_struct("SubscriptionRegistry")
            .field("queries", &queries)
            .finish()
    }
}

// ============================================================================
// SubscriptionHandle
// ============================================================================

/// Keeps one callback attached to a live subscription. Dropping the handle
/// (or calling [`unsubscribe`](Self::unsubscribe)) detaches it.
pub struct SubscriptionHandle {
    registry: Weak<RegistryInner>,
    live: Arc<LiveSubscription>,
    listener: Option<ListenerId>,
}

impl SubscriptionHandle {
    /// The subscription's current result.
    pub fn current(&self) -> QueryResult {
        self.live
            .current()
            .unwrap_or_else(|| QueryResult::empty(self.live.descriptor().is_first()))
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        self.live.descriptor()
    }

    pub fn is_active(&self) -> bool {
        self.listener.is_some() && !self.live.is_retired()
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        if self.live.emitter.off(listener) == 0 {
            if let Some(registry) = self.registry.upgrade() {
                registry.retire(&self.live);
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("query", &self.live.canonical())
            .field("listener", &self.listener)
            .finish()
    }
}

//! Store: the explicitly constructed context every operation runs against.
//!
//! A `Store` ties together the schema registry, a storage adapter, the live
//! subscription registry and (optionally) a broadcast hub shared with other
//! contexts. It is cheap to clone; clones share everything.
//!
//! Materialization turns stored records into entity graphs. Relations are
//! resolved eagerly unless the field is declared lazy; references that cannot
//! be resolved are logged and skipped; references back into the chain being
//! built stay lazy so cycles terminate. Instances already held by a live
//! subscription are reused so equal entities are shared across results.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audit::{history, ChangeEntry};
use crate::diff::field_equal;
use crate::entity::{parse_references, Entity, FieldValue, Reference, Relation};
use crate::error::{BlockDbError, Result};
use crate::query::{sort_records, Filter, Operator, QueryDescriptor, QueryResult};
use crate::reactive::{
    BroadcastHub, Envelope, LiveBinding, QueryUpdate, SubscriptionHandle, SubscriptionRegistry,
};
use crate::schema::{EntityType, FieldDef, SchemaRegistry, ID_FIELD};
use crate::storage::{IndexedStore, QueryOutput, StorageAdapter};
use crate::types::{BulkCommitOptions, ChangeMessage, Key, Method, Record};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// State of one logical fetch: the references currently being built, and
/// every entity already built, so each identifier is materialized once.
#[derive(Default)]
struct Fetch {
    chain: HashSet<Reference>,
    built: HashMap<Reference, Arc<Entity>>,
}

// ============================================================================
// StoreConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Delay before remote or bulk changes reach subscription callbacks.
    pub debounce_ms: u64,
    /// Capacity of hubs created with [`StoreConfig::new_hub`].
    pub broadcast_capacity: usize,
    /// Label recorded in log events.
    pub context_name: Option<String>,
}

impl StoreConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn new_hub(&self) -> BroadcastHub {
        BroadcastHub::new(self.broadcast_capacity)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            broadcast_capacity: 256,
            context_name: None,
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct StoreBuilder {
    registry: Arc<SchemaRegistry>,
    adapter: Option<Arc<dyn StorageAdapter>>,
    config: StoreConfig,
    hub: Option<BroadcastHub>,
}

impl StoreBuilder {
    pub fn adapter(mut self, adapter: impl StorageAdapter + 'static) -> Self {
        self.adapter = Some(Arc::new(adapter));
        self
    }

    pub fn shared_adapter(mut self, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Exchange changes with every other store attached to `hub`.
    pub fn hub(mut self, hub: BroadcastHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Build the store. Attaching a hub spawns a listener task, which needs
    /// a running tokio runtime.
    pub fn build(self) -> Result<Store> {
        let adapter = self
            .adapter
            .unwrap_or_else(|| Arc::new(IndexedStore::new(Arc::clone(&self.registry))));
        let store = Store::from_parts(self.registry, adapter, self.config, self.hub.clone());
        if let Some(hub) = self.hub {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                BlockDbError::Internal("a tokio runtime is required to attach a broadcast hub".into())
            })?;
            let task = runtime.spawn(listen(
                hub.subscribe(),
                store.inner.context_id,
                Arc::downgrade(&store.inner),
            ));
            *store.inner.listener.lock() = Some(task);
        }
        Ok(store)
    }
}

/// Apply changes published by other contexts until the hub closes or the
/// store is dropped.
async fn listen(mut receiver: broadcast::Receiver<Envelope>, origin: Uuid, store: Weak<StoreInner>) {
    loop {
        match receiver.recv().await {
            Ok(envelope) => {
                if envelope.origin == origin {
                    continue;
                }
                let Some(inner) = store.upgrade() else {
                    break;
                };
                Store { inner }.receive_remote(&envelope.message).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "broadcast receiver lagged; remote changes were dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

struct StoreInner {
    registry: Arc<SchemaRegistry>,
    adapter: Arc<dyn StorageAdapter>,
    subscriptions: SubscriptionRegistry,
    config: StoreConfig,
    hub: Option<BroadcastHub>,
    context_id: Uuid,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Records of commits whose durable write is still in flight, by batch.
    batches: Mutex<HashMap<Uuid, HashMap<Reference, Record>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Some(task) = self.listener.get_mut().take() {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn builder(registry: Arc<SchemaRegistry>) -> StoreBuilder {
        StoreBuilder {
            registry,
            adapter: None,
            config: StoreConfig::default(),
            hub: None,
        }
    }

    /// A standalone store over a fresh [`IndexedStore`].
    pub fn in_memory(registry: Arc<SchemaRegistry>) -> Self {
        let adapter = Arc::new(IndexedStore::new(Arc::clone(&registry)));
        Self::from_parts(registry, adapter, StoreConfig::default(), None)
    }

    fn from_parts(
        registry: Arc<SchemaRegistry>,
        adapter: Arc<dyn StorageAdapter>,
        config: StoreConfig,
        hub: Option<BroadcastHub>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                subscriptions: SubscriptionRegistry::new(Arc::clone(&adapter)),
                registry,
                adapter,
                config,
                hub,
                context_id: Uuid::new_v4(),
                listener: Mutex::new(None),
                batches: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.inner.registry
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.inner.adapter
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.inner.subscriptions
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn context_id(&self) -> Uuid {
        self.inner.context_id
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// A new, unpersisted entity of `store`.
    pub fn create(&self, store: &str) -> Result<Entity> {
        let ty = self.registry().get(store)?;
        Ok(Entity::new(&ty))
    }

    pub async fn get_by_id(&self, store: &str, id: &str) -> Result<Option<Arc<Entity>>> {
        let ty = self.registry().get(store)?;
        self.resolve(&Reference::new(&ty.collection, &ty.store, id))
            .await
    }

    /// Load the entity `reference` points at, or `None` if it no longer
    /// exists.
    pub async fn resolve(&self, reference: &Reference) -> Result<Option<Arc<Entity>>> {
        if let Some(cached) = self.subscriptions().find_reference(reference) {
            return Ok(Some(cached));
        }
        let ty = self.registry().get(&reference.store)?;
        match self.read(&ty, &reference.id).await? {
            Some(record) => self.materialize(&ty, &record).await.map(Some),
            None => Ok(None),
        }
    }

    /// Commit every new or changed entity with one `set_many` per store.
    /// Returns how many entities were written.
    pub async fn commit_many(
        &self,
        entities: &mut [Entity],
        options: BulkCommitOptions,
    ) -> Result<usize> {
        let mut groups: BTreeMap<String, (Arc<EntityType>, Vec<usize>)> = BTreeMap::new();
        for (i, entity) in entities.iter_mut().enumerate() {
            if let Some(scope) = &options.scope {
                if !entity.entity_type().global {
                    entity.set_scope(scope.clone())?;
                }
            }
            if entity.is_persisted() && entity.changed_fields().is_empty() {
                continue;
            }
            let ty = Arc::clone(entity.entity_type());
            groups
                .entry(ty.store.clone())
                .or_insert_with(|| (ty, Vec::new()))
                .1
                .push(i);
        }

        let mut written = 0;
        for (store, (ty, indices)) in groups {
            let records: Vec<Record> = indices.iter().map(|&i| entities[i].to_record()).collect();
            let reasons: Vec<Option<String>> = indices
                .iter()
                .map(|&i| options.reasons.get(i).cloned().flatten())
                .collect();
            self.adapter()
                .set_many(&ty, records.clone(), &reasons)
                .await?;

            for (&i, record) in indices.iter().zip(records) {
                let method = if entities[i].is_persisted() {
                    Method::Update
                } else {
                    Method::Insert
                };
                entities[i].set_shadow(Some(record.clone()));
                self.dispatch(ChangeMessage::new(store.clone(), method, record), true)
                    .await;
                written += 1;
            }
        }
        Ok(written)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Run a one-shot query, answering from live subscriptions when they
    /// already hold the result.
    pub async fn fetch(&self, descriptor: &QueryDescriptor) -> Result<QueryResult> {
        descriptor.validate()?;
        if let Some(result) = self.subscriptions().find_cached(descriptor) {
            return Ok(result);
        }
        if let (true, [filter]) = (descriptor.is_first(), descriptor.filters()) {
            if filter.operator == Operator::Eq {
                if let Some(found) =
                    self.subscriptions()
                        .find_entity(descriptor, &filter.field, &filter.value)
                {
                    return Ok(QueryResult::One(Some(found)));
                }
            }
        }
        let entities = self.execute_fresh(descriptor).await?;
        Ok(QueryResult::from_entities(entities, descriptor.is_first()))
    }

    /// Run a query against the adapter without materializing entities.
    pub async fn fetch_raw(&self, descriptor: &QueryDescriptor) -> Result<QueryOutput> {
        descriptor.validate()?;
        self.adapter().execute_query(descriptor).await
    }

    pub async fn subscribe(
        &self,
        descriptor: &QueryDescriptor,
        callback: impl Fn(&QueryUpdate) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        descriptor.validate()?;
        self.subscriptions()
            .subscribe(self, descriptor, Arc::new(callback))
            .await
    }

    pub async fn bind(&self, descriptor: &QueryDescriptor) -> Result<LiveBinding> {
        self.bind_with(descriptor, |_| {}).await
    }

    /// Bind the live result to a watched value and also call `callback` on
    /// every change.
    pub async fn bind_with(
        &self,
        descriptor: &QueryDescriptor,
        callback: impl Fn(&QueryUpdate) + Send + Sync + 'static,
    ) -> Result<LiveBinding> {
        let (sender, mut receiver) = watch::channel(QueryResult::empty(descriptor.is_first()));
        let handle = self
            .subscribe(descriptor, move |update| {
                sender.send_replace(update.result.clone());
                callback(update);
            })
            .await?;
        receiver.mark_unchanged();
        Ok(LiveBinding::new(receiver, handle))
    }

    /// Change history of an audited store, optionally for one entity.
    /// Unaudited stores have no history.
    pub async fn audit_trail(&self, store: &str, id: Option<&str>) -> Result<Vec<ChangeEntry>> {
        let ty = self.registry().get(store)?;
        let Some(audit_ty) = self.registry().audit_type(store) else {
            return Ok(Vec::new());
        };
        let mut descriptor = QueryDescriptor::new(&audit_ty);
        if let Some(id) = id {
            descriptor = descriptor.with_filter(Filter::new(ID_FIELD, Operator::Eq, id.into()));
        }
        let rows = self.adapter().execute_query(&descriptor).await?.into_records();
        Ok(history(&ty, rows))
    }

    // ------------------------------------------------------------------
    // Change propagation
    // ------------------------------------------------------------------

    /// Publish a local change to other contexts and apply it here.
    pub(crate) async fn dispatch(&self, message: ChangeMessage, debounce: bool) {
        if let Some(hub) = &self.inner.hub {
            hub.publish(self.inner.context_id, message.clone());
        }
        self.subscriptions().evaluate(self, &message, debounce).await;
    }

    /// Apply a change that originated in another context. Notifications go
    /// through the debounce window.
    pub async fn receive_remote(&self, message: &ChangeMessage) {
        tracing::trace!(
            context = ?self.config().context_name,
            store = %message.store,
            method = message.method.as_str(),
            "applying remote change"
        );
        self.subscriptions().evaluate(self, message, true).await;
    }

    /// Make the records of an in-flight batch visible to materialization
    /// until [`close_batch`](Self::close_batch), so optimistic updates can
    /// resolve relations to entities that are not written yet.
    pub(crate) fn open_batch(&self, token: Uuid, records: HashMap<Reference, Record>) {
        self.inner.batches.lock().insert(token, records);
    }

    pub(crate) fn close_batch(&self, token: Uuid) {
        self.inner.batches.lock().remove(&token);
    }

    fn staged(&self, reference: &Reference) -> Option<Record> {
        self.inner
            .batches
            .lock()
            .values()
            .find_map(|records| records.get(reference).cloned())
    }

    fn staged_in(&self, store: &str) -> Vec<Record> {
        self.inner
            .batches
            .lock()
            .values()
            .flat_map(|records| {
                records
                    .iter()
                    .filter(|(reference, _)| reference.store == store)
                    .map(|(_, record)| record.clone())
            })
            .collect()
    }

    /// Query storage as if the in-flight `staged` records were already
    /// written: stored rows they replace are dropped and the ones matching
    /// `descriptor` are merged in.
    async fn overlay_staged(
        &self,
        descriptor: &QueryDescriptor,
        staged: Vec<Record>,
    ) -> Result<Vec<Record>> {
        let ty = descriptor.entity_type();
        let ids: HashSet<String> = staged
            .iter()
            .filter_map(|record| record.get(ID_FIELD).and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        let mut records: Vec<Record> = self
            .adapter()
            .execute_query(&descriptor.clone().with_first(false))
            .await?
            .into_records()
            .into_iter()
            .filter(|record| {
                record
                    .get(ID_FIELD)
                    .and_then(Value::as_str)
                    .map_or(true, |id| !ids.contains(id))
            })
            .collect();
        records.extend(
            staged
                .into_iter()
                .filter(|record| descriptor.matches(&ty.store, record)),
        );
        let mut records = sort_records(ty, records, descriptor.sort());
        if descriptor.is_first() {
            records.truncate(1);
        }
        Ok(records)
    }

    /// Re-read the stored state of `id` and push it to subscriptions, as an
    /// update when it still exists and as a delete otherwise.
    pub(crate) async fn reconcile(&self, ty: &Arc<EntityType>, id: &str) -> Result<Option<Record>> {
        let canonical = self.read(ty, id).await?;
        let message = match &canonical {
            Some(record) => ChangeMessage::new(ty.store.clone(), Method::Update, record.clone()),
            None => ChangeMessage::deleted(ty.store.clone(), id),
        };
        self.dispatch(message, false).await;
        Ok(canonical)
    }

    // ------------------------------------------------------------------
    // Materialization
    // ------------------------------------------------------------------

    /// Run `descriptor` against storage and materialize every record.
    pub(crate) async fn execute_fresh(
        &self,
        descriptor: &QueryDescriptor,
    ) -> Result<Vec<Arc<Entity>>> {
        let staged = self.staged_in(descriptor.store());
        let records = if staged.is_empty() {
            self.adapter()
                .execute_query(descriptor)
                .await?
                .into_records()
        } else {
            self.overlay_staged(descriptor, staged).await?
        };
        let mut entities = Vec::with_capacity(records.len());
        for record in records {
            entities.push(self.materialize(descriptor.entity_type(), &record).await?);
        }
        Ok(entities)
    }

    /// Turn a stored record into an entity graph. Concurrent calls for the
    /// same entity share one in-flight build.
    pub(crate) async fn materialize(
        &self,
        ty: &Arc<EntityType>,
        state: &Record,
    ) -> Result<Arc<Entity>> {
        let Some(id) = state.get(ID_FIELD).and_then(Value::as_str) else {
            // Surfaces the missing-key error.
            return self.build(Arc::clone(ty), state.clone(), &mut Fetch::default()).await;
        };
        let reference = Reference::new(&ty.collection, &ty.store, id);
        if let Some(existing) = self.subscriptions().find_reference(&reference) {
            return self.adopt(&existing, state).await;
        }

        let key = reference.to_string();
        let cell = self.registry().pending_cell(&key);
        let result = cell
            .get_or_try_init(|| async {
                let mut fetch = Fetch::default();
                self.build(Arc::clone(ty), state.clone(), &mut fetch).await
            })
            .await
            .map(Arc::clone);
        self.registry().clear_pending(&key, &cell);
        result
    }

    /// Build a fresh entity from `state`, resolving its relations.
    fn build<'a>(
        &'a self,
        ty: Arc<EntityType>,
        state: Record,
        fetch: &'a mut Fetch,
    ) -> BoxFuture<'a, Result<Arc<Entity>>> {
        Box::pin(async move {
            let mut entity = Entity::from_record(&ty, &state)?;
            let reference = entity.reference();
            fetch.chain.insert(reference.clone());

            let eager: Vec<String> = ty
                .relation_fields()
                .filter(|def| !def.lazy)
                .map(|def| def.name.clone())
                .collect();
            for name in eager {
                let resolved = match entity.field(&name).cloned() {
                    Some(FieldValue::One(relation)) => self
                        .resolve_relation(relation, fetch)
                        .await
                        .map(FieldValue::One),
                    Some(FieldValue::Many(relations)) => {
                        let mut out = Vec::with_capacity(relations.len());
                        for relation in relations {
                            if let Some(relation) = self.resolve_relation(relation, fetch).await {
                                out.push(relation);
                            }
                        }
                        Some(FieldValue::Many(out))
                    }
                    _ => continue,
                };
                entity.insert_field(&name, resolved);
            }

            fetch.chain.remove(&reference);
            let entity = Arc::new(entity);
            fetch.built.insert(reference, Arc::clone(&entity));
            Ok(entity)
        })
    }

    /// Resolve one relation slot. Dangling or unreadable references are
    /// logged and dropped; references back into the chain being built stay
    /// lazy.
    async fn resolve_relation(&self, relation: Relation, fetch: &mut Fetch) -> Option<Relation> {
        let reference = match relation {
            Relation::Resolved(entity) => return Some(Relation::Resolved(entity)),
            Relation::Lazy(reference) => reference,
        };
        if fetch.chain.contains(&reference) {
            tracing::debug!(reference = %reference, "cycle detected; leaving reference lazy");
            return Some(Relation::Lazy(reference));
        }
        if let Some(built) = fetch.built.get(&reference) {
            return Some(Relation::Resolved(Arc::clone(built)));
        }
        match self.load(&reference, fetch).await {
            Ok(Some(entity)) => Some(Relation::Resolved(entity)),
            Ok(None) => {
                tracing::warn!(reference = %reference, "skipping dangling reference");
                None
            }
            Err(err) => {
                tracing::warn!(
                    reference = %reference,
                    error = %err,
                    "skipping unresolvable reference"
                );
                None
            }
        }
    }

    async fn load(&self, reference: &Reference, fetch: &mut Fetch) -> Result<Option<Arc<Entity>>> {
        let loaded = match self.subscriptions().find_reference(reference) {
            Some(cached) => Some(cached),
            None => self.registry().pending_value(&reference.to_string()),
        };
        if let Some(entity) = loaded {
            fetch.built.insert(reference.clone(), Arc::clone(&entity));
            return Ok(Some(entity));
        }
        let Some(ty) = self.registry().find(&reference.store) else {
            return Ok(None);
        };
        match self.read(&ty, &reference.id).await? {
            Some(record) => self.build(ty, record, fetch).await.map(Some),
            None => Ok(None),
        }
    }

    /// Read the stored record of `id`, by key when the store is addressed
    /// by id and through a query otherwise.
    async fn read(&self, ty: &Arc<EntityType>, id: &str) -> Result<Option<Record>> {
        if let Some(staged) = self.staged(&Reference::new(&ty.collection, &ty.store, id)) {
            return Ok(Some(staged));
        }
        if ty.keyed_by_id() || ty.auto_key {
            return self.adapter().get(ty, &Key::single(id)).await;
        }
        let descriptor = QueryDescriptor::new(ty)
            .with_filter(Filter::new(ID_FIELD, Operator::Eq, id.into()))
            .with_first(true);
        Ok(self
            .adapter()
            .execute_query(&descriptor)
            .await?
            .into_records()
            .into_iter()
            .next())
    }

    /// Apply `state` to an existing instance. Unchanged fields and
    /// still-referenced children are carried over as-is; if nothing
    /// changed the same instance is returned.
    pub(crate) async fn adopt(&self, existing: &Arc<Entity>, state: &Record) -> Result<Arc<Entity>> {
        let ty = Arc::clone(existing.entity_type());
        let mut fetch = Fetch {
            chain: HashSet::from([existing.reference()]),
            ..Fetch::default()
        };
        let mut copy = (**existing).clone();
        let mut changed = false;

        for def in &ty.fields {
            let next = state.get(&def.name).unwrap_or(&Value::Null);
            if field_equal(Some(&existing.field_value(&def.name)), Some(next)) {
                continue;
            }
            changed = true;
            if ty.is_base_field(&def.name) {
                copy.set_base(&def.name, next);
                continue;
            }
            let value = if next.is_null() {
                None
            } else if def.is_relation() {
                self.adopt_relation(existing, def, next, &mut fetch).await
            } else {
                Some(FieldValue::Value(next.clone()))
            };
            copy.insert_field(&def.name, value);
        }

        if !changed {
            return Ok(Arc::clone(existing));
        }
        copy.set_shadow(Some(state.clone()));
        Ok(Arc::new(copy))
    }

    async fn adopt_relation(
        &self,
        existing: &Entity,
        def: &FieldDef,
        value: &Value,
        fetch: &mut Fetch,
    ) -> Option<FieldValue> {
        let current: HashMap<Reference, Relation> = match existing.field(&def.name) {
            Some(FieldValue::One(relation)) => {
                HashMap::from([(relation.reference(), relation.clone())])
            }
            Some(FieldValue::Many(relations)) => relations
                .iter()
                .map(|r| (r.reference(), r.clone()))
                .collect(),
            _ => HashMap::new(),
        };

        let mut out = Vec::new();
        for reference in parse_references(value) {
            let relation = match current.get(&reference) {
                Some(kept) => Some(kept.clone()),
                None if def.lazy => Some(Relation::Lazy(reference)),
                None => self.resolve_relation(Relation::Lazy(reference), fetch).await,
            };
            out.extend(relation);
        }
        if def.is_many() {
            Some(FieldValue::Many(out))
        } else {
            out.into_iter().next().map(FieldValue::One)
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("context", &self.inner.context_id)
            .field("name", &self.inner.config.context_name)
            .field("subscriptions", &self.inner.subscriptions)
            .finish()
    }
}

//! Tests for live subscriptions: incremental evaluation, deduplication,
//! single-result rules, nested updates and retirement.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use block_db::{
    entity::Entity,
    error::Result,
    query::{Query, QueryDescriptor, QueryResult},
    reactive::QueryUpdate,
    schema::{entity_type, EntityType, FieldDef, SchemaRegistry},
    storage::{IndexedStore, QueryOutput, StorageAdapter},
    store::Store,
    types::{ChangeMessage, CommitOptions, DeleteOptions, Key, Method, Record},
};
use parking_lot::Mutex;
use serde_json::json;

// ============================================================================
// Helpers
// ============================================================================

/// Counts queries and subscription lifecycle hooks.
struct Probe {
    inner: IndexedStore,
    queries: AtomicUsize,
    started: AtomicUsize,
    stopped: AtomicUsize,
}

#[async_trait]
impl StorageAdapter for Probe {
    async fn get(&self, entity_type: &EntityType, key: &Key) -> Result<Option<Record>> {
        self.inner.get(entity_type, key).await
    }

    async fn set(&self, entity_type: &EntityType, record: Record, reason: Option<&str>) -> Result<()> {
        self.inner.set(entity_type, record, reason).await
    }

    async fn delete(
        &self,
        entity_type: &EntityType,
        key: &Key,
        reason: Option<&str>,
    ) -> Result<Vec<ChangeMessage>> {
        self.inner.delete(entity_type, key, reason).await
    }

    async fn execute_query(&self, query: &QueryDescriptor) -> Result<QueryOutput> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.execute_query(query).await
    }

    fn on_subscription_start(&self, _query: &QueryDescriptor) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_subscription_stop(&self, _query: &QueryDescriptor) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    store: Store,
    probe: Arc<Probe>,
    items: Arc<EntityType>,
    lists: Arc<EntityType>,
}

fn fixture() -> Fixture {
    let registry = Arc::new(SchemaRegistry::new());
    let items = registry
        .register(
            entity_type("app", "items")
                .field(FieldDef::number("x").indexed())
                .field(FieldDef::string("label"))
                .build()
                .unwrap(),
        )
        .unwrap();
    let lists = registry
        .register(
            entity_type("app", "lists")
                .field(FieldDef::string("name"))
                .field(FieldDef::relations("items", "items"))
                .build()
                .unwrap(),
        )
        .unwrap();
    let probe = Arc::new(Probe {
        inner: IndexedStore::new(Arc::clone(&registry)),
        queries: AtomicUsize::new(0),
        started: AtomicUsize::new(0),
        stopped: AtomicUsize::new(0),
    });
    let store = Store::builder(registry)
        .shared_adapter(Arc::clone(&probe) as Arc<dyn StorageAdapter>)
        .build()
        .unwrap();
    Fixture {
        store,
        probe,
        items,
        lists,
    }
}

type Log = Arc<Mutex<Vec<QueryUpdate>>>;

fn recorder() -> (Log, impl Fn(&QueryUpdate) + Send + Sync + 'static) {
    let log: Log = Arc::default();
    let sink = Arc::clone(&log);
    (log, move |update: &QueryUpdate| sink.lock().push(update.clone()))
}

fn xs(result: &QueryResult) -> Vec<i64> {
    result
        .clone()
        .into_vec()
        .iter()
        .filter_map(|e| e.get("x").and_then(|v| v.as_i64()))
        .collect()
}

async fn item(f: &Fixture, x: i64) -> Entity {
    let mut item = f.store.create("items").unwrap();
    item.set("x", x).unwrap();
    item.commit(&f.store, CommitOptions::default()).await.unwrap();
    item
}

// ============================================================================
// Incremental evaluation
// ============================================================================

#[tokio::test]
async fn entity_leaves_a_result_when_it_stops_matching() {
    let f = fixture();
    let (log, callback) = recorder();
    let _handle = Query::new(&f.items)
        .filter("x")
        .equals(1)
        .subscribe_all(&f.store, callback)
        .await
        .unwrap();

    let mut e = item(&f, 1).await;
    e.set("x", 2).unwrap();
    e.commit(&f.store, CommitOptions::default()).await.unwrap();

    let log = log.lock();
    assert_eq!(log.len(), 3);
    assert!(log[0].method.is_none());
    assert_eq!(xs(&log[0].result), Vec::<i64>::new());
    assert_eq!(log[1].method, Some(Method::Insert));
    assert_eq!(xs(&log[1].result), vec![1]);
    assert_eq!(log[2].method, Some(Method::Delete));
    assert!(log[2].result.is_empty());
    assert_eq!(log[2].entity.as_ref().unwrap().id(), e.id());
}

#[tokio::test]
async fn unrelated_changes_do_not_notify() {
    let f = fixture();
    let (log, callback) = recorder();
    let _handle = Query::new(&f.items)
        .filter("x")
        .greater_than(10)
        .subscribe_all(&f.store, callback)
        .await
        .unwrap();
    item(&f, 1).await;
    let mut list = f.store.create("lists").unwrap();
    list.commit(&f.store, CommitOptions::default()).await.unwrap();
    assert_eq!(log.lock().len(), 1);
}

#[tokio::test]
async fn sorted_results_stay_sorted() {
    let f = fixture();
    let handle = Query::new(&f.items)
        .collection()
        .sort("x")
        .desc()
        .subscribe_all(&f.store, |_| {})
        .await
        .unwrap();
    for x in [2, 7, 4] {
        item(&f, x).await;
    }
    assert_eq!(xs(&handle.current()), vec![7, 4, 2]);
}

#[tokio::test]
async fn live_results_converge_with_fresh_queries() {
    let f = fixture();
    let handle = Query::new(&f.items)
        .filter("x")
        .between(2, 6)
        .sort("x")
        .asc()
        .subscribe_all(&f.store, |_| {})
        .await
        .unwrap();

    let mut a = item(&f, 1).await;
    let mut b = item(&f, 3).await;
    let _c = item(&f, 5).await;
    a.set("x", 4).unwrap();
    a.commit(&f.store, CommitOptions::default()).await.unwrap();
    b.delete(&f.store, DeleteOptions::default()).await.unwrap();

    let live = handle.current().ids();
    let fresh: Vec<String> = f
        .store
        .fetch_raw(handle.descriptor())
        .await
        .unwrap()
        .into_records()
        .iter()
        .filter_map(|r| r["id"].as_str().map(str::to_string))
        .collect();
    assert_eq!(live, fresh);
    assert_eq!(live.len(), 2);
}

// ============================================================================
// Deduplication and retirement
// ============================================================================

#[tokio::test]
async fn equivalent_subscriptions_share_one_query() {
    let f = fixture();
    item(&f, 1).await;
    let q = Query::new(&f.items).filter("x").equals(1).into_descriptor();
    let same = Query::new(&f.items).filter("x").equals(1).into_descriptor();

    let (a, b) = tokio::join!(
        f.store.subscribe(&q, |_| {}),
        f.store.subscribe(&same, |_| {})
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(f.probe.queries.load(Ordering::SeqCst), 1);
    assert_eq!(f.probe.started.load(Ordering::SeqCst), 1);
    assert_eq!(f.store.subscriptions().len(), 1);
    assert_eq!(a.current().len(), 1);
    assert_eq!(b.current().len(), 1);

    // Answered from the live cache.
    let cached = f.store.fetch(&q).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(f.probe.queries.load(Ordering::SeqCst), 1);

    drop(a);
    assert_eq!(f.probe.stopped.load(Ordering::SeqCst), 0);
    assert!(b.is_active());
    b.unsubscribe();
    assert_eq!(f.probe.stopped.load(Ordering::SeqCst), 1);
    assert!(f.store.subscriptions().is_empty());
}

#[tokio::test]
async fn late_subscriber_gets_the_current_result_once() {
    let f = fixture();
    item(&f, 1).await;
    let q = Query::new(&f.items).collection().into_descriptor();
    let (first_log, first) = recorder();
    let _a = f.store.subscribe(&q, first).await.unwrap();
    let (second_log, second) = recorder();
    let _b = f.store.subscribe(&q, second).await.unwrap();

    assert_eq!(first_log.lock().len(), 1);
    assert_eq!(second_log.lock().len(), 1);
    assert_eq!(second_log.lock()[0].result.len(), 1);
}

#[tokio::test]
async fn panicking_callback_does_not_break_the_subscription() {
    let f = fixture();
    let q = Query::new(&f.items).collection().into_descriptor();
    let _bad = f
        .store
        .subscribe(&q, |update| {
            if update.method.is_some() {
                panic!("consumer bug");
            }
        })
        .await
        .unwrap();
    let (log, callback) = recorder();
    let _good = f.store.subscribe(&q, callback).await.unwrap();

    item(&f, 1).await;
    assert_eq!(log.lock().len(), 2);
}

// ============================================================================
// Single-result subscriptions
// ============================================================================

#[tokio::test]
async fn single_result_truncates_and_reruns() {
    let f = fixture();
    let (log, callback) = recorder();
    let handle = Query::new(&f.items)
        .collection()
        .sort("x")
        .asc()
        .subscribe_first(&f.store, callback)
        .await
        .unwrap();
    assert!(handle.current().first().is_none());

    let _five = item(&f, 5).await;
    let mut three = item(&f, 3).await;
    assert_eq!(xs(&log.lock().last().unwrap().result), vec![3]);

    // The sole entry ranks itself out; the next best takes over.
    three.set("x", 10).unwrap();
    three.commit(&f.store, CommitOptions::default()).await.unwrap();
    assert_eq!(xs(&log.lock().last().unwrap().result), vec![5]);

    let before = f.probe.queries.load(Ordering::SeqCst);
    three.delete(&f.store, DeleteOptions::default()).await.unwrap();
    // Deleting an entity outside the result needs no query.
    assert_eq!(f.probe.queries.load(Ordering::SeqCst), before);
    assert_eq!(xs(&handle.current()), vec![5]);
}

// ============================================================================
// Nested updates
// ============================================================================

#[tokio::test]
async fn updates_to_nested_entities_rewrite_the_root() {
    let f = fixture();
    let mut child = f.store.create("items").unwrap();
    child.set("label", "old").unwrap();
    let mut list = f.store.create("lists").unwrap();
    list.push_related("items", Arc::new(child)).unwrap();
    list.commit(&f.store, CommitOptions { cascade: true, ..Default::default() })
        .await
        .unwrap();

    let (log, callback) = recorder();
    let handle = Query::new(&f.lists)
        .collection()
        .subscribe_all(&f.store, callback)
        .await
        .unwrap();
    let before = handle.current().into_vec();
    let child_id = before[0].related_many("items")[0].id().to_string();

    let mut child = (**before[0].related_many("items")[0]).clone();
    child.set("label", "new").unwrap();
    child.commit(&f.store, CommitOptions::default()).await.unwrap();

    let after = handle.current().into_vec();
    assert!(!Arc::ptr_eq(&before[0], &after[0]));
    assert_eq!(after[0].id(), before[0].id());
    let nested = after[0].related_many("items")[0];
    assert_eq!(nested.id(), child_id);
    assert_eq!(nested.get("label"), Some(&json!("new")));

    let last = log.lock().last().cloned().unwrap();
    assert_eq!(last.method, Some(Method::Update));
    assert_eq!(last.entity.unwrap().id(), child_id);
}

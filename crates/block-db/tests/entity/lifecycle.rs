//! Tests for commit, delete, discard and bulk commit against a store.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use block_db::{
    error::{BlockDbError, Result, StorageError},
    query::{Query, QueryDescriptor},
    schema::{entity_type, EntityType, FieldDef, SchemaRegistry},
    storage::{IndexedStore, QueryOutput, StorageAdapter},
    store::Store,
    types::{BulkCommitOptions, ChangeMessage, CommitOptions, DeleteOptions, Key, Method, Record},
};
use parking_lot::Mutex;
use serde_json::json;

// ============================================================================
// Helpers
// ============================================================================

/// Wraps an [`IndexedStore`], counting writes and optionally failing them.
struct Probe {
    inner: IndexedStore,
    writes: AtomicUsize,
    fail: AtomicBool,
}

impl Probe {
    fn new(registry: &Arc<SchemaRegistry>) -> Arc<Self> {
        Arc::new(Self {
            inner: IndexedStore::new(Arc::clone(registry)),
            writes: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::backend("disk full").into());
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for Probe {
    async fn get(&self, entity_type: &EntityType, key: &Key) -> Result<Option<Record>> {
        self.inner.get(entity_type, key).await
    }

    async fn set(&self, entity_type: &EntityType, record: Record, reason: Option<&str>) -> Result<()> {
        self.check()?;
        self.inner.set(entity_type, record, reason).await
    }

    async fn set_many(
        &self,
        entity_type: &EntityType,
        records: Vec<Record>,
        reasons: &[Option<String>],
    ) -> Result<()> {
        self.check()?;
        self.inner.set_many(entity_type, records, reasons).await
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
        self.inner.execute_query(query).await
    }
}

struct Fixture {
    store: Store,
    probe: Arc<Probe>,
    notes: Arc<EntityType>,
}

fn fixture() -> Fixture {
    let registry = Arc::new(SchemaRegistry::new());
    registry
        .register(
            entity_type("app", "folders")
                .audited()
                .field(FieldDef::string("name"))
                .field(FieldDef::relations("notes", "notes"))
                .build()
                .unwrap(),
        )
        .unwrap();
    let notes = registry
        .register(
            entity_type("app", "notes")
                .field(FieldDef::string("title").indexed())
                .field(FieldDef::relation("folder", "folders").cascade())
                .build()
                .unwrap(),
        )
        .unwrap();
    let probe = Probe::new(&registry);
    let store = Store::builder(registry)
        .shared_adapter(Arc::clone(&probe) as Arc<dyn StorageAdapter>)
        .build()
        .unwrap();
    Fixture {
        store,
        probe,
        notes,
    }
}

fn cascade() -> CommitOptions {
    CommitOptions {
        cascade: true,
        ..Default::default()
    }
}

fn titles(result: &[Arc<block_db::entity::Entity>]) -> Vec<String> {
    result
        .iter()
        .filter_map(|e| e.get("title").and_then(|v| v.as_str()).map(str::to_string))
        .collect()
}

// ============================================================================
// Commit
// ============================================================================

#[tokio::test]
async fn commit_persists_and_reloads() {
    let f = fixture();
    let mut note = f.store.create("notes").unwrap();
    note.set("title", "hello").unwrap();
    assert!(!note.is_persisted());

    note.commit(&f.store, CommitOptions::default()).await.unwrap();
    assert!(note.is_persisted());
    assert!(note.changed_fields().is_empty());

    let loaded = f.store.get_by_id("notes", note.id()).await.unwrap().unwrap();
    assert_eq!(loaded.get("title"), Some(&json!("hello")));
    assert_eq!(loaded.scope(), Some(""));
}

#[tokio::test]
async fn committing_unchanged_state_writes_and_notifies_nothing() {
    let f = fixture();
    let mut note = f.store.create("notes").unwrap();
    note.set("title", "a").unwrap();
    note.commit(&f.store, CommitOptions::default()).await.unwrap();
    let after_first = f.probe.writes();

    let calls = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&calls);
    let _handle = Query::new(&f.notes)
        .collection()
        .subscribe_all(&f.store, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    note.commit(&f.store, CommitOptions::default()).await.unwrap();
    note.commit(&f.store, cascade()).await.unwrap();
    assert_eq!(f.probe.writes(), after_first);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    note.set("title", "b").unwrap();
    note.commit(&f.store, CommitOptions::default()).await.unwrap();
    assert_eq!(f.probe.writes(), after_first + 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn scope_option_overrides_the_entity_scope() {
    let f = fixture();
    let mut note = f.store.create("notes").unwrap();
    note.commit(
        &f.store,
        CommitOptions {
            scope: Some("p1".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(note.scope(), Some("p1"));
    let scoped = Query::new(&f.notes)
        .collection()
        .scope("p1")
        .all(&f.store)
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
}

#[tokio::test]
async fn cascade_commit_writes_children_once_per_store() {
    let f = fixture();
    let mut first = f.store.create("notes").unwrap();
    first.set("title", "one").unwrap();
    let mut second = f.store.create("notes").unwrap();
    second.set("title", "two").unwrap();

    let mut folder = f.store.create("folders").unwrap();
    folder.set("name", "inbox").unwrap();
    folder.push_related("notes", Arc::new(first)).unwrap();
    folder.push_related("notes", Arc::new(second)).unwrap();

    folder.commit(&f.store, cascade()).await.unwrap();
    // One set_many for notes, one for folders.
    assert_eq!(f.probe.writes(), 2);
    assert!(folder.related_many("notes").iter().all(|n| n.is_persisted()));

    let loaded = f.store.get_by_id("folders", folder.id()).await.unwrap().unwrap();
    let children: Vec<Arc<_>> = loaded.related_many("notes").into_iter().cloned().collect();
    assert_eq!(titles(&children), vec!["one", "two"]);
}

#[tokio::test]
async fn commit_without_cascade_leaves_children_unwritten() {
    let f = fixture();
    let note = f.store.create("notes").unwrap();
    let mut folder = f.store.create("folders").unwrap();
    folder.push_related("notes", Arc::new(note)).unwrap();
    folder.commit(&f.store, CommitOptions::default()).await.unwrap();

    // The reference is stored but dangles, so it is dropped on load.
    let loaded = f.store.get_by_id("folders", folder.id()).await.unwrap().unwrap();
    assert!(loaded.related_many("notes").is_empty());
    assert_eq!(loaded.references("notes").len(), 0);
}

#[tokio::test]
async fn failed_write_rolls_back_entity_and_subscribers() {
    let f = fixture();
    let mut note = f.store.create("notes").unwrap();
    note.set("title", "stored").unwrap();
    note.commit(&f.store, CommitOptions::default()).await.unwrap();

    let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let _handle = Query::new(&f.notes)
        .collection()
        .subscribe_all(&f.store, move |update| {
            sink.lock().push(titles(&update.result.clone().into_vec()));
        })
        .await
        .unwrap();

    f.probe.fail.store(true, Ordering::SeqCst);
    note.set("title", "edited").unwrap();
    let err = note.commit(&f.store, CommitOptions::default()).await.unwrap_err();
    assert!(matches!(err, BlockDbError::CommitFailed { ref store, .. } if store == "notes"));

    assert_eq!(note.get("title"), Some(&json!("stored")));
    assert!(note.changed_fields().is_empty());
    let history = seen.lock().clone();
    assert_eq!(history.first().unwrap(), &vec!["stored".to_string()]);
    assert!(history.contains(&vec!["edited".to_string()]));
    assert_eq!(history.last().unwrap(), &vec!["stored".to_string()]);
}

#[tokio::test]
async fn failed_insert_leaves_entity_unpersisted() {
    let f = fixture();
    f.probe.fail.store(true, Ordering::SeqCst);
    let mut note = f.store.create("notes").unwrap();
    assert!(note.commit(&f.store, CommitOptions::default()).await.is_err());
    assert!(!note.is_persisted());
    assert!(f.store.get_by_id("notes", note.id()).await.unwrap().is_none());
}

// ============================================================================
// Delete and discard
// ============================================================================

#[tokio::test]
async fn delete_removes_the_entity() {
    let f = fixture();
    let mut note = f.store.create("notes").unwrap();
    note.commit(&f.store, CommitOptions::default()).await.unwrap();
    note.delete(&f.store, DeleteOptions::default()).await.unwrap();
    assert!(!note.is_persisted());
    assert!(f.store.get_by_id("notes", note.id()).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_cascade_follows_relations() {
    let f = fixture();
    let mut folder = f.store.create("folders").unwrap();
    folder.push_related("notes", Arc::new(f.store.create("notes").unwrap())).unwrap();
    folder.push_related("notes", Arc::new(f.store.create("notes").unwrap())).unwrap();
    folder.commit(&f.store, cascade()).await.unwrap();

    folder
        .delete(
            &f.store,
            DeleteOptions {
                cascade: true,
                reason: None,
            },
        )
        .await
        .unwrap();
    let remaining = Query::new(&f.notes).collection().all(&f.store).await.unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn deleting_a_target_fixes_up_referrers_in_live_results() {
    let f = fixture();
    let mut folder = f.store.create("folders").unwrap();
    folder.commit(&f.store, CommitOptions::default()).await.unwrap();
    let folder_ref = Arc::new(folder.clone());
    let mut note = f.store.create("notes").unwrap();
    note.set_related("folder", folder_ref).unwrap();
    note.commit(&f.store, CommitOptions::default()).await.unwrap();

    let handle = Query::new(&f.notes)
        .collection()
        .subscribe_all(&f.store, |_| {})
        .await
        .unwrap();
    assert_eq!(handle.current().len(), 1);

    folder.delete(&f.store, DeleteOptions::default()).await.unwrap();
    assert!(handle.current().is_empty());
    assert!(f.store.get_by_id("notes", note.id()).await.unwrap().is_none());
}

#[tokio::test]
async fn discard_restores_the_stored_state() {
    let f = fixture();
    let mut note = f.store.create("notes").unwrap();
    note.set("title", "kept").unwrap();
    note.commit(&f.store, CommitOptions::default()).await.unwrap();
    note.set("title", "scratch").unwrap();

    assert!(note.discard(&f.store).await.unwrap());
    assert_eq!(note.get("title"), Some(&json!("kept")));

    let mut fresh = f.store.create("notes").unwrap();
    assert!(!fresh.discard(&f.store).await.unwrap());
}

// ============================================================================
// Bulk commit and audit
// ============================================================================

#[tokio::test]
async fn commit_many_writes_only_changed_entities() {
    let f = fixture();
    let mut batch: Vec<_> = (0..3)
        .map(|i| {
            let mut note = f.store.create("notes").unwrap();
            note.set("title", format!("n{i}")).unwrap();
            note
        })
        .collect();
    let written = f
        .store
        .commit_many(&mut batch, BulkCommitOptions::default())
        .await
        .unwrap();
    assert_eq!(written, 3);
    assert_eq!(f.probe.writes(), 1);
    assert!(batch.iter().all(|n| n.is_persisted()));

    batch[1].set("title", "changed").unwrap();
    let written = f
        .store
        .commit_many(&mut batch, BulkCommitOptions::default())
        .await
        .unwrap();
    assert_eq!(written, 1);
}

#[tokio::test]
async fn audit_trail_lists_changes_with_reasons() {
    let f = fixture();
    let mut folder = f.store.create("folders").unwrap();
    folder.set("name", "a").unwrap();
    folder
        .commit(
            &f.store,
            CommitOptions {
                reason: Some("created".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    folder.set("name", "b").unwrap();
    folder.commit(&f.store, CommitOptions::default()).await.unwrap();

    let trail = f.store.audit_trail("folders", Some(folder.id())).await.unwrap();
    let methods: Vec<Method> = trail.iter().map(|e| e.method).collect();
    assert_eq!(methods, vec![Method::Insert, Method::Update]);
    assert_eq!(trail[0].reason.as_deref(), Some("created"));
    assert_eq!(trail[1].changes.get("name"), Some(&json!("a")));

    assert!(f.store.audit_trail("notes", None).await.unwrap().is_empty());
}

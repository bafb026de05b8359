//! Tests for delete-time reference fix-up.

use std::sync::Arc;

use block_db::{
    schema::{entity_type, EntityType, FieldDef, SchemaRegistry},
    storage::{IndexedStore, StorageAdapter},
    types::{Key, Method, Record},
};
use serde_json::{json, Value};

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    folders: Arc<EntityType>,
    notes: Arc<EntityType>,
    comments: Arc<EntityType>,
    store: IndexedStore,
}

/// folders <- notes.folder (cascade) <- comments.note (cascade)
/// folders <- notes.links (unset, many)
fn fixture() -> Fixture {
    let registry = Arc::new(SchemaRegistry::new());
    let folders = registry
        .register(
            entity_type("app", "folders")
                .field(FieldDef::string("name"))
                .build()
                .unwrap(),
        )
        .unwrap();
    let notes = registry
        .register(
            entity_type("app", "notes")
                .field(FieldDef::relation("folder", "folders").cascade())
                .field(FieldDef::relations("links", "folders"))
                .build()
                .unwrap(),
        )
        .unwrap();
    let comments = registry
        .register(
            entity_type("app", "comments")
                .field(FieldDef::relation("note", "notes").cascade())
                .build()
                .unwrap(),
        )
        .unwrap();
    let store = IndexedStore::new(Arc::clone(&registry));
    Fixture {
        folders,
        notes,
        comments,
        store,
    }
}

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

async fn put(store: &IndexedStore, ty: &EntityType, value: Value) {
    store.set(ty, record(value), None).await.unwrap();
}

// ============================================================================
// Fix-up
// ============================================================================

#[tokio::test]
async fn cascade_deletes_referencing_entities_transitively() {
    let f = fixture();
    put(&f.store, &f.folders, json!({"id": "f1", "name": "inbox"})).await;
    put(&f.store, &f.notes, json!({"id": "n1", "folder": "app:folders:f1"})).await;
    put(&f.store, &f.notes, json!({"id": "n2", "folder": "app:folders:f2"})).await;
    put(&f.store, &f.comments, json!({"id": "c1", "note": "app:notes:n1"})).await;

    let changes = f
        .store
        .delete(&f.folders, &Key::single("f1"), None)
        .await
        .unwrap();

    let deleted: Vec<(&str, Option<&str>)> = changes
        .iter()
        .filter(|m| m.method == Method::Delete)
        .map(|m| (m.store.as_str(), m.id()))
        .collect();
    assert_eq!(deleted, vec![("notes", Some("n1")), ("comments", Some("c1"))]);
    assert_eq!(f.store.count(&f.notes), 1);
    assert_eq!(f.store.count(&f.comments), 0);
}

#[tokio::test]
async fn unset_removes_the_reference_and_keeps_the_entity() {
    let f = fixture();
    put(&f.store, &f.folders, json!({"id": "f1"})).await;
    put(
        &f.store,
        &f.notes,
        json!({"id": "n1", "links": ["app:folders:f1", "app:folders:f9"]}),
    )
    .await;

    let changes = f
        .store
        .delete(&f.folders, &Key::single("f1"), None)
        .await
        .unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].method, Method::Update);
    assert_eq!(changes[0].state["links"], json!(["app:folders:f9"]));

    let stored = f.store.get(&f.notes, &Key::single("n1")).await.unwrap().unwrap();
    assert_eq!(stored["links"], json!(["app:folders:f9"]));
}

#[tokio::test]
async fn reference_cycles_terminate() {
    let registry = Arc::new(SchemaRegistry::new());
    let nodes = registry
        .register(
            entity_type("app", "nodes")
                .field(FieldDef::relation("next", "nodes").cascade())
                .build()
                .unwrap(),
        )
        .unwrap();
    let store = IndexedStore::new(Arc::clone(&registry));
    put(&store, &nodes, json!({"id": "a", "next": "app:nodes:b"})).await;
    put(&store, &nodes, json!({"id": "b", "next": "app:nodes:a"})).await;

    let changes = store.delete(&nodes, &Key::single("a"), None).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].id(), Some("b"));
    assert_eq!(store.count(&nodes), 0);
}

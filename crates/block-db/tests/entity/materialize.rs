//! Tests for turning stored records into entity graphs.

use std::sync::Arc;

use block_db::{
    entity::{FieldValue, Reference, Relation},
    query::Query,
    schema::{entity_type, EntityType, FieldDef, SchemaRegistry},
    store::Store,
    types::{DuplicateOptions, Record},
};
use serde_json::{json, Value};

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    store: Store,
    nodes: Arc<EntityType>,
    tags: Arc<EntityType>,
}

fn fixture() -> Fixture {
    let registry = Arc::new(SchemaRegistry::new());
    let tags = registry
        .register(
            entity_type("app", "tags")
                .field(FieldDef::string("label"))
                .build()
                .unwrap(),
        )
        .unwrap();
    let nodes = registry
        .register(
            entity_type("app", "nodes")
                .field(FieldDef::string("name"))
                .field(FieldDef::relation("next", "nodes"))
                .field(FieldDef::relations("tags", "tags"))
                .field(FieldDef::relation("owner", "tags").lazy())
                .build()
                .unwrap(),
        )
        .unwrap();
    Fixture {
        store: Store::in_memory(registry),
        nodes,
        tags,
    }
}

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

async fn put(f: &Fixture, ty: &EntityType, value: Value) {
    f.store.adapter().set(ty, record(value), None).await.unwrap();
}

// ============================================================================
// Relations
// ============================================================================

#[tokio::test]
async fn eager_relations_resolve_and_lazy_ones_do_not() {
    let f = fixture();
    put(&f, &f.tags, json!({"id": "t1", "label": "red"})).await;
    put(
        &f,
        &f.nodes,
        json!({"id": "n1", "tags": ["app:tags:t1"], "owner": "app:tags:t1"}),
    )
    .await;

    let node = f.store.get_by_id("nodes", "n1").await.unwrap().unwrap();
    let tags = node.related_many("tags");
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].get("label"), Some(&json!("red")));

    match node.field("owner") {
        Some(FieldValue::One(Relation::Lazy(reference))) => {
            assert_eq!(reference, &Reference::new("app", "tags", "t1"));
        }
        other => panic!("expected a lazy reference, got {other:?}"),
    }
    assert!(node.related("owner").is_none());

    let owner = f
        .store
        .resolve(&node.references("owner")[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(owner.id(), "t1");
}

#[tokio::test]
async fn dangling_and_malformed_references_are_skipped() {
    let f = fixture();
    put(&f, &f.tags, json!({"id": "t1"})).await;
    put(
        &f,
        &f.nodes,
        json!({"id": "n1", "next": "app:nodes:gone", "tags": ["app:tags:gone", "nonsense", "app:tags:t1"]}),
    )
    .await;

    let node = f.store.get_by_id("nodes", "n1").await.unwrap().unwrap();
    assert!(node.field("next").is_none());
    let ids: Vec<&str> = node.related_many("tags").iter().map(|t| t.id()).collect();
    assert_eq!(ids, vec!["t1"]);
}

#[tokio::test]
async fn reference_cycles_stop_at_the_chain() {
    let f = fixture();
    put(&f, &f.nodes, json!({"id": "a", "next": "app:nodes:b"})).await;
    put(&f, &f.nodes, json!({"id": "b", "next": "app:nodes:a"})).await;

    let a = f.store.get_by_id("nodes", "a").await.unwrap().unwrap();
    let b = a.related("next").unwrap();
    assert_eq!(b.id(), "b");
    match b.field("next") {
        Some(FieldValue::One(Relation::Lazy(reference))) => assert_eq!(reference.id, "a"),
        other => panic!("expected the back edge to stay lazy, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_entity_resolves_to_none() {
    let f = fixture();
    assert!(f.store.get_by_id("nodes", "nope").await.unwrap().is_none());
    assert!(f.store.get_by_id("unknown", "x").await.is_err());
}

// ============================================================================
// Sharing
// ============================================================================

#[tokio::test]
async fn one_fetch_builds_each_entity_once() {
    let f = fixture();
    put(&f, &f.tags, json!({"id": "t1", "label": "red"})).await;
    put(&f, &f.nodes, json!({"id": "n2", "tags": ["app:tags:t1"]})).await;
    put(
        &f,
        &f.nodes,
        json!({"id": "n1", "next": "app:nodes:n2", "tags": ["app:tags:t1", "app:tags:t1"]}),
    )
    .await;

    let n1 = f.store.get_by_id("nodes", "n1").await.unwrap().unwrap();
    let tags = n1.related_many("tags");
    assert_eq!(tags.len(), 2);
    assert!(Arc::ptr_eq(tags[0], tags[1]));

    let n2 = n1.related("next").unwrap();
    let nested = n2.related_many("tags");
    assert!(Arc::ptr_eq(tags[0], nested[0]));
}

#[tokio::test]
async fn instances_held_by_live_results_are_reused() {
    let f = fixture();
    put(&f, &f.tags, json!({"id": "t1", "label": "red"})).await;
    put(&f, &f.nodes, json!({"id": "n1", "tags": ["app:tags:t1"]})).await;
    put(&f, &f.nodes, json!({"id": "n2", "tags": ["app:tags:t1"]})).await;

    let handle = Query::new(&f.nodes)
        .collection()
        .subscribe_all(&f.store, |_| {})
        .await
        .unwrap();
    let live = handle.current().into_vec();
    assert_eq!(live.len(), 2);

    let fetched = f.store.get_by_id("nodes", "n1").await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&fetched, &live[0]));

    let tag = f.store.get_by_id("tags", "t1").await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&tag, live[0].related_many("tags")[0]));
}

#[tokio::test]
async fn compound_keyed_entities_resolve_by_id() {
    let registry = Arc::new(SchemaRegistry::new());
    let cells = registry
        .register(
            entity_type("app", "cells")
                .compound()
                .field(FieldDef::number("row").group("pos"))
                .field(FieldDef::number("col").group("pos"))
                .field(FieldDef::string("text"))
                .build()
                .unwrap(),
        )
        .unwrap();
    let store = Store::in_memory(registry);
    store
        .adapter()
        .set(
            &cells,
            record(json!({"id": "c1", "scope": "s", "row": 1, "col": 2, "text": "x"})),
            None,
        )
        .await
        .unwrap();

    let cell = store.get_by_id("cells", "c1").await.unwrap().unwrap();
    assert_eq!(cell.get("text"), Some(&json!("x")));
    let by_position = Query::new(&cells)
        .filter("row")
        .equals(1)
        .and("col")
        .equals(2)
        .scope("s")
        .first(&store)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_position.id(), "c1");
}

#[tokio::test]
async fn duplicate_gets_a_fresh_identity() {
    let f = fixture();
    put(&f, &f.tags, json!({"id": "t1"})).await;
    put(&f, &f.nodes, json!({"id": "n1", "name": "x", "tags": ["app:tags:t1"]})).await;
    let node = f.store.get_by_id("nodes", "n1").await.unwrap().unwrap();

    let shallow = node.duplicate(DuplicateOptions::default());
    assert_ne!(shallow.id(), node.id());
    assert!(!shallow.is_persisted());
    assert_eq!(shallow.get("name"), Some(&json!("x")));
    assert!(Arc::ptr_eq(shallow.related_many("tags")[0], node.related_many("tags")[0]));

    let deep = node.duplicate(DuplicateOptions { cascade: true });
    assert_ne!(deep.related_many("tags")[0].id(), "t1");
}

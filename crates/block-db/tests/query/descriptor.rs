//! Tests for the I/O-free predicate evaluator and result ordering.

use std::sync::Arc;

use block_db::{
    query::{compare_values, sort_records, Query, QueryDescriptor, SortClause, SortDirection},
    schema::{entity_type, EntityType, FieldDef},
    types::Record,
};
use serde_json::{json, Value};

fn items() -> Arc<EntityType> {
    Arc::new(
        entity_type("app", "items")
            .field(FieldDef::number("x").indexed())
            .field(FieldDef::string("group"))
            .field(FieldDef::string("tags"))
            .build()
            .unwrap(),
    )
}

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

fn matches(d: &QueryDescriptor, value: Value) -> bool {
    d.matches("items", &record(value))
}

// ============================================================================
// Predicate evaluation
// ============================================================================

#[test]
fn equality_and_inequality() {
    let ty = items();
    let eq = Query::new(&ty).filter("x").equals(1).into_descriptor();
    assert!(matches(&eq, json!({"x": 1})));
    assert!(matches(&eq, json!({"x": 1.0})));
    assert!(!matches(&eq, json!({"x": 2})));
    assert!(!matches(&eq, json!({})));

    let ne = Query::new(&ty).filter("x").not_equals(1).into_descriptor();
    assert!(matches(&ne, json!({"x": 2})));
    assert!(matches(&ne, json!({})));
    assert!(!matches(&ne, json!({"x": 1})));
}

#[test]
fn null_equality_matches_absent_fields() {
    let ty = items();
    let d = Query::new(&ty).filter("x").equals(Value::Null).into_descriptor();
    assert!(matches(&d, json!({})));
    assert!(matches(&d, json!({"x": null})));
    assert!(!matches(&d, json!({"x": 0})));
}

#[test]
fn array_fields_follow_multi_entry_semantics() {
    let ty = items();
    let eq = Query::new(&ty).filter("tags").equals("a").into_descriptor();
    assert!(matches(&eq, json!({"tags": ["b", "a"]})));

    let any = Query::new(&ty).filter("tags").contains("a").into_descriptor();
    assert!(matches(&any, json!({"tags": ["a"]})));
    assert!(matches(&any, json!({"tags": "a"})));
    assert!(!matches(&any, json!({"tags": ["b"]})));

    let ne = Query::new(&ty).filter("tags").not_equals("a").into_descriptor();
    assert!(!matches(&ne, json!({"tags": ["b", "a"]})));
    assert!(matches(&ne, json!({"tags": ["b"]})));

    let range = Query::new(&ty).filter("x").greater_than(5).into_descriptor();
    assert!(matches(&range, json!({"x": [1, 7]})));
}

#[test]
fn in_and_between() {
    let ty = items();
    let one_of = Query::new(&ty).filter("x").one_of([1, 3]).into_descriptor();
    assert!(matches(&one_of, json!({"x": 3})));
    assert!(!matches(&one_of, json!({"x": 2})));

    let between = Query::new(&ty).filter("x").between(1, 3).into_descriptor();
    assert!(matches(&between, json!({"x": 1})));
    assert!(matches(&between, json!({"x": 3})));
    assert!(!matches(&between, json!({"x": 4})));
    assert!(!matches(&between, json!({})));
}

#[test]
fn filters_conjoin_and_scope_and_store_are_checked() {
    let ty = items();
    let d = Query::new(&ty)
        .filter("x")
        .greater_than(1)
        .and("group")
        .equals("g")
        .scope("p1")
        .into_descriptor();
    assert!(matches(&d, json!({"x": 2, "group": "g", "scope": "p1"})));
    assert!(!matches(&d, json!({"x": 2, "group": "g", "scope": "p2"})));
    assert!(!matches(&d, json!({"x": 2, "group": "h", "scope": "p1"})));
    assert!(!d.matches("other", &record(json!({"x": 2, "group": "g", "scope": "p1"}))));
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn values_order_numbers_then_strings_then_booleans_then_null() {
    let mut values = vec![json!(null), json!(true), json!("a"), json!(2), json!(1)];
    values.sort_by(compare_values);
    assert_eq!(values, vec![json!(1), json!(2), json!("a"), json!(true), json!(null)]);
}

#[test]
fn multi_clause_sort_equals_a_single_comparator_in_declared_order() {
    let ty = items();
    let rows: Vec<Record> = [
        ("a", "g2", 1),
        ("b", "g1", 2),
        ("c", "g2", 0),
        ("d", "g1", 2),
        ("e", "g1", 1),
    ]
    .into_iter()
    .map(|(id, group, x)| record(json!({"id": id, "group": group, "x": x})))
    .collect();

    let clauses = vec![
        SortClause {
            field: "group".into(),
            direction: SortDirection::Asc,
        },
        SortClause {
            field: "x".into(),
            direction: SortDirection::Desc,
        },
    ];
    let sorted = sort_records(&ty, rows.clone(), &clauses);

    let mut expected = rows;
    expected.sort_by(|a, b| {
        compare_values(&a["group"], &b["group"])
            .then_with(|| compare_values(&b["x"], &a["x"]))
            .then_with(|| compare_values(&a["id"], &b["id"]))
    });
    let ids = |rows: &[Record]| -> Vec<Value> { rows.iter().map(|r| r["id"].clone()).collect() };
    assert_eq!(ids(&sorted), ids(&expected));
    assert_eq!(ids(&sorted), vec![json!("b"), json!("d"), json!("e"), json!("a"), json!("c")]);
}

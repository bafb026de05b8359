//! Tests for SchemaRegistry registration, reverse references and audit types.

use block_db::{
    error::SchemaError,
    schema::{entity_type, DeletePolicy, FieldDef, SchemaRegistry, CREATED_FIELD, ID_FIELD, SCOPE_FIELD},
};

fn folders() -> block_db::schema::EntityType {
    entity_type("app", "folders")
        .field(FieldDef::string("name").indexed())
        .build()
        .unwrap()
}

// ============================================================================
// Registration
// ============================================================================

#[test]
fn duplicate_store_name_is_rejected() {
    let registry = SchemaRegistry::new();
    registry.register(folders()).unwrap();
    let err = registry.register(folders()).unwrap_err();
    assert!(matches!(err, SchemaError::DuplicateStore(name) if name == "folders"));
}

#[test]
fn same_store_name_in_another_collection_is_still_a_duplicate() {
    let registry = SchemaRegistry::new();
    registry.register(folders()).unwrap();
    let other = entity_type("other", "folders").build().unwrap();
    assert!(registry.register(other).is_err());
}

#[test]
fn audit_collection_name_is_reserved() {
    let registry = SchemaRegistry::new();
    let ty = entity_type("audit", "things").build().unwrap();
    assert!(matches!(
        registry.register(ty),
        Err(SchemaError::InvalidName { kind: "collection", .. })
    ));
}

#[test]
fn unknown_store_lookup_fails() {
    let registry = SchemaRegistry::new();
    assert!(registry.find("nope").is_none());
    assert!(matches!(registry.get("nope"), Err(SchemaError::UnknownStore(_))));
}

#[test]
fn base_fields_come_first() {
    let ty = folders();
    let names: Vec<&str> = ty.field_names().collect();
    assert_eq!(&names[..4], &[ID_FIELD, SCOPE_FIELD, CREATED_FIELD, "name"]);
    assert_eq!(ty.key_path, vec![ID_FIELD.to_string()]);
    assert!(ty.keyed_by_id());

    let global = entity_type("app", "settings").global().build().unwrap();
    assert!(global.field(SCOPE_FIELD).is_none());
}

#[test]
fn compound_key_is_scope_plus_grouped_fields() {
    let ty = entity_type("app", "cells")
        .compound()
        .field(FieldDef::number("row").group("pos"))
        .field(FieldDef::number("col").group("pos"))
        .build()
        .unwrap();
    assert_eq!(ty.key_path, vec!["scope", "row", "col"]);
    assert_eq!(ty.groups, vec![("pos".to_string(), vec!["row".to_string(), "col".to_string()])]);

    let err = entity_type("app", "empty").compound().build().unwrap_err();
    assert!(matches!(err, SchemaError::EmptyKeyPath(_)));
}

#[test]
fn invalid_names_are_rejected() {
    assert!(entity_type("app", "bad name").build().is_err());
    assert!(entity_type("app", "ok")
        .field(FieldDef::string("id"))
        .build()
        .is_err());
}

// ============================================================================
// Reverse references
// ============================================================================

#[test]
fn referrers_index_every_relation_field() {
    let registry = SchemaRegistry::new();
    registry.register(folders()).unwrap();
    registry
        .register(
            entity_type("app", "notes")
                .field(FieldDef::relation("folder", "folders").cascade())
                .field(FieldDef::relations("links", "folders"))
                .build()
                .unwrap(),
        )
        .unwrap();

    let mut referrers = registry.referrers("folders");
    referrers.sort_by(|a, b| a.field.cmp(&b.field));
    assert_eq!(referrers.len(), 2);
    assert_eq!(referrers[0].field, "folder");
    assert_eq!(referrers[0].policy, DeletePolicy::Cascade);
    assert_eq!(referrers[1].field, "links");
    assert_eq!(referrers[1].policy, DeletePolicy::Unset);
    assert_eq!(referrers[0].entity_type.store, "notes");

    assert!(registry.referrers("notes").is_empty());
}

// ============================================================================
// Audit types and versions
// ============================================================================

#[test]
fn audited_types_get_a_companion_audit_type() {
    let registry = SchemaRegistry::new();
    registry
        .register(
            entity_type("app", "users")
                .audited()
                .field(FieldDef::string("email").unique())
                .build()
                .unwrap(),
        )
        .unwrap();
    registry.register(folders()).unwrap();

    let audit = registry.audit_type("users").unwrap();
    assert_eq!(audit.collection, "audit");
    assert!(audit.auto_key && audit.snapshot);
    let email = audit.field("email").unwrap();
    assert!(!email.unique && email.index);
    assert!(registry.audit_type("folders").is_none());
    assert_eq!(registry.collection_types("audit").len(), 1);
}

#[test]
fn collection_version_sums_type_versions() {
    let registry = SchemaRegistry::new();
    registry.register(folders()).unwrap();
    assert_eq!(registry.collection_version("app"), 1);
    registry
        .register(entity_type("app", "tags").version(3).build().unwrap())
        .unwrap();
    assert_eq!(registry.collection_version("app"), 4);
    assert_eq!(registry.collection_version("none"), 0);
}

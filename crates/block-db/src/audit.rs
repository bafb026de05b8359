//! Audit trail: the derived append-only companion of an audited type, and the
//! per-entity change history computed from its rows.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::diff::differences;
use crate::schema::{EntityType, FieldDef};
use crate::types::{Key, Method, Record};

pub const AUDIT_COLLECTION: &str = "audit";
pub const METHOD_FIELD: &str = "method";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const REASON_FIELD: &str = "reason";

/// Derive the audit type of `ty`: the same fields with keys and unique
/// constraints downgraded to plain indexes, plus `method`, `timestamp` and
/// `reason`. Rows get generated keys and are never overwritten.
pub fn derive_audit_type(ty: &EntityType) -> EntityType {
    let mut fields = vec![
        FieldDef::string(METHOD_FIELD).indexed(),
        FieldDef::date(TIMESTAMP_FIELD).indexed(),
        FieldDef::string(REASON_FIELD),
    ];
    fields.extend(ty.fields.iter().map(|field| {
        let mut field = field.clone();
        if field.key || field.unique {
            field.index = true;
        }
        field.key = false;
        field.unique = false;
        field
    }));

    EntityType {
        collection: AUDIT_COLLECTION.to_string(),
        store: ty.store.clone(),
        auto_key: true,
        audited: false,
        global: ty.global,
        compound: false,
        snapshot: true,
        version: 1,
        fields,
        key_path: Vec::new(),
        groups: ty.groups.clone(),
    }
}

/// Build the row appended for one mutation of `state`.
pub fn audit_row(method: Method, state: &Record, reason: Option<&str>) -> Record {
    let mut row = state.clone();
    row.insert(METHOD_FIELD.to_string(), Value::from(method.as_str()));
    row.insert(
        TIMESTAMP_FIELD.to_string(),
        Value::from(chrono::Utc::now().timestamp_millis()),
    );
    row.insert(
        REASON_FIELD.to_string(),
        reason.map(Value::from).unwrap_or(Value::Null),
    );
    row
}

/// One historical mutation of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    /// Primary key of the audited entity.
    pub key: Key,
    pub method: Method,
    pub timestamp: i64,
    pub reason: Option<String>,
    /// Previous values of the fields this mutation changed.
    pub changes: Record,
    /// Entity state after the mutation (last state for deletes).
    pub state: Record,
}

/// Group audit rows of `ty` by primary key and diff successive states.
///
/// Rows are taken in the order given within equal timestamps. The result is
/// chronological across all entities.
pub fn history(ty: &EntityType, rows: Vec<Record>) -> Vec<ChangeEntry> {
    let mut indexed: Vec<(usize, Record)> = rows.into_iter().enumerate().collect();
    indexed.sort_by_key(|(i, row)| (timestamp_of(row), *i));

    let mut previous: BTreeMap<Key, Record> = BTreeMap::new();
    let mut out = Vec::new();
    for (_, row) in indexed {
        let Some(method) = row
            .get(METHOD_FIELD)
            .cloned()
            .and_then(|v| serde_json::from_value::<Method>(v).ok())
        else {
            continue;
        };
        let state = strip_audit_fields(&row);
        let key = if ty.auto_key {
            Key::single(
                state
                    .get(crate::schema::ID_FIELD)
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            )
        } else {
            match ty.derive_key(&state) {
                Ok(key) => key,
                Err(_) => continue,
            }
        };

        let empty = Record::new();
        let before = previous.get(&key).unwrap_or(&empty);
        let changes = match method {
            Method::Delete => Record::new(),
            _ => differences(before, &state, ty.field_names()),
        };

        out.push(ChangeEntry {
            key: key.clone(),
            method,
            timestamp: timestamp_of(&row),
            reason: row
                .get(REASON_FIELD)
                .and_then(Value::as_str)
                .map(str::to_string),
            changes,
            state: state.clone(),
        });

        if method == Method::Delete {
            previous.remove(&key);
        } else {
            previous.insert(key, state);
        }
    }
    out
}

fn timestamp_of(row: &Record) -> i64 {
    row.get(TIMESTAMP_FIELD)
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .unwrap_or_default()
}

fn strip_audit_fields(row: &Record) -> Record {
    row.iter()
        .filter(|(k, _)| !matches!(k.as_str(), METHOD_FIELD | TIMESTAMP_FIELD | REASON_FIELD))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

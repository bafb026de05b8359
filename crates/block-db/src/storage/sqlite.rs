//! SQLite storage adapter.
//!
//! One table per object store (`"<collection>__<store>"`) holding JSON
//! records keyed by the encoded primary key. Queries scan the table and apply
//! the same predicate and ordering as the in-memory store. The connection is
//! protected by a `parking_lot::ReentrantMutex<RefCell<Connection>>` so that
//! `transaction()` can hold the lock while the closure issues its own SQL.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::adapter::{QueryOutput, StorageAdapter};
use super::references::{fix_up_references, ReferenceAccess};
use crate::audit::audit_row;
use crate::error::{BlockDbError, Result, StorageError};
use crate::query::{sort_records, QueryDescriptor};
use crate::schema::{EntityType, SchemaRegistry, ID_FIELD};
use crate::types::{ChangeMessage, IndexableValue, Key, Method, Record};

// ============================================================================
// Value helpers
// ============================================================================

/// Convert a scalar JSON value to a `rusqlite::types::Value` for query params.
fn json_value_to_sql(v: &IndexableValue) -> rusqlite::types::Value {
    match v {
        IndexableValue::Null => rusqlite::types::Value::Null,
        IndexableValue::String(s) => rusqlite::types::Value::Text(s.clone()),
        IndexableValue::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => {
            rusqlite::types::Value::Integer(*n as i64)
        }
        IndexableValue::Number(n) => rusqlite::types::Value::Real(*n),
        IndexableValue::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
    }
}

fn storage_err(e: rusqlite::Error) -> BlockDbError {
    BlockDbError::Storage(StorageError::Sqlite(e))
}

fn table_name(ty: &EntityType) -> String {
    format!("\"{}__{}\"", ty.collection, ty.store)
}

fn encode_key(key: &Key) -> String {
    key.to_value().to_string()
}

/// The stored key of `record`; `None` for append-only rows.
fn record_key(ty: &EntityType, record: &Record) -> Result<Option<String>> {
    if ty.auto_key && ty.snapshot {
        return Ok(None);
    }
    let key = if ty.auto_key {
        Key::single(
            record
                .get(ID_FIELD)
                .and_then(Value::as_str)
                .unwrap_or_default(),
        )
    } else {
        ty.derive_key(record)?
    };
    Ok(Some(encode_key(&key)))
}

fn parse_record(ty: &EntityType, text: &str) -> Result<Record> {
    serde_json::from_str(text).map_err(|source| {
        StorageError::Corruption {
            store: ty.store.clone(),
            source,
        }
        .into()
    })
}

fn scalars(value: Option<&Value>) -> Vec<IndexableValue> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(IndexableValue::from_value).collect(),
        Some(value) => IndexableValue::from_value(value).into_iter().collect(),
        None => Vec::new(),
    }
}

// ============================================================================
// SqliteStore
// ============================================================================

/// Durable [`StorageAdapter`] backed by SQLite.
pub struct SqliteStore {
    conn: ReentrantMutex<RefCell<rusqlite::Connection>>,
    registry: Arc<SchemaRegistry>,
    /// collection → schema version the tables were last migrated to
    migrated: Mutex<HashMap<String, u32>>,
}

impl SqliteStore {
    /// Open a file-backed SQLite database.
    pub fn open(path: &str, registry: Arc<SchemaRegistry>) -> Result<Self> {
        let conn = rusqlite::Connection::open(path).map_err(storage_err)?;
        Self::with_connection(conn, registry)
    }

    /// Open an in-memory SQLite database (useful for tests).
    pub fn open_in_memory(registry: Arc<SchemaRegistry>) -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(storage_err)?;
        Self::with_connection(conn, registry)
    }

    fn with_connection(conn: rusqlite::Connection, registry: Arc<SchemaRegistry>) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS meta (
                 collection TEXT PRIMARY KEY,
                 version    INTEGER NOT NULL
             );",
        )
        .map_err(storage_err)?;
        Ok(Self {
            conn: ReentrantMutex::new(RefCell::new(conn)),
            registry,
            migrated: Mutex::new(HashMap::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Execute `f` with a shared reference to the underlying connection.
    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T>,
    {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        f(&conn)
    }

    /// Run `f` inside a savepoint, rolling back when it fails.
    fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        thread_local! {
            static SP_COUNTER: Cell<u64> = const { Cell::new(0) };
        }
        let sp_name = SP_COUNTER.with(|c| {
            let n = c.get();
            c.set(n + 1);
            format!("sp_{n}")
        });

        let guard = self.conn.lock();
        guard
            .borrow()
            .execute(&format!("SAVEPOINT {sp_name}"), [])
            .map_err(storage_err)?;

        match f(self) {
            Ok(v) => {
                guard
                    .borrow()
                    .execute(&format!("RELEASE SAVEPOINT {sp_name}"), [])
                    .map_err(storage_err)?;
                Ok(v)
            }
            Err(e) => {
                let conn = guard.borrow();
                let _ = conn.execute(&format!("ROLLBACK TO SAVEPOINT {sp_name}"), []);
                let _ = conn.execute(&format!("RELEASE SAVEPOINT {sp_name}"), []);
                // Tables created inside the savepoint are gone again.
                self.migrated.lock().clear();
                Err(e)
            }
        }
    }

    /// Create tables and expression indexes for every type of `ty`'s
    /// collection when the registered schema version moved.
    fn migrate(&self, ty: &EntityType) -> Result<()> {
        let version = self.registry.collection_version(&ty.collection);
        if self.migrated.lock().get(&ty.collection) == Some(&version) {
            return Ok(());
        }

        let mut types = self.registry.collection_types(&ty.collection);
        if !types.iter().any(|t| t.store == ty.store) {
            types.push(Arc::new(ty.clone()));
        }
        self.with_conn(|conn| {
            for t in &types {
                let table = table_name(t);
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                         seq  INTEGER PRIMARY KEY AUTOINCREMENT,
                         key  TEXT UNIQUE,
                         data TEXT NOT NULL
                     );"
                ))
                .map_err(storage_err)?;
                for field in t.fields.iter().filter(|f| f.has_index()) {
                    conn.execute_batch(&format!(
                        "CREATE INDEX IF NOT EXISTS \"idx_{}__{}__{}\" ON {table} \
                         (json_extract(data, '$.{}'))",
                        t.collection, t.store, field.name, field.name
                    ))
                    .map_err(storage_err)?;
                }
            }
            conn.execute(
                "INSERT OR REPLACE INTO meta (collection, version) VALUES (?1, ?2)",
                params![ty.collection, version],
            )
            .map_err(storage_err)?;
            Ok(())
        })?;

        tracing::info!(
            collection = %ty.collection,
            version,
            stores = types.len(),
            "migrated sqlite collection schema"
        );
        self.migrated.lock().insert(ty.collection.clone(), version);
        Ok(())
    }

    fn read(&self, ty: &EntityType, key: &str) -> Result<Option<Record>> {
        self.migrate(ty)?;
        let text: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT data FROM {} WHERE key = ?1", table_name(ty)),
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)
        })?;
        text.map(|text| parse_record(ty, &text)).transpose()
    }

    fn scan(&self, ty: &EntityType) -> Result<Vec<Record>> {
        self.migrate(ty)?;
        let rows: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT data FROM {} ORDER BY seq", table_name(ty)))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(storage_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err)
        })?;
        rows.iter().map(|text| parse_record(ty, text)).collect()
    }

    /// Records whose `field` holds `value` directly or as an array element.
    fn scan_field(&self, ty: &EntityType, field: &str, value: &IndexableValue) -> Result<Vec<(Option<String>, Record)>> {
        self.migrate(ty)?;
        let rows: Vec<(Option<String>, String)> = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT t.key, t.data FROM {} AS t WHERE EXISTS \
                     (SELECT 1 FROM json_each(t.data, '$.{field}') AS e WHERE e.value = ?1) \
                     ORDER BY t.seq",
                    table_name(ty)
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![json_value_to_sql(value)], |row| {
                    Ok((row.get::<_, Option<String>>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(storage_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err)
        })?;
        rows.into_iter()
            .map(|(key, text)| Ok((key, parse_record(ty, &text)?)))
            .collect()
    }

    fn check_unique(&self, ty: &EntityType, key: Option<&str>, record: &Record) -> Result<()> {
        for field in ty.fields.iter().filter(|f| f.unique) {
            for value in scalars(record.get(&field.name)) {
                let owners = self.scan_field(ty, &field.name, &value)?;
                if let Some((existing, _)) = owners.iter().find(|(k, _)| k.as_deref() != key) {
                    return Err(StorageError::UniqueConstraint {
                        store: ty.store.clone(),
                        index: field.name.clone(),
                        existing: existing.clone().unwrap_or_default(),
                        value: value.to_value(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn write(&self, ty: &EntityType, record: Record, reason: Option<&str>) -> Result<()> {
        self.migrate(ty)?;
        let key = record_key(ty, &record)?;
        self.check_unique(ty, key.as_deref(), &record)?;
        let previous = match &key {
            Some(key) => self.read(ty, key)?,
            None => None,
        };
        let data = serde_json::to_string(&record)
            .map_err(|e| BlockDbError::Internal(format!("serialize record: {e}")))?;
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (key, data) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET data = excluded.data",
                    table_name(ty)
                ),
                params![key, data],
            )
            .map(|_| ())
            .map_err(storage_err)
        })?;

        if ty.audited {
            let method = if previous.is_some() {
                Method::Update
            } else {
                Method::Insert
            };
            self.append_audit(ty, method, &record, reason)?;
        }
        Ok(())
    }

    fn remove(&self, ty: &EntityType, key: &str, reason: Option<&str>) -> Result<Option<Record>> {
        let Some(record) = self.read(ty, key)? else {
            return Ok(None);
        };
        self.with_conn(|conn| {
            conn.execute(
                &format!("DELETE FROM {} WHERE key = ?1", table_name(ty)),
                params![key],
            )
            .map(|_| ())
            .map_err(storage_err)
        })?;
        if ty.audited {
            self.append_audit(ty, Method::Delete, &record, reason)?;
        }
        Ok(Some(record))
    }

    fn append_audit(
        &self,
        ty: &EntityType,
        method: Method,
        state: &Record,
        reason: Option<&str>,
    ) -> Result<()> {
        match self.registry.audit_type(&ty.store) {
            Some(audit_ty) => self.write(&audit_ty, audit_row(method, state, reason), None),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("migrated", &*self.migrated.lock())
            .finish()
    }
}

/// Fix-up access inside the delete transaction.
struct SqliteFixup<'a> {
    store: &'a SqliteStore,
    reason: Option<&'a str>,
}

impl ReferenceAccess for SqliteFixup<'_> {
    fn find_referencing(
        &mut self,
        entity_type: &EntityType,
        field: &str,
        reference: &str,
    ) -> Result<Vec<Record>> {
        let value = IndexableValue::String(reference.to_string());
        Ok(self
            .store
            .scan_field(entity_type, field, &value)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    fn remove(&mut self, entity_type: &EntityType, record: &Record) -> Result<Option<Record>> {
        match record_key(entity_type, record)? {
            Some(key) => self.store.remove(entity_type, &key, self.reason),
            None => Ok(None),
        }
    }

    fn replace(&mut self, entity_type: &EntityType, record: Record) -> Result<()> {
        self.store.write(entity_type, record, self.reason)
    }
}

#[async_trait]
impl StorageAdapter for SqliteStore {
    async fn get(&self, entity_type: &EntityType, key: &Key) -> Result<Option<Record>> {
        self.read(entity_type, &encode_key(key))
    }

    async fn set(
        &self,
        entity_type: &EntityType,
        record: Record,
        reason: Option<&str>,
    ) -> Result<()> {
        self.transaction(|store| store.write(entity_type, record, reason))
    }

    async fn set_many(
        &self,
        entity_type: &EntityType,
        records: Vec<Record>,
        reasons: &[Option<String>],
    ) -> Result<()> {
        self.transaction(|store| {
            for (i, record) in records.into_iter().enumerate() {
                let reason = reasons.get(i).and_then(|r| r.as_deref());
                store.write(entity_type, record, reason)?;
            }
            Ok(())
        })
    }

    async fn delete(
        &self,
        entity_type: &EntityType,
        key: &Key,
        reason: Option<&str>,
    ) -> Result<Vec<ChangeMessage>> {
        self.transaction(|store| {
            let Some(record) = store.remove(entity_type, &encode_key(key), reason)? else {
                return Ok(Vec::new());
            };
            let mut changes = Vec::new();
            if let Some(id) = record.get(ID_FIELD).and_then(Value::as_str) {
                let mut access = SqliteFixup { store, reason };
                fix_up_references(&store.registry, &mut access, entity_type, id, &mut changes)?;
            }
            Ok(changes)
        })
    }

    async fn execute_query(&self, query: &QueryDescriptor) -> Result<QueryOutput> {
        let ty = query.entity_type();
        let mut rows = self.scan(ty)?;
        rows.retain(|row| query.matches(&ty.store, row));
        let mut rows = sort_records(ty, rows, query.sort());
        Ok(if query.is_first() {
            rows.truncate(1);
            QueryOutput::One(rows.into_iter().next())
        } else {
            QueryOutput::Many(rows)
        })
    }
}

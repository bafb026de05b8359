use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Records and change messages
// ============================================================================

/// A serialized entity: a flat field-name → value map.
pub type Record = serde_json::Map<String, Value>;

/// The kind of mutation carried by a [`ChangeMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Insert,
    Update,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Insert => "INSERT",
            Method::Update => "UPDATE",
            Method::Delete => "DELETE",
        }
    }

    pub fn is_upsert(self) -> bool {
        matches!(self, Method::Insert | Method::Update)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed mutation, delivered to local subscriptions and to every other
/// context sharing the same hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub store: String,
    pub method: Method,
    pub state: Record,
}

impl ChangeMessage {
    pub fn new(store: impl Into<String>, method: Method, state: Record) -> Self {
        Self {
            store: store.into(),
            method,
            state,
        }
    }

    /// A deletion notice carrying only the identifier.
    pub fn deleted(store: impl Into<String>, id: &str) -> Self {
        let mut state = Record::new();
        state.insert("id".to_string(), Value::String(id.to_string()));
        Self::new(store, Method::Delete, state)
    }

    pub fn id(&self) -> Option<&str> {
        self.state.get("id").and_then(Value::as_str)
    }
}

// ============================================================================
// Indexable values and keys
// ============================================================================

/// Values that can be stored in an index or used as part of a primary key.
///
/// Ordering follows the query engine: numbers, then strings, then booleans,
/// with `Null` sorting last.
#[derive(Debug, Clone)]
pub enum IndexableValue {
    Null,
    String(String),
    Number(f64),
    Bool(bool),
}

impl IndexableValue {
    /// Convert a JSON scalar. Arrays, objects, null and NaN are not indexable.
    /// `-0.0` is stored as `0.0` so index lookups agree with `==`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Number(n) => n
                .as_f64()
                .filter(|f| !f.is_nan())
                .map(|f| Self::Number(if f == 0.0 { 0.0 } else { f })),
            Value::Bool(b) => Some(Self::Bool(*b)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::String(s) => Value::String(s.clone()),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Bool(b) => Value::Bool(*b),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Number(_) => 0,
            Self::String(_) => 1,
            Self::Bool(_) => 2,
            Self::Null => 3,
        }
    }
}

impl PartialEq for IndexableValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexableValue {}

impl PartialOrd for IndexableValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexableValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for IndexableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// A primary key: one value per field of the entity type's key path, or a
/// single generated number for auto-key stores.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key(pub Vec<IndexableValue>);

impl Key {
    pub fn single(value: impl Into<String>) -> Self {
        Self(vec![IndexableValue::String(value.into())])
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.0.iter().map(IndexableValue::to_value).collect())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Operation options
// ============================================================================

/// Options for [`Entity::commit`](crate::entity::Entity::commit).
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Commit resolved relation children first and flush all writes together.
    pub cascade: bool,
    /// Overrides the entity's scope before it is serialized.
    pub scope: Option<String>,
    /// Recorded in the audit trail of audited types.
    pub reason: Option<String>,
}

/// Options for [`Entity::delete`](crate::entity::Entity::delete).
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Also delete every entity this one relates to.
    pub cascade: bool,
    pub reason: Option<String>,
}

/// Options for [`Entity::duplicate`](crate::entity::Entity::duplicate).
#[derive(Debug, Clone, Default)]
pub struct DuplicateOptions {
    /// Deep-copy resolved relation children instead of sharing them.
    pub cascade: bool,
}

/// Options for [`Store::commit_many`](crate::store::Store::commit_many).
#[derive(Debug, Clone, Default)]
pub struct BulkCommitOptions {
    pub scope: Option<String>,
    /// Audit reasons, positionally matched to the committed entities.
    pub reasons: Vec<Option<String>>,
}

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::ReferenceError;

/// A non-owning pointer to another entity, serialized as
/// `collection:store:identifier`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    pub collection: String,
    pub store: String,
    pub id: String,
}

impl Reference {
    pub fn new(
        collection: impl Into<String>,
        store: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            store: store.into(),
            id: id.into(),
        }
    }

    /// Parse a serialized reference. Returns `None` for anything that is not
    /// a three-part string.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.collection, self.store, self.id)
    }
}

impl FromStr for Reference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [collection, store, id]
                if !collection.is_empty() && !store.is_empty() && !id.is_empty() =>
            {
                Ok(Self::new(*collection, *store, *id))
            }
            _ => Err(ReferenceError(s.to_string())),
        }
    }
}

impl From<Reference> for Value {
    fn from(reference: Reference) -> Self {
        Value::String(reference.to_string())
    }
}

impl From<&Reference> for Value {
    fn from(reference: &Reference) -> Self {
        Value::String(reference.to_string())
    }
}

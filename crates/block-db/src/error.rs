use thiserror::Error;

// ---------------------------------------------------------------------------
// SchemaError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("The store name \"{0}\" has already been defined")]
    DuplicateStore(String),

    #[error("Invalid {kind} name \"{name}\"")]
    InvalidName { kind: &'static str, name: String },

    #[error("Store \"{0}\" is not registered")]
    UnknownStore(String),

    #[error("Field \"{field}\" is not defined on store \"{store}\"")]
    UnknownField { store: String, field: String },

    #[error("Field \"{field}\" on store \"{store}\" expects {expected}")]
    FieldKind {
        store: String,
        field: String,
        expected: &'static str,
    },

    #[error("Compound store \"{0}\" declares no grouped fields")]
    EmptyKeyPath(String),
}

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {store}/{key}")]
    NotFound { store: String, key: String },

    #[error(
        "Unique constraint violation on index \"{index}\" in store \"{store}\": \
         value already exists in record \"{existing}\""
    )]
    UniqueConstraint {
        store: String,
        index: String,
        existing: String,
        value: serde_json::Value,
    },

    #[error("Record in store \"{store}\" has no usable value for key field \"{field}\"")]
    MissingKey { store: String, field: String },

    #[error("Storage adapter is closed")]
    Closed,

    #[error("Backend error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Corrupt record in {store}: {source}")]
    Corruption {
        store: String,
        #[source]
        source: serde_json::Error,
    },

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }
}

// ---------------------------------------------------------------------------
// QueryError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Operator \"{operator}\" on field \"{field}\" expects {expected}")]
    InvalidOperand {
        field: String,
        operator: &'static str,
        expected: &'static str,
    },
}

// ---------------------------------------------------------------------------
// ReferenceError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
#[error("Malformed reference \"{0}\": expected collection:store:identifier")]
pub struct ReferenceError(pub String);

// ---------------------------------------------------------------------------
// BlockDbError: top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BlockDbError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    /// Surfaced after a failed durable write has been rolled back.
    #[error("Commit of {store}/{id} failed: {message}")]
    CommitFailed {
        store: String,
        id: String,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = BlockDbError> = std::result::Result<T, E>;

use thiserror::Error;

use crate::types::NodeType;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Node not found: {id}")]
    NotFound { id: String },

    #[error("Type mismatch for {id}: expected {expected}, found {found}")]
    TypeMismatch {
        id: String,
        expected: NodeType,
        found: String,
    },

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Transient backend error: {0}")]
    TransientBackend(String),

    #[error("Dangling {store} reference to {id}")]
    ConsistencyRace { id: String, store: &'static str },

    #[error("Query error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Embedding error: {0}")]
    Embedding(String),
}

impl StorageError {
    pub fn not_found(id: impl Into<String>) -> Self {
        StorageError::NotFound { id: id.into() }
    }

    /// Network failures and timeouts. Only these may be retried by a caller
    /// that has a retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::TransientBackend(_))
    }

    /// Schema and cardinality violations mean the data model itself is broken.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::SchemaViolation(_) | StorageError::InvariantViolation(_)
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

//! Typed errors for the places where callers branch on the failure kind.
//!
//! Everything else flows through `anyhow::Result` with context attached.

use thiserror::Error;

/// Failure of a whole indexing run (as opposed to one path).
#[derive(Debug, Error)]
pub enum IndexError {
    /// Another run holds a lock on an overlapping root.
    #[error("an indexing run is already active for {0}")]
    Busy(String),

    #[error("{0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Rejections that happen before any retrieval or indexing work starts.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Vector store adapter failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid filter: {0}")]
    Filter(String),

    #[error("chunk {0} has no embedding")]
    MissingEmbedding(String),

    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

/// Failure of a search or ask request.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Filter(msg) => QueryError::Validation(ValidationError(msg)),
            other => QueryError::Internal(other.into()),
        }
    }
}

//! Error types for semantic-memory

use thiserror::Error;

use crate::memory_db::schema::Provider;

/// Result type alias for semantic-memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors surfaced by the store.
///
/// Validation variants (`DimensionMismatch`, `AmbiguousProvider`,
/// `UnknownDimension`, `InvalidInput`) are always raised before anything is
/// mutated. Storage variants propagate unchanged from SQLite or the pool.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("embedding dimension mismatch for {provider} provider: expected {expected}, got {actual}")]
    DimensionMismatch {
        provider: Provider,
        expected: usize,
        actual: usize,
    },

    #[error("vector of dimension {dimension} matches more than one provider; pass a provider explicitly")]
    AmbiguousProvider { dimension: usize },

    #[error("no provider is configured for vectors of dimension {dimension}")]
    UnknownDimension { dimension: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("SQLite error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("vector index error: {0}")]
    Index(String),

    #[error("memory store has been closed")]
    Closed,

    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl MemoryError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    /// True for errors the caller caused; nothing was written.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::DimensionMismatch { .. }
                | Self::AmbiguousProvider { .. }
                | Self::UnknownDimension { .. }
                | Self::InvalidInput(_)
        )
    }
}

impl From<bincode::Error> for MemoryError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

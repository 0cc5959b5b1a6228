//! Durable dual-provider semantic memory.
//!
//! Conversational thoughts live in SQLite; each embedding provider has its
//! own HNSW index that is snapshotted to disk and rebuilt from the database
//! whenever the snapshot cannot be trusted.

pub mod config;
pub mod error;
pub mod memory;
pub mod memory_db;
pub mod metrics;
pub mod query_engine;
pub mod recovery;
pub mod telemetry;
pub mod vector_index;
pub mod worker_threads;

// Public API exports
pub use config::Config;
pub use error::{MemoryError, Result};
pub use memory::{MemoryStore, SemanticMemory, StoreStats};
pub use memory_db::{
    ConversationSummaryRecord, DatabaseStats, MemoryMatch, MemoryRecord, Provider,
    RawMessageRecord, Role, SearchScope, ThoughtMetadata, ThoughtRecord,
};
pub use recovery::{RebuildReason, RecoveryAction, RecoveryPlan};
pub use vector_index::IndexStats;

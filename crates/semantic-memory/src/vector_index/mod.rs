//! Per-provider ANN indexes, their label directories and snapshots
pub mod hnsw;
pub mod labels;
pub mod snapshot;

pub use hnsw::{cosine_distance, grown_capacity, VectorIndex};
pub use labels::LabelDirectory;
pub use snapshot::{read_snapshot, write_snapshot, SnapshotPayload, SnapshotRead};

use serde::Serialize;

use crate::memory_db::Provider;

/// An index together with the directory translating its labels.
pub struct IndexState {
    pub index: VectorIndex,
    pub labels: LabelDirectory,
}

impl IndexState {
    pub fn empty(dimension: usize, capacity: usize) -> Self {
        Self {
            index: VectorIndex::new(dimension, capacity),
            labels: LabelDirectory::new(),
        }
    }

    pub fn snapshot(&self) -> SnapshotPayload {
        SnapshotPayload::capture(&self.index, &self.labels)
    }

    pub fn stats(&self, provider: Provider) -> IndexStats {
        IndexStats {
            provider,
            dimension: self.index.dimension(),
            count: self.index.current_count(),
            capacity: self.index.max_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub provider: Provider,
    pub dimension: usize,
    pub count: usize,
    pub capacity: usize,
}

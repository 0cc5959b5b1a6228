//! On-disk index snapshots.
//!
//! A snapshot is a bincode envelope holding a format version, the blake3
//! hash of the payload, and the payload itself (dimension, capacity, and
//! the `(record id, vector)` list in label order). Files are written to a
//! sibling temp path and renamed into place.
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::vector_index::{LabelDirectory, VectorIndex};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct SnapshotEnvelope {
    format_version: u32,
    checksum: String,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub dimension: usize,
    pub capacity: usize,
    /// Record id for each label
    pub ids: Vec<String>,
    /// Vector for each label
    pub points: Vec<Vec<f32>>,
}

impl SnapshotPayload {
    pub fn capture(index: &VectorIndex, labels: &LabelDirectory) -> Self {
        Self {
            dimension: index.dimension(),
            capacity: index.max_capacity(),
            ids: labels.ids().to_vec(),
            points: index.points().to_vec(),
        }
    }

    pub fn empty(dimension: usize, capacity: usize) -> Self {
        Self {
            dimension,
            capacity,
            ids: Vec::new(),
            points: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.points.len()
    }
}

/// Result of trying to read a snapshot file
#[derive(Debug)]
pub enum SnapshotRead {
    Missing,
    Unreadable(String),
    Loaded(SnapshotPayload),
}

pub fn write_snapshot(path: &Path, payload: &SnapshotPayload) -> Result<()> {
    let body = bincode::serialize(payload)?;
    let envelope = SnapshotEnvelope {
        format_version: SNAPSHOT_FORMAT_VERSION,
        checksum: blake3::hash(&body).to_hex().to_string(),
        payload: body,
    };
    let bytes = bincode::serialize(&envelope)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!("Wrote snapshot {} ({} points)", path.display(), payload.count());
    Ok(())
}

pub fn read_snapshot(path: &Path) -> SnapshotRead {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SnapshotRead::Missing,
        Err(e) => return SnapshotRead::Unreadable(e.to_string()),
    };
    match decode(&bytes) {
        Ok(payload) => SnapshotRead::Loaded(payload),
        Err(e) => SnapshotRead::Unreadable(e.to_string()),
    }
}

fn decode(bytes: &[u8]) -> Result<SnapshotPayload> {
    let envelope: SnapshotEnvelope = bincode::deserialize(bytes)?;
    if envelope.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(MemoryError::index(format!(
            "unsupported snapshot format {}",
            envelope.format_version
        )));
    }
    if blake3::hash(&envelope.payload).to_hex().as_str() != envelope.checksum {
        return Err(MemoryError::index("snapshot checksum mismatch"));
    }
    let payload: SnapshotPayload = bincode::deserialize(&envelope.payload)?;
    if payload.ids.len() != payload.points.len() {
        return Err(MemoryError::index(format!(
            "snapshot has {} ids for {} points",
            payload.ids.len(),
            payload.points.len()
        )));
    }
    if let Some(bad) = payload.points.iter().find(|p| p.len() != payload.dimension) {
        return Err(MemoryError::index(format!(
            "snapshot point of dimension {} in index of dimension {}",
            bad.len(),
            payload.dimension
        )));
    }
    Ok(payload)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SnapshotPayload {
        SnapshotPayload {
            dimension: 2,
            capacity: 10,
            ids: vec!["a".into(), "b".into()],
            points: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
        }
    }

    #[test]
    fn written_snapshot_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thoughts_local.hnsw");
        write_snapshot(&path, &sample()).unwrap();
        assert!(!dir.path().join("thoughts_local.hnsw.tmp").exists());

        match read_snapshot(&path) {
            SnapshotRead::Loaded(payload) => assert_eq!(payload, sample()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_and_corrupt_files_are_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thoughts_remote.hnsw");
        assert!(matches!(read_snapshot(&path), SnapshotRead::Missing));

        fs::write(&path, b"definitely not a snapshot").unwrap();
        assert!(matches!(read_snapshot(&path), SnapshotRead::Unreadable(_)));
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.hnsw");
        write_snapshot(&path, &sample()).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        assert!(matches!(read_snapshot(&path), SnapshotRead::Unreadable(_)));
    }

    #[test]
    fn capture_reflects_index_and_labels() {
        let mut index = VectorIndex::new(2, 4);
        let mut labels = LabelDirectory::new();
        let label = labels.push("t1".into()).unwrap();
        index.add_point(&[0.6, 0.8], label).unwrap();

        let payload = SnapshotPayload::capture(&index, &labels);
        assert_eq!(payload.count(), 1);
        assert_eq!(payload.capacity, 4);
        assert_eq!(payload.ids, vec!["t1".to_string()]);
    }
}

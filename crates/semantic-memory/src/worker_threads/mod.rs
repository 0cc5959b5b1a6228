pub mod snapshot_worker;
pub use snapshot_worker::{SharedIndex, SnapshotHandle, SnapshotTarget, SnapshotWorker};

//! Startup reconciliation of each provider's index with the database.
//!
//! The database is authoritative. A snapshot is accepted only when it is
//! readable, has the configured dimension, holds exactly as many points as
//! the database has indexable rows, and its label order agrees with the
//! labels stored on those rows. Anything else triggers a rebuild.
use std::fmt;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::memory_db::{MemoryDatabase, Provider};
use crate::metrics;
use crate::vector_index::{
    read_snapshot, write_snapshot, IndexState, LabelDirectory, SnapshotPayload, SnapshotRead, VectorIndex,
};

/// Headroom added on top of the record count when sizing a fresh index.
const REBUILD_HEADROOM: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    SnapshotMissing,
    SnapshotUnreadable(String),
    DimensionMismatch { snapshot: usize, configured: usize },
    CountMismatch { snapshot: usize, database: usize },
    LabelMismatch(String),
    /// A committed row could not be added to the in-memory index
    IndexInsertFailed,
    Requested,
}

impl RebuildReason {
    /// Short metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildReason::SnapshotMissing => "snapshot_missing",
            RebuildReason::SnapshotUnreadable(_) => "snapshot_unreadable",
            RebuildReason::DimensionMismatch { .. } => "dimension_mismatch",
            RebuildReason::CountMismatch { .. } => "count_mismatch",
            RebuildReason::LabelMismatch(_) => "label_mismatch",
            RebuildReason::IndexInsertFailed => "index_insert_failed",
            RebuildReason::Requested => "requested",
        }
    }
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildReason::SnapshotMissing => write!(f, "snapshot missing"),
            RebuildReason::SnapshotUnreadable(e) => write!(f, "snapshot unreadable: {}", e),
            RebuildReason::DimensionMismatch { snapshot, configured } => {
                write!(f, "snapshot dimension {} but configured {}", snapshot, configured)
            }
            RebuildReason::CountMismatch { snapshot, database } => {
                write!(f, "snapshot holds {} points but database has {}", snapshot, database)
            }
            RebuildReason::LabelMismatch(e) => write!(f, "labels disagree: {}", e),
            RebuildReason::IndexInsertFailed => write!(f, "index insert failed after commit"),
            RebuildReason::Requested => write!(f, "rebuild requested"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    Load,
    Resize { from: usize, to: usize },
    Rebuild(RebuildReason),
}

/// What recovery would do for one provider, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub provider: Provider,
    pub database_count: usize,
    pub snapshot_count: Option<usize>,
    pub action: RecoveryAction,
}

pub struct RecoveryEngine<'a> {
    db: &'a MemoryDatabase,
    config: &'a Config,
}

impl<'a> RecoveryEngine<'a> {
    pub fn new(db: &'a MemoryDatabase, config: &'a Config) -> Self {
        Self { db, config }
    }

    /// Decide what to do without changing anything.
    pub fn plan(&self, provider: Provider) -> Result<RecoveryPlan> {
        self.assess(provider).map(|(plan, _)| plan)
    }

    /// Load, resize or rebuild `provider`'s index so it matches the database.
    pub fn recover(&self, provider: Provider) -> Result<(IndexState, RecoveryPlan)> {
        let (plan, payload) = self.assess(provider)?;
        let dimension = self.config.dimension(provider);

        let state = match (&plan.action, payload) {
            (RecoveryAction::Load, Some(payload)) => {
                info!("{} index loaded from snapshot ({} points)", provider, plan.database_count);
                restore(dimension, payload.capacity, payload)?
            }
            (RecoveryAction::Resize { from, to }, Some(payload)) => {
                info!("{} index snapshot capacity {} is below {} points, resizing to {}", provider, from, plan.database_count, to);
                let state = restore(dimension, *to, payload)?;
                self.persist(provider, &state);
                state
            }
            (RecoveryAction::Rebuild(reason), _) => {
                let state = self.rebuild(provider, reason)?;
                self.persist(provider, &state);
                state
            }
            (_, None) => {
                // assess only plans Load/Resize when it has a payload
                let reason = RebuildReason::SnapshotMissing;
                let state = self.rebuild(provider, &reason)?;
                self.persist(provider, &state);
                state
            }
        };

        metrics::set_index_points(provider, state.index.current_count());
        Ok((state, plan))
    }

    /// Reconstruct `provider`'s index from the database, reassigning labels
    /// `0..N-1` in record-id order. Does not write a snapshot.
    pub fn rebuild(&self, provider: Provider, reason: &RebuildReason) -> Result<IndexState> {
        let dimension = self.config.dimension(provider);
        info!("Rebuilding {} index: {}", provider, reason);

        let rows = self.db.thoughts.indexable_embeddings(provider, dimension)?;
        let (ids, points): (Vec<String>, Vec<Vec<f32>>) = rows.into_iter().unzip();
        let capacity = rebuild_capacity(self.config.index_capacity_floor, ids.len());

        let assignments: Vec<(String, u32)> = ids
            .iter()
            .enumerate()
            .map(|(label, id)| (id.clone(), label as u32))
            .collect();
        self.db.thoughts.reassign_labels(provider, &assignments)?;

        let state = IndexState {
            index: VectorIndex::from_points(dimension, capacity, points)?,
            labels: LabelDirectory::from_ordered_ids(ids)?,
        };
        metrics::inc_rebuilds(provider, reason.as_str());
        info!(
            "Rebuilt {} index with {} points (capacity {})",
            provider,
            state.index.current_count(),
            capacity
        );
        Ok(state)
    }

    /// Write a snapshot of `state`; failures are logged and counted only.
    pub fn persist(&self, provider: Provider, state: &IndexState) {
        let path = self.config.snapshot_path(provider);
        if let Err(e) = write_snapshot(&path, &state.snapshot()) {
            warn!("Failed to write {} index snapshot to {}: {}", provider, path.display(), e);
            metrics::inc_snapshot_failures(provider);
        }
    }

    fn assess(&self, provider: Provider) -> Result<(RecoveryPlan, Option<SnapshotPayload>)> {
        let dimension = self.config.dimension(provider);
        let database_count = self.db.thoughts.count_indexable(provider, dimension)?;
        let plan = |snapshot_count, action| RecoveryPlan {
            provider,
            database_count,
            snapshot_count,
            action,
        };

        let payload = match read_snapshot(&self.config.snapshot_path(provider)) {
            SnapshotRead::Loaded(payload) => payload,
            SnapshotRead::Missing => {
                return Ok((plan(None, RecoveryAction::Rebuild(RebuildReason::SnapshotMissing)), None))
            }
            SnapshotRead::Unreadable(e) => {
                warn!("{} index snapshot is unreadable: {}", provider, e);
                return Ok((plan(None, RecoveryAction::Rebuild(RebuildReason::SnapshotUnreadable(e))), None));
            }
        };

        let snapshot_count = Some(payload.count());
        if let Some(reason) = self.disagreement(provider, &payload, database_count)? {
            return Ok((plan(snapshot_count, RecoveryAction::Rebuild(reason)), None));
        }

        let action = if payload.capacity < database_count {
            RecoveryAction::Resize {
                from: payload.capacity,
                to: rebuild_capacity(self.config.index_capacity_floor, database_count),
            }
        } else {
            RecoveryAction::Load
        };
        Ok((plan(snapshot_count, action), Some(payload)))
    }

    fn disagreement(
        &self,
        provider: Provider,
        payload: &SnapshotPayload,
        database_count: usize,
    ) -> Result<Option<RebuildReason>> {
        let configured = self.config.dimension(provider);
        if payload.dimension != configured {
            return Ok(Some(RebuildReason::DimensionMismatch {
                snapshot: payload.dimension,
                configured,
            }));
        }
        if payload.count() != database_count {
            return Ok(Some(RebuildReason::CountMismatch {
                snapshot: payload.count(),
                database: database_count,
            }));
        }

        let stored = self.db.thoughts.load_labels(provider, configured)?;
        let directory = match LabelDirectory::from_persisted(stored) {
            Ok(directory) => directory,
            Err(e) => return Ok(Some(RebuildReason::LabelMismatch(e))),
        };
        if directory.ids() != payload.ids.as_slice() {
            return Ok(Some(RebuildReason::LabelMismatch(
                "snapshot label order differs from stored labels".into(),
            )));
        }
        Ok(None)
    }
}

/// Capacity for a freshly built index over `count` records
pub fn rebuild_capacity(floor: usize, count: usize) -> usize {
    floor.max(count + REBUILD_HEADROOM)
}

fn restore(dimension: usize, capacity: usize, payload: SnapshotPayload) -> Result<IndexState> {
    Ok(IndexState {
        index: VectorIndex::from_points(dimension, capacity, payload.points)?,
        labels: LabelDirectory::from_ordered_ids(payload.ids)?,
    })
}

//! Snapshot worker thread
//!
//! Persists index snapshots off the write path. Requests are coalesced: a
//! burst of inserts against one provider produces a single write.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{MemoryError, Result};
use crate::memory_db::Provider;
use crate::metrics;
use crate::vector_index::{write_snapshot, IndexState};

pub type SharedIndex = Arc<RwLock<IndexState>>;

pub enum SnapshotCommand {
    /// Write this provider's snapshot when the worker gets to it
    Persist(Provider),
    /// Write every snapshot now and report the outcome
    Flush(oneshot::Sender<Result<()>>),
    Shutdown,
}

/// Where and what to persist for one provider
#[derive(Clone)]
pub struct SnapshotTarget {
    pub provider: Provider,
    pub path: PathBuf,
    pub state: SharedIndex,
}

/// Cheap sender side handed to the query engine
#[derive(Clone)]
pub struct SnapshotHandle {
    sender: mpsc::UnboundedSender<SnapshotCommand>,
}

impl SnapshotHandle {
    /// Queue a write; never blocks and never fails the caller.
    pub fn request(&self, provider: Provider) {
        if self.sender.send(SnapshotCommand::Persist(provider)).is_err() {
            warn!("Snapshot worker is gone; {} snapshot will be rebuilt on next start", provider);
        }
    }

    /// Write every snapshot and wait for the result.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SnapshotCommand::Flush(tx))
            .map_err(|_| MemoryError::index("snapshot worker is not running"))?;
        rx.await
            .map_err(|_| MemoryError::index("snapshot worker stopped before flushing"))?
    }
}

pub struct SnapshotWorker {
    handle: SnapshotHandle,
    thread_handle: Option<JoinHandle<()>>,
}

impl SnapshotWorker {
    pub fn spawn(targets: Vec<SnapshotTarget>) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let thread_handle = thread::Builder::new()
            .name("snapshot-writer".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create snapshot worker runtime: {}", e);
                        return;
                    }
                };
                rt.block_on(Self::run_worker_loop(receiver, targets));
            })?;

        info!("Spawned snapshot worker thread");
        Ok(Self {
            handle: SnapshotHandle { sender },
            thread_handle: Some(thread_handle),
        })
    }

    pub fn handle(&self) -> SnapshotHandle {
        self.handle.clone()
    }

    async fn run_worker_loop(
        mut receiver: mpsc::UnboundedReceiver<SnapshotCommand>,
        targets: Vec<SnapshotTarget>,
    ) {
        while let Some(command) = receiver.recv().await {
            let mut pending = BTreeSet::new();
            let mut flushes = Vec::new();
            let mut shutdown = false;

            let mut absorb = |command: SnapshotCommand| match command {
                SnapshotCommand::Persist(provider) => {
                    pending.insert(provider);
                }
                SnapshotCommand::Flush(reply) => flushes.push(reply),
                SnapshotCommand::Shutdown => shutdown = true,
            };
            absorb(command);
            while let Ok(command) = receiver.try_recv() {
                absorb(command);
            }

            if !flushes.is_empty() {
                pending.extend(targets.iter().map(|t| t.provider));
            }

            let mut failures = Vec::new();
            for provider in pending {
                let Some(target) = targets.iter().find(|t| t.provider == provider) else {
                    continue;
                };
                if let Err(e) = persist(target) {
                    warn!("Failed to write {} snapshot to {}: {}", provider, target.path.display(), e);
                    metrics::inc_snapshot_failures(provider);
                    failures.push(format!("{}: {}", provider, e));
                }
            }

            for reply in flushes {
                let outcome = if failures.is_empty() {
                    Ok(())
                } else {
                    Err(MemoryError::index(format!("snapshot flush failed ({})", failures.join("; "))))
                };
                let _ = reply.send(outcome);
            }

            if shutdown {
                break;
            }
        }

        info!("Snapshot worker shutting down");
    }
}

impl Drop for SnapshotWorker {
    fn drop(&mut self) {
        let _ = self.handle.sender.send(SnapshotCommand::Shutdown);
        if let Some(thread_handle) = self.thread_handle.take() {
            if thread_handle.join().is_err() {
                error!("Snapshot worker thread panicked");
            }
        }
    }
}

/// Capture under the read lock, write without it.
fn persist(target: &SnapshotTarget) -> Result<()> {
    let payload = {
        let state = target
            .state
            .read()
            .map_err(|_| MemoryError::LockPoisoned("index state"))?;
        state.snapshot()
    };
    write_snapshot(&target.path, &payload)?;
    debug!("Persisted {} snapshot ({} points)", target.provider, payload.count());
    Ok(())
}

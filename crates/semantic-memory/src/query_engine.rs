//! Writes and similarity queries over the provider index pair.
//!
//! Each provider has one index state behind a `std::sync::RwLock` (searches
//! take the read side) and an async writer mutex that serializes mutations.
//! A write holds its provider's writer mutex for the whole operation; the
//! index lock is only taken for the in-memory part, after the row commits.
use chrono::{SubsecRound, Utc};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{MemoryError, Result};
use crate::memory_db::{MemoryDatabase, Provider, Role, SearchScope, ThoughtMetadata, ThoughtRecord};
use crate::metrics;
use crate::recovery::{RebuildReason, RecoveryEngine};
use crate::vector_index::{IndexState, IndexStats};
use crate::worker_threads::{SharedIndex, SnapshotHandle};

struct ProviderSlot {
    provider: Provider,
    dimension: usize,
    state: SharedIndex,
    writer: Mutex<()>,
}

impl ProviderSlot {
    fn read(&self) -> Result<RwLockReadGuard<'_, IndexState>> {
        self.state
            .read()
            .map_err(|_| MemoryError::LockPoisoned("index state"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IndexState>> {
        self.state
            .write()
            .map_err(|_| MemoryError::LockPoisoned("index state"))
    }
}

pub struct QueryEngine {
    db: Arc<MemoryDatabase>,
    config: Config,
    remote: ProviderSlot,
    local: ProviderSlot,
    snapshots: SnapshotHandle,
    closed: AtomicBool,
}

/// Both writer mutexes, held remote then local.
pub struct WritersPaused<'a> {
    _remote: MutexGuard<'a, ()>,
    _local: MutexGuard<'a, ()>,
}

impl QueryEngine {
    /// `remote` and `local` must already be reconciled with `db`.
    pub fn new(
        db: Arc<MemoryDatabase>,
        config: Config,
        remote: SharedIndex,
        local: SharedIndex,
        snapshots: SnapshotHandle,
    ) -> Self {
        let slot = |provider, state| ProviderSlot {
            provider,
            dimension: config.dimension(provider),
            state,
            writer: Mutex::new(()),
        };
        let remote = slot(Provider::Remote, remote);
        let local = slot(Provider::Local, local);
        Self {
            db,
            config,
            remote,
            local,
            snapshots,
            closed: AtomicBool::new(false),
        }
    }

    fn slot(&self, provider: Provider) -> &ProviderSlot {
        match provider {
            Provider::Remote => &self.remote,
            Provider::Local => &self.local,
        }
    }

    /// Store a thought with its `provider` embedding and index it.
    /// Returns the generated record id.
    pub async fn add_vector(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
        embedding: &[f32],
        provider: Provider,
    ) -> Result<String> {
        if conversation_id.trim().is_empty() {
            return Err(MemoryError::invalid_input("conversation id must not be empty"));
        }
        let slot = self.slot(provider);
        if embedding.len() != slot.dimension {
            return Err(MemoryError::DimensionMismatch {
                provider,
                expected: slot.dimension,
                actual: embedding.len(),
            });
        }

        let _writer = slot.writer.lock().await;
        self.ensure_accepting()?;

        let created_at = Utc::now().trunc_subsecs(6);
        let mut record = ThoughtRecord {
            id: new_thought_id(conversation_id, role, created_at.timestamp_millis()),
            conversation_id: conversation_id.to_string(),
            role,
            text_content: text.to_string(),
            created_at,
            embedding_remote: None,
            embedding_local: None,
        };
        match provider {
            Provider::Remote => record.embedding_remote = Some(embedding.to_vec()),
            Provider::Local => record.embedding_local = Some(embedding.to_vec()),
        }

        let label = {
            let mut state = slot.write()?;
            if let Some(capacity) = state.index.ensure_room()? {
                info!("Grew {} index to capacity {}", provider, capacity);
            }
            state.labels.next_label()
        };

        // The row is durable before any reader can map the label to its id.
        self.db.with_transaction(|tx| {
            self.db.thoughts.upsert_with_tx(tx, &record, provider, label)
        })?;

        let indexed = slot.write().and_then(|mut state| {
            state.index.add_point(embedding, label)?;
            if let Err(e) = state.labels.push(record.id.clone()) {
                // index and directory must stay the same length
                state.index.clear();
                state.labels.clear();
                return Err(e);
            }
            Ok(())
        });
        if let Err(e) = indexed {
            error!("Indexing committed thought {} failed: {}", record.id, e);
            self.rebuild_locked(slot, RebuildReason::IndexInsertFailed)?;
        }

        metrics::inc_vectors_added(provider);
        metrics::set_index_points(provider, slot.read()?.index.current_count());
        self.snapshots.request(provider);
        debug!("Added {} vector for thought {} as label {}", provider, record.id, label);
        Ok(record.id)
    }

    /// Nearest thoughts to `query`, returned oldest first with distances.
    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        scope: Option<SearchScope>,
    ) -> Result<Vec<ThoughtMetadata>> {
        let providers: Vec<Provider> = match scope {
            None => vec![self.infer_provider(query.len())?],
            Some(SearchScope::Single(provider)) => {
                let expected = self.slot(provider).dimension;
                if query.len() != expected {
                    return Err(MemoryError::DimensionMismatch {
                        provider,
                        expected,
                        actual: query.len(),
                    });
                }
                vec![provider]
            }
            Some(SearchScope::Both) => Provider::ALL.to_vec(),
        };
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let mut hits: Vec<(String, f32)> = Vec::new();
        for provider in providers {
            let slot = self.slot(provider);
            if slot.dimension != query.len() {
                continue;
            }
            metrics::inc_searches(provider);

            let state = slot.read()?;
            let k = top_k.min(state.index.current_count());
            if k == 0 {
                continue;
            }
            let (labels, distances) = state.index.search_knn(query, k)?;
            for (label, distance) in labels.into_iter().zip(distances) {
                let Some(id) = state.labels.id_of(label) else {
                    warn!("{} label {} has no record id", provider, label);
                    continue;
                };
                if seen.insert(id.to_string()) {
                    hits.push((id.to_string(), distance));
                }
            }
        }
        hits.truncate(top_k);

        let distances: HashMap<String, f32> = hits.iter().cloned().collect();
        let ids: Vec<String> = hits.into_iter().map(|(id, _)| id).collect();
        let mut results = self.db.thoughts.fetch_by_ids(&ids)?;
        for thought in &mut results {
            thought.distance = distances.get(&thought.id).copied();
        }
        Ok(results)
    }

    /// Remove every thought and empty both indexes.
    pub async fn delete_all(&self) -> Result<usize> {
        let _remote = self.remote.writer.lock().await;
        let _local = self.local.writer.lock().await;
        self.ensure_accepting()?;

        let deleted = self
            .db
            .with_transaction(|tx| self.db.thoughts.delete_all_with_tx(tx))?;
        for slot in [&self.remote, &self.local] {
            {
                let mut state = slot.write()?;
                state.index.clear();
                state.labels.clear();
            }
            metrics::set_index_points(slot.provider, 0);
            self.snapshots.request(slot.provider);
        }
        info!("Deleted {} thoughts and cleared both indexes", deleted);
        Ok(deleted)
    }

    /// Rebuild `provider`'s index from the database on demand.
    pub async fn rebuild(&self, provider: Provider) -> Result<IndexStats> {
        let slot = self.slot(provider);
        let _writer = slot.writer.lock().await;
        self.ensure_accepting()?;
        self.rebuild_locked(slot, RebuildReason::Requested)?;
        Ok(slot.read()?.stats(provider))
    }

    /// Wait for in-flight writes on both providers, then refuse new ones.
    /// Writers stay blocked for as long as the returned guard lives.
    pub async fn quiesce(&self) -> WritersPaused<'_> {
        let remote = self.remote.writer.lock().await;
        let local = self.local.writer.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        debug!("Writers quiesced");
        WritersPaused {
            _remote: remote,
            _local: local,
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MemoryError::Closed);
        }
        Ok(())
    }

    pub fn index_stats(&self, provider: Provider) -> Result<IndexStats> {
        Ok(self.slot(provider).read()?.stats(provider))
    }

    /// Caller holds the slot's writer mutex.
    fn rebuild_locked(&self, slot: &ProviderSlot, reason: RebuildReason) -> Result<()> {
        let rebuilt = RecoveryEngine::new(&self.db, &self.config).rebuild(slot.provider, &reason)?;
        let count = rebuilt.index.current_count();
        *slot.write()? = rebuilt;
        metrics::set_index_points(slot.provider, count);
        self.snapshots.request(slot.provider);
        Ok(())
    }

    fn infer_provider(&self, dimension: usize) -> Result<Provider> {
        let matching: Vec<Provider> = Provider::ALL
            .into_iter()
            .filter(|p| self.slot(*p).dimension == dimension)
            .collect();
        match matching.as_slice() {
            [provider] => Ok(*provider),
            [] => Err(MemoryError::UnknownDimension { dimension }),
            _ => Err(MemoryError::AmbiguousProvider { dimension }),
        }
    }
}

/// `{conversation}-{role}-{millis}-{random}`
fn new_thought_id(conversation_id: &str, role: Role, millis: i64) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}-{}-{}-{:08x}", conversation_id, role, millis, suffix)
}

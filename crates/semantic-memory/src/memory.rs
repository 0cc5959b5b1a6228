//! The store handle.
//!
//! `SemanticMemory` is built once at startup with [`SemanticMemory::open`],
//! which runs migrations, reconciles both indexes with the database and
//! starts the snapshot worker. Callers share it by reference (usually inside
//! an `Arc`) and must call [`MemoryStore::ensure_save_on_quit`] before exit.
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{MemoryError, Result};
use crate::memory_db::migration::run_maintenance;
use crate::memory_db::{
    ConversationSummaryRecord, DatabaseStats, MemoryDatabase, MemoryMatch, MemoryRecord,
    MigrationReport, MigrationRunner, Provider, RawMessageRecord, Role, SearchScope,
    ThoughtMetadata,
};
use crate::query_engine::QueryEngine;
use crate::recovery::{RecoveryEngine, RecoveryPlan};
use crate::vector_index::IndexStats;
use crate::worker_threads::{SharedIndex, SnapshotHandle, SnapshotTarget, SnapshotWorker};

/// Operations the conversation loop, scheduler and settings layer call.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Store a thought and index its embedding under `provider`
    /// (`Provider::default()` is remote). Returns the new record id.
    async fn add_thought_vector(
        &self,
        conversation_id: &str,
        role: Role,
        text_content: &str,
        embedding: &[f32],
        provider: Provider,
    ) -> Result<String>;

    /// Nearest thoughts, oldest first. `None` infers the provider from the
    /// query length.
    async fn search_similar_thoughts(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        scope: Option<SearchScope>,
    ) -> Result<Vec<ThoughtMetadata>>;

    /// Returns the number of thoughts removed.
    async fn delete_all_thought_vectors(&self) -> Result<usize>;

    async fn get_recent_messages_for_summarization(
        &self,
        limit: usize,
        conversation_id: Option<&str>,
    ) -> Result<Vec<RawMessageRecord>>;

    async fn save_conversation_summary(
        &self,
        summary_text: &str,
        summarized_messages_count: i64,
        conversation_id: Option<&str>,
    ) -> Result<ConversationSummaryRecord>;

    async fn get_latest_conversation_summary(
        &self,
        conversation_id: Option<&str>,
    ) -> Result<Option<ConversationSummaryRecord>>;

    /// Flush both snapshots, then close the database. Later calls are no-ops.
    async fn ensure_save_on_quit(&self) -> Result<()>;
}

/// Row counts plus per-provider index occupancy
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub database: DatabaseStats,
    pub indexes: Vec<IndexStats>,
}

pub struct SemanticMemory {
    config: Config,
    db: Arc<MemoryDatabase>,
    engine: QueryEngine,
    snapshots: SnapshotHandle,
    worker: Mutex<Option<SnapshotWorker>>,
    closed: AtomicBool,
    migrations: MigrationReport,
    recovery: Vec<RecoveryPlan>,
}

impl SemanticMemory {
    pub fn open(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| MemoryError::invalid_input(e.to_string()))?;
        std::fs::create_dir_all(&config.data_dir)?;

        let db = Arc::new(MemoryDatabase::new(&config.database_path(), config.pool_size)?);

        let migrations = MigrationRunner::new(&db, &config).run_all()?;
        if migrations.has_failures() {
            warn!("Some migrations failed and will be retried on next start: {:?}", migrations.steps);
        }

        let (remote, local, recovery) = {
            let engine = RecoveryEngine::new(&db, &config);
            let (remote, remote_plan) = engine.recover(Provider::Remote)?;
            let (local, local_plan) = engine.recover(Provider::Local)?;
            (remote, local, vec![remote_plan, local_plan])
        };
        let remote: SharedIndex = Arc::new(RwLock::new(remote));
        let local: SharedIndex = Arc::new(RwLock::new(local));

        let targets = vec![
            SnapshotTarget {
                provider: Provider::Remote,
                path: config.snapshot_path(Provider::Remote),
                state: Arc::clone(&remote),
            },
            SnapshotTarget {
                provider: Provider::Local,
                path: config.snapshot_path(Provider::Local),
                state: Arc::clone(&local),
            },
        ];
        let worker = SnapshotWorker::spawn(targets)?;
        let snapshots = worker.handle();

        let engine = QueryEngine::new(Arc::clone(&db), config.clone(), remote, local, snapshots.clone());
        info!("Semantic memory ready at {}", config.data_dir.display());

        Ok(Self {
            config,
            db,
            engine,
            snapshots,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
            migrations,
            recovery,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Outcome of the migrations run by `open`
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migrations
    }

    /// What `open` did to each provider's index
    pub fn recovery_plans(&self) -> &[RecoveryPlan] {
        &self.recovery
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MemoryError::Closed);
        }
        Ok(())
    }

    fn check_dimension(&self, provider: Provider, embedding: &[f32]) -> Result<()> {
        let expected = self.config.dimension(provider);
        if embedding.len() != expected {
            return Err(MemoryError::DimensionMismatch {
                provider,
                expected,
                actual: embedding.len(),
            });
        }
        Ok(())
    }

    pub fn count_with_embedding(&self, provider: Provider) -> Result<usize> {
        self.ensure_open()?;
        self.db.thoughts.count_with_embedding(provider)
    }

    pub fn index_stats(&self, provider: Provider) -> Result<IndexStats> {
        self.engine.index_stats(provider)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.ensure_open()?;
        Ok(StoreStats {
            database: self.db.get_stats()?,
            indexes: Provider::ALL
                .into_iter()
                .map(|p| self.engine.index_stats(p))
                .collect::<Result<Vec<_>>>()?,
        })
    }

    /// Discard `provider`'s index and rebuild it from the database.
    pub async fn rebuild_index(&self, provider: Provider) -> Result<IndexStats> {
        self.ensure_open()?;
        self.engine.rebuild(provider).await
    }

    /// Compare each on-disk snapshot with the database without loading it.
    pub fn verify(&self) -> Result<Vec<RecoveryPlan>> {
        let engine = RecoveryEngine::new(&self.db, &self.config);
        Provider::ALL.into_iter().map(|p| engine.plan(p)).collect()
    }

    /// ANALYZE plus an integrity check; returns SQLite's verdict.
    pub fn maintain(&self) -> Result<String> {
        self.ensure_open()?;
        let conn = self.db.connection()?;
        run_maintenance(&conn)
    }

    pub fn insert_memory(&self, memory: &MemoryRecord) -> Result<()> {
        self.ensure_open()?;
        for provider in Provider::ALL {
            if let Some(embedding) = memory.embedding(provider) {
                self.check_dimension(provider, embedding)?;
            }
        }
        self.db.memories.insert_memory(memory)
    }

    pub fn update_memory(
        &self,
        id: &str,
        content: &str,
        memory_type: &str,
        embedding: Option<(Provider, &[f32])>,
    ) -> Result<()> {
        self.ensure_open()?;
        if let Some((provider, vector)) = embedding {
            self.check_dimension(provider, vector)?;
        }
        self.db.memories.update_memory(id, content, memory_type, embedding)
    }

    pub fn delete_memory(&self, id: &str) -> Result<bool> {
        self.ensure_open()?;
        self.db.memories.delete_memory(id)
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        self.ensure_open()?;
        self.db.memories.get_memory(id)
    }

    pub fn list_memories(&self) -> Result<Vec<MemoryRecord>> {
        self.ensure_open()?;
        self.db.memories.list_memories()
    }

    /// Exact scan over long-term memories, closest first.
    pub fn search_memories(&self, query: &[f32], top_k: usize, provider: Provider) -> Result<Vec<MemoryMatch>> {
        self.ensure_open()?;
        self.check_dimension(provider, query)?;
        self.db.memories.search_memories(provider, query, top_k)
    }

    /// Keep the `keep_latest` newest summaries; returns how many were removed.
    pub fn cleanup_old_summaries(&self, conversation_id: Option<&str>, keep_latest: usize) -> Result<usize> {
        self.ensure_open()?;
        self.db.summaries.cleanup_old_summaries(conversation_id, keep_latest)
    }
}

#[async_trait]
impl MemoryStore for SemanticMemory {
    async fn add_thought_vector(
        &self,
        conversation_id: &str,
        role: Role,
        text_content: &str,
        embedding: &[f32],
        provider: Provider,
    ) -> Result<String> {
        self.ensure_open()?;
        self.engine
            .add_vector(conversation_id, role, text_content, embedding, provider)
            .await
    }

    async fn search_similar_thoughts(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        scope: Option<SearchScope>,
    ) -> Result<Vec<ThoughtMetadata>> {
        self.ensure_open()?;
        self.engine.search(query_embedding, top_k, scope).await
    }

    async fn delete_all_thought_vectors(&self) -> Result<usize> {
        self.ensure_open()?;
        self.engine.delete_all().await
    }

    async fn get_recent_messages_for_summarization(
        &self,
        limit: usize,
        conversation_id: Option<&str>,
    ) -> Result<Vec<RawMessageRecord>> {
        self.ensure_open()?;
        self.db.thoughts.recent_raw_messages(limit, conversation_id)
    }

    async fn save_conversation_summary(
        &self,
        summary_text: &str,
        summarized_messages_count: i64,
        conversation_id: Option<&str>,
    ) -> Result<ConversationSummaryRecord> {
        self.ensure_open()?;
        self.db
            .summaries
            .save_summary(summary_text, summarized_messages_count, conversation_id)
    }

    async fn get_latest_conversation_summary(
        &self,
        conversation_id: Option<&str>,
    ) -> Result<Option<ConversationSummaryRecord>> {
        self.ensure_open()?;
        self.db.summaries.latest_summary(conversation_id)
    }

    async fn ensure_save_on_quit(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Saving semantic memory before shutdown...");

        // held until the database is closed
        let _paused = self.engine.quiesce().await;

        if let Err(e) = self.snapshots.flush().await {
            warn!("Final snapshot flush failed; indexes will be rebuilt on next start: {}", e);
        }

        let worker = self
            .worker
            .lock()
            .map_err(|_| MemoryError::LockPoisoned("snapshot worker"))?
            .take();
        if let Some(worker) = worker {
            // joins the worker thread
            tokio::task::spawn_blocking(move || drop(worker))
                .await
                .map_err(|e| MemoryError::index(format!("snapshot worker shutdown failed: {}", e)))?;
        }

        self.db.close()?;
        info!("Semantic memory closed");
        Ok(())
    }
}

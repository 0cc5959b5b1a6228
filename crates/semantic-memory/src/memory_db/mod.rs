//! Memory database module - SQLite-backed source of truth for thoughts,
//! long-term memories, conversation summaries and migration flags.
pub mod schema;
pub mod migration;
pub mod thought_store;
pub mod long_term_store;
pub mod summary_store;
pub use schema::*;
pub use migration::{MigrationManager, MigrationOutcome, MigrationReport, MigrationRunner};
pub use thought_store::ThoughtStore;
pub use long_term_store::LongTermStore;
pub use summary_store::SummaryStore;
use std::path::Path;
use std::sync::Arc;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::TransactionBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;

pub(crate) type SqlitePool = Pool<SqliteConnectionManager>;
pub(crate) type SqliteConn = PooledConnection<SqliteConnectionManager>;

/// Handle over the relational store. Every table has its own typed store;
/// all of them share one connection pool.
pub struct MemoryDatabase {
    pub thoughts: ThoughtStore,
    pub memories: LongTermStore,
    pub summaries: SummaryStore,
    pool: Arc<SqlitePool>,
}

impl MemoryDatabase {
    /// Open (or create) the database file and bring its schema up to date.
    pub fn new(db_path: &Path, pool_size: u32) -> Result<Self> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)?;

        {
            let mut conn = pool.get()?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }
        let pool = Arc::new(pool);
        info!("Memory database initialized successfully");
        Ok(Self {
            thoughts: ThoughtStore::new(Arc::clone(&pool)),
            memories: LongTermStore::new(Arc::clone(&pool)),
            summaries: SummaryStore::new(Arc::clone(&pool)),
            pool,
        })
    }

    /// A pooled connection for callers that need to hold a transaction open
    /// across several store calls.
    pub fn connection(&self) -> Result<SqliteConn> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside an IMMEDIATE transaction; commits on `Ok`, rolls back on `Err`.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let conn = self.pool.get()?;
        migration::get_database_stats(&conn)
    }

    /// Checkpoint the WAL so the database file is self-contained.
    pub fn close(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        debug!("WAL checkpoint completed");
        Ok(())
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                warn!("WAL checkpoint on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub fn open_temp() -> (TempDir, MemoryDatabase) {
        let dir = tempfile::tempdir().unwrap();
        let db = MemoryDatabase::new(&dir.path().join("memory.db"), 4).unwrap();
        (dir, db)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::open_temp;
    use super::*;

    #[test]
    fn opening_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.db");
        {
            let db = MemoryDatabase::new(&path, 2).unwrap();
            db.close().unwrap();
        }
        let db = MemoryDatabase::new(&path, 2).unwrap();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.thoughts, 0);
        assert!(stats.database_size_bytes > 0);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let (_dir, db) = open_temp();
        let result: Result<()> = db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO migration_flags (name, completed, updated_at) VALUES ('rolled_back', 1, 'now')",
                [],
            )?;
            Err(crate::error::MemoryError::invalid_input("abort"))
        });
        assert!(result.is_err());
        let conn = db.connection().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM migration_flags WHERE name = 'rolled_back'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}

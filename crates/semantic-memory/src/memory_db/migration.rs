//! Database migration system
//!
//! Two layers run at startup, in order:
//! 1. Versioned DDL tracked in `schema_version` (creates the base tables).
//! 2. Named, flag-gated data migrations tracked in `migration_flags`. Each
//!    step runs at most once; a failing step leaves its flag unset so the
//!    next start retries it, and never blocks the steps after it.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{self, format_timestamp, parse_timestamp, Provider};
use crate::memory_db::MemoryDatabase;

/// Splits the legacy single `embedding` column into per-provider columns.
pub const SPLIT_EMBEDDING_COLUMNS: &str = "split_embedding_columns";
/// Imports the legacy flat-file memory list into `long_term_memories`.
pub const IMPORT_LEGACY_MEMORIES: &str = "import_legacy_memories";

/// Manages versioned schema DDL
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Initialize database with current schema
    pub fn initialize_database(&mut self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        info!("Current database schema version: {}", current_version);

        self.apply_migrations(current_version)
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for (version, migration_sql) in get_migrations() {
            if version > current_version {
                info!("Applying schema migration {}...", version);

                let tx = self.conn.transaction()?;
                if let Err(e) = tx.execute_batch(migration_sql) {
                    error!("Failed to apply schema migration {}: {}", version, e);
                    return Err(e.into());
                }
                tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
                tx.commit()?;

                info!("Schema migration {} applied successfully", version);
            }
        }

        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?)
    }
}

/// Versioned DDL scripts
fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![(1, schema::SCHEMA_SQL)]
}

/// What happened to one named data migration during `run_all`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    AlreadyCompleted,
    Applied { rows: usize },
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub steps: Vec<(&'static str, MigrationOutcome)>,
}

impl MigrationReport {
    pub fn outcome(&self, name: &str) -> Option<&MigrationOutcome> {
        self.steps.iter().find(|(n, _)| *n == name).map(|(_, o)| o)
    }

    pub fn has_failures(&self) -> bool {
        self.steps.iter().any(|(_, o)| matches!(o, MigrationOutcome::Failed(_)))
    }
}

/// Runs the named data migrations in a fixed order
pub struct MigrationRunner<'a> {
    db: &'a MemoryDatabase,
    remote_dimension: usize,
    local_dimension: usize,
    legacy_memories_path: PathBuf,
    quarantined_memories_path: PathBuf,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(db: &'a MemoryDatabase, config: &Config) -> Self {
        Self {
            db,
            remote_dimension: config.remote_dimension,
            local_dimension: config.local_dimension,
            legacy_memories_path: config.legacy_memories_path(),
            quarantined_memories_path: config.quarantined_memories_path(),
        }
    }

    /// Fixed execution order
    pub const STEPS: [&'static str; 2] = [SPLIT_EMBEDDING_COLUMNS, IMPORT_LEGACY_MEMORIES];

    fn run_step(&self, name: &str) -> Result<usize> {
        match name {
            SPLIT_EMBEDDING_COLUMNS => self.split_embedding_columns(),
            IMPORT_LEGACY_MEMORIES => self.import_legacy_memories(),
            other => Err(MemoryError::invalid_input(format!("unknown migration: {}", other))),
        }
    }

    /// Execute every pending migration once. Only a failure to read the flag
    /// table is returned as an error; step failures land in the report.
    pub fn run_all(&self) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();

        for name in Self::STEPS {
            let completed = {
                let conn = self.db.connection()?;
                is_flag_completed(&conn, name)?
            };
            if completed {
                info!("Migration {} already completed, skipping", name);
                report.steps.push((name, MigrationOutcome::AlreadyCompleted));
                continue;
            }

            info!("Running migration {}...", name);
            let outcome = match self.run_step(name) {
                Ok(rows) => {
                    info!("Migration {} completed ({} rows)", name, rows);
                    MigrationOutcome::Applied { rows }
                }
                Err(e) => {
                    error!("Migration {} failed, will retry on next start: {}", name, e);
                    MigrationOutcome::Failed(e.to_string())
                }
            };
            report.steps.push((name, outcome));
        }

        Ok(report)
    }

    /// Adds the per-provider columns where missing and back-fills the legacy
    /// `embedding` value into `embedding_remote`. Vectors whose length is not
    /// the remote dimension are left behind. The flag commits with the data.
    fn split_embedding_columns(&self) -> Result<usize> {
        let remote_dimension = self.remote_dimension;
        self.db.with_transaction(|tx| {
            ensure_columns(
                tx,
                "thoughts",
                &[
                    ("embedding", "BLOB"),
                    ("embedding_remote", "BLOB"),
                    ("embedding_local", "BLOB"),
                    ("label_remote", "INTEGER"),
                    ("label_local", "INTEGER"),
                ],
            )?;
            ensure_columns(
                tx,
                "long_term_memories",
                &[
                    ("updated_at", "TEXT"),
                    ("embedding_remote", "BLOB"),
                    ("embedding_local", "BLOB"),
                ],
            )?;

            let mut moved = 0;
            for table in ["thoughts", "long_term_memories"] {
                if !table_columns(tx, table)?.iter().any(|c| c == "embedding") {
                    continue;
                }
                moved += backfill_remote_column(tx, table, remote_dimension)?;
            }
            for table in ["thoughts", "long_term_memories"] {
                let rewritten = normalize_created_at(tx, table)?;
                if rewritten > 0 {
                    info!("Rewrote {} legacy timestamps in {}", rewritten, table);
                }
            }

            set_flag_completed(tx, SPLIT_EMBEDDING_COLUMNS)?;
            Ok(moved)
        })
    }

    /// One-time import of the old JSON memory list. The source file is renamed
    /// once its rows are committed; the flag is set last.
    fn import_legacy_memories(&self) -> Result<usize> {
        let source = &self.legacy_memories_path;
        if !source.exists() {
            let conn = self.db.connection()?;
            set_flag_completed(&conn, IMPORT_LEGACY_MEMORIES)?;
            return Ok(0);
        }

        let raw = std::fs::read_to_string(source)?;
        let entries = parse_legacy_memories(&raw)?;
        let now = chrono::Utc::now();

        let imported = self.db.with_transaction(|tx| {
            let mut imported = 0;
            for (position, entry) in entries.iter().enumerate() {
                let (id, content, memory_type, created_at, embedding) = entry.normalize(position);
                if content.trim().is_empty() {
                    warn!("Skipping legacy memory {} with empty content", id);
                    continue;
                }
                let created_at = created_at
                    .as_deref()
                    .and_then(parse_timestamp)
                    .unwrap_or(now);
                let (remote, local) = self.route_embedding(&id, embedding)?;

                imported += tx.execute(
                    "INSERT INTO long_term_memories
                     (id, content, memory_type, created_at, embedding_remote, embedding_local)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO NOTHING",
                    params![id, content, memory_type, format_timestamp(&created_at), remote, local],
                )?;
            }
            Ok(imported)
        })?;

        std::fs::rename(source, &self.quarantined_memories_path)?;
        info!(
            "Quarantined legacy memory file to {}",
            self.quarantined_memories_path.display()
        );

        let conn = self.db.connection()?;
        set_flag_completed(&conn, IMPORT_LEGACY_MEMORIES)?;
        Ok(imported)
    }

    /// Legacy entries carry at most one vector; file it under whichever
    /// provider its length matches.
    fn route_embedding(
        &self,
        id: &str,
        embedding: Option<&[f32]>,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        let Some(vector) = embedding else {
            return Ok((None, None));
        };
        if vector.len() == self.remote_dimension {
            Ok((Some(schema::encode_embedding(vector)?), None))
        } else if vector.len() == self.local_dimension {
            Ok((None, Some(schema::encode_embedding(vector)?)))
        } else {
            warn!(
                "Dropping legacy embedding for {}: dimension {} matches no provider",
                id,
                vector.len()
            );
            Ok((None, None))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyMemory {
    Text(String),
    Entry {
        #[serde(default)]
        id: Option<String>,
        #[serde(alias = "text")]
        content: String,
        #[serde(default, alias = "type", alias = "memoryType")]
        memory_type: Option<String>,
        #[serde(default, alias = "createdAt", alias = "timestamp")]
        created_at: Option<String>,
        #[serde(default)]
        embedding: Option<Vec<f32>>,
    },
}

impl LegacyMemory {
    /// Entries without an id get a positional one so a retried import
    /// lands on the same rows.
    fn normalize(&self, position: usize) -> (String, &str, &str, Option<String>, Option<&[f32]>) {
        let fallback_id = || format!("legacy-{}", position);
        match self {
            LegacyMemory::Text(text) => (fallback_id(), text.as_str(), "fact", None, None),
            LegacyMemory::Entry { id, content, memory_type, created_at, embedding } => (
                id.clone().filter(|s| !s.is_empty()).unwrap_or_else(fallback_id),
                content.as_str(),
                memory_type.as_deref().unwrap_or("fact"),
                created_at.clone(),
                embedding.as_deref(),
            ),
        }
    }
}

/// The legacy file is either a bare array or `{ "memories": [...] }`.
fn parse_legacy_memories(raw: &str) -> Result<Vec<LegacyMemory>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum LegacyFile {
        List(Vec<LegacyMemory>),
        Wrapped { memories: Vec<LegacyMemory> },
    }

    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<LegacyFile>(raw)? {
        LegacyFile::List(entries) => Ok(entries),
        LegacyFile::Wrapped { memories } => Ok(memories),
    }
}

fn backfill_remote_column(conn: &Connection, table: &str, remote_dimension: usize) -> Result<usize> {
    let pending: Vec<(i64, Vec<u8>)> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT rowid, embedding FROM {} WHERE embedding IS NOT NULL AND embedding_remote IS NULL",
            table
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut moved = 0;
    for (rowid, blob) in pending {
        match schema::decode_embedding(&blob) {
            Ok(vector) if vector.len() == remote_dimension => {
                conn.execute(
                    &format!("UPDATE {} SET embedding_remote = ?1 WHERE rowid = ?2", table),
                    params![blob, rowid],
                )?;
                moved += 1;
            }
            Ok(vector) => warn!(
                "Not back-filling {} row {}: legacy vector has {} dimensions, remote expects {}",
                table,
                rowid,
                vector.len(),
                remote_dimension
            ),
            Err(e) => warn!("Not back-filling {} row {}: undecodable embedding ({})", table, rowid, e),
        }
    }
    Ok(moved)
}

/// Rewrite `created_at` values into the canonical RFC 3339 form so text
/// ordering matches time ordering. Unparseable values are left alone.
fn normalize_created_at(conn: &Connection, table: &str) -> Result<usize> {
    let rows: Vec<(i64, String)> = {
        let mut stmt = conn.prepare(&format!("SELECT rowid, created_at FROM {}", table))?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut rewritten = 0;
    for (rowid, raw) in rows {
        let Some(parsed) = parse_timestamp(&raw) else {
            warn!("Leaving {} row {} with unreadable created_at {:?}", table, rowid, raw);
            continue;
        };
        let canonical = format_timestamp(&parsed);
        if canonical != raw {
            conn.execute(
                &format!("UPDATE {} SET created_at = ?1 WHERE rowid = ?2", table),
                params![canonical, rowid],
            )?;
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn ensure_columns(conn: &Connection, table: &str, columns: &[(&str, &str)]) -> Result<()> {
    let existing = table_columns(conn, table)?;
    if existing.is_empty() {
        return Err(MemoryError::invalid_input(format!("table {} does not exist", table)));
    }
    for (name, sql_type) in columns {
        if !existing.iter().any(|c| c == name) {
            info!("Adding column {}.{}", table, name);
            conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, name, sql_type))?;
        }
    }
    Ok(())
}

pub fn is_flag_completed(conn: &Connection, name: &str) -> Result<bool> {
    let completed: Option<bool> = conn
        .query_row(
            "SELECT completed FROM migration_flags WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(completed.unwrap_or(false))
}

pub fn set_flag_completed(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO migration_flags (name, completed, updated_at) VALUES (?1, 1, ?2)
         ON CONFLICT(name) DO UPDATE SET completed = 1, updated_at = excluded.updated_at",
        params![name, format_timestamp(&chrono::Utc::now())],
    )?;
    Ok(())
}

/// Row counts and file size
pub fn get_database_stats(conn: &Connection) -> Result<schema::DatabaseStats> {
    fn count(conn: &Connection, sql: &str) -> Result<i64> {
        Ok(conn.query_row(sql, [], |row| row.get(0))?)
    }

    let provider_count = |provider: Provider| {
        count(
            conn,
            &format!(
                "SELECT COUNT(*) FROM thoughts WHERE {} IS NOT NULL",
                provider.embedding_column()
            ),
        )
    };

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(schema::DatabaseStats {
        thoughts: count(conn, "SELECT COUNT(*) FROM thoughts")?,
        thoughts_remote: provider_count(Provider::Remote)?,
        thoughts_local: provider_count(Provider::Local)?,
        long_term_memories: count(conn, "SELECT COUNT(*) FROM long_term_memories")?,
        summaries: count(conn, "SELECT COUNT(*) FROM conversation_summaries")?,
        completed_migrations: count(conn, "SELECT COUNT(*) FROM migration_flags WHERE completed = 1")?,
        database_size_bytes,
    })
}

/// ANALYZE plus an integrity check; returns the integrity verdict.
pub fn run_maintenance(conn: &Connection) -> Result<String> {
    info!("Running database maintenance...");
    conn.execute_batch("ANALYZE")?;
    let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    info!("Database maintenance completed: {}", verdict);
    Ok(verdict)
}

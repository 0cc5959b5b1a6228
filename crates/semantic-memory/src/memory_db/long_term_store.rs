//! Long-term memory storage.
//!
//! Memories are few and edited in place, so they are not indexed; similarity
//! queries scan the stored vectors linearly.
use crate::error::{MemoryError, Result};
use crate::memory_db::schema::*;
use crate::memory_db::{SqliteConn, SqlitePool};
use crate::vector_index::cosine_distance;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use tracing::debug;

pub struct LongTermStore {
    pool: Arc<SqlitePool>,
}

type MemoryColumns = (String, String, String, String, Option<Vec<u8>>, Option<Vec<u8>>);

const SELECT_MEMORY: &str = "SELECT id, content, memory_type, created_at, embedding_remote, embedding_local
                             FROM long_term_memories";

impl LongTermStore {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<SqliteConn> {
        Ok(self.pool.get()?)
    }

    pub fn insert_memory(&self, memory: &MemoryRecord) -> Result<()> {
        if memory.content.trim().is_empty() {
            return Err(MemoryError::invalid_input("memory content must not be empty"));
        }
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO long_term_memories
             (id, content, memory_type, created_at, updated_at, embedding_remote, embedding_local)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6)",
            params![
                memory.id,
                memory.content,
                memory.memory_type,
                format_timestamp(&memory.created_at),
                memory.embedding_remote.as_deref().map(encode_embedding).transpose()?,
                memory.embedding_local.as_deref().map(encode_embedding).transpose()?,
            ],
        )?;
        debug!("Inserted long-term memory {}", memory.id);
        Ok(())
    }

    /// Rewrites content and type; when `embedding` is given, replaces that
    /// provider's vector and leaves the other untouched.
    pub fn update_memory(
        &self,
        id: &str,
        content: &str,
        memory_type: &str,
        embedding: Option<(Provider, &[f32])>,
    ) -> Result<()> {
        if content.trim().is_empty() {
            return Err(MemoryError::invalid_input("memory content must not be empty"));
        }
        let conn = self.get_conn()?;
        let now = format_timestamp(&Utc::now());
        let updated = match embedding {
            Some((provider, vector)) => conn.execute(
                &format!(
                    "UPDATE long_term_memories
                     SET content = ?1, memory_type = ?2, updated_at = ?3, {} = ?4
                     WHERE id = ?5",
                    provider.embedding_column()
                ),
                params![content, memory_type, now, encode_embedding(vector)?, id],
            )?,
            None => conn.execute(
                "UPDATE long_term_memories
                 SET content = ?1, memory_type = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![content, memory_type, now, id],
            )?,
        };
        if updated == 0 {
            return Err(MemoryError::not_found(format!("memory {}", id)));
        }
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete_memory(&self, id: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM long_term_memories WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let conn = self.get_conn()?;
        conn.query_row(&format!("{} WHERE id = ?1", SELECT_MEMORY), [id], memory_columns)
            .optional()?
            .map(into_memory)
            .transpose()
    }

    /// All memories, oldest first
    pub fn list_memories(&self) -> Result<Vec<MemoryRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY created_at ASC, rowid ASC", SELECT_MEMORY))?;
        let rows = stmt
            .query_map([], memory_columns)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(into_memory).collect()
    }

    /// Exact nearest memories for `query` in `provider` space, closest first.
    /// Stored vectors of another length are ignored.
    pub fn search_memories(&self, provider: Provider, query: &[f32], top_k: usize) -> Result<Vec<MemoryMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let mut matches: Vec<MemoryMatch> = self
            .list_memories()?
            .into_iter()
            .filter_map(|memory| {
                let distance = match memory.embedding(provider) {
                    Some(vector) if vector.len() == query.len() => cosine_distance(query, vector),
                    _ => return None,
                };
                Some(MemoryMatch { memory, distance })
            })
            .collect();

        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        matches.truncate(top_k);
        Ok(matches)
    }
}

fn memory_columns(row: &Row<'_>) -> rusqlite::Result<MemoryColumns> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn into_memory((id, content, memory_type, created_at, remote, local): MemoryColumns) -> Result<MemoryRecord> {
    Ok(MemoryRecord {
        id,
        content,
        memory_type,
        created_at: timestamp_from_column(&created_at, "long_term_memories.created_at")?,
        embedding_remote: decode_optional(remote)?,
        embedding_local: decode_optional(local)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::error::MemoryError;
    use crate::memory_db::test_support::open_temp;
    use crate::memory_db::*;

    #[test]
    fn insert_update_delete_cycle() {
        let (_dir, db) = open_temp();
        let memory = MemoryRecord::new("likes green tea", "preference")
            .with_embedding(Provider::Local, vec![1.0, 0.0]);
        db.memories.insert_memory(&memory).unwrap();

        db.memories
            .update_memory(&memory.id, "likes oolong", "preference", Some((Provider::Remote, &[0.0_f32, 1.0, 0.0][..])))
            .unwrap();
        let stored = db.memories.get_memory(&memory.id).unwrap().unwrap();
        assert_eq!(stored.content, "likes oolong");
        assert_eq!(stored.embedding_local, Some(vec![1.0, 0.0]));
        assert_eq!(stored.embedding_remote, Some(vec![0.0, 1.0, 0.0]));

        assert!(db.memories.delete_memory(&memory.id).unwrap());
        assert!(!db.memories.delete_memory(&memory.id).unwrap());
        assert!(db.memories.get_memory(&memory.id).unwrap().is_none());
    }

    #[test]
    fn update_of_missing_memory_is_not_found() {
        let (_dir, db) = open_temp();
        let err = db.memories.update_memory("nope", "x", "fact", None).unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[test]
    fn empty_content_is_rejected() {
        let (_dir, db) = open_temp();
        let err = db.memories.insert_memory(&MemoryRecord::new("  ", "fact")).unwrap_err();
        assert!(err.is_validation());
        assert!(db.memories.list_memories().unwrap().is_empty());
    }

    #[test]
    fn search_memories_ranks_by_cosine_distance() {
        let (_dir, db) = open_temp();
        let near = MemoryRecord::new("near", "fact").with_embedding(Provider::Local, vec![1.0, 0.1]);
        let far = MemoryRecord::new("far", "fact").with_embedding(Provider::Local, vec![-1.0, 0.0]);
        let unembedded = MemoryRecord::new("plain", "fact");
        for m in [&far, &near, &unembedded] {
            db.memories.insert_memory(m).unwrap();
        }

        let hits = db.memories.search_memories(Provider::Local, &[1.0, 0.0], 5).unwrap();
        let contents: Vec<&str> = hits.iter().map(|h| h.memory.content.as_str()).collect();
        assert_eq!(contents, vec!["near", "far"]);
        assert!(hits[0].distance < 0.01);
        assert!((hits[1].distance - 2.0).abs() < 1e-5);

        assert_eq!(db.memories.search_memories(Provider::Local, &[1.0, 0.0], 1).unwrap().len(), 1);
    }
}

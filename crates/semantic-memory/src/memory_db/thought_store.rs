//! Thought storage operations
use crate::error::Result;
use crate::memory_db::schema::*;
use crate::memory_db::{SqliteConn, SqlitePool};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, warn};

/// Byte length of a bincode-encoded `Vec<f32>` of `dimension` elements
fn encoded_len(dimension: usize) -> i64 {
    (8 + 4 * dimension) as i64
}

pub struct ThoughtStore {
    pool: Arc<SqlitePool>,
}

impl ThoughtStore {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<SqliteConn> {
        Ok(self.pool.get()?)
    }

    /// Upsert `record` and its `provider` embedding together with the label
    /// the index will hold for it. An existing row keeps its other
    /// provider's data. The remote vector is mirrored into the legacy
    /// `embedding` column for older readers.
    pub fn upsert_with_tx(
        &self,
        conn: &Connection,
        record: &ThoughtRecord,
        provider: Provider,
        label: u32,
    ) -> Result<()> {
        let blob = record.embedding(provider).map(encode_embedding).transpose()?;
        let legacy_blob = match provider {
            Provider::Remote => blob.clone(),
            Provider::Local => None,
        };

        conn.execute(
            &format!(
                "INSERT INTO thoughts
                 (id, conversation_id, role, text_content, created_at, embedding, {emb}, {lbl})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    text_content = excluded.text_content,
                    created_at = excluded.created_at,
                    embedding = COALESCE(excluded.embedding, thoughts.embedding),
                    {emb} = excluded.{emb},
                    {lbl} = excluded.{lbl}",
                emb = provider.embedding_column(),
                lbl = provider.label_column(),
            ),
            params![
                record.id,
                record.conversation_id,
                record.role.as_str(),
                record.text_content,
                format_timestamp(&record.created_at),
                legacy_blob,
                blob,
                label as i64,
            ],
        )?;
        debug!("Upserted thought {} ({} label {})", record.id, provider, label);
        Ok(())
    }

    pub fn get_thought(&self, id: &str) -> Result<Option<ThoughtRecord>> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(
                "SELECT id, conversation_id, role, text_content, created_at,
                        embedding_remote, embedding_local
                 FROM thoughts WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<Vec<u8>>>(5)?,
                        row.get::<_, Option<Vec<u8>>>(6)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, conversation_id, role, text_content, created_at, remote, local)| {
            Ok(ThoughtRecord {
                id,
                conversation_id,
                role: role.parse()?,
                text_content,
                created_at: timestamp_from_column(&created_at, "thoughts.created_at")?,
                embedding_remote: decode_optional(remote)?,
                embedding_local: decode_optional(local)?,
            })
        })
        .transpose()
    }

    /// Metadata for `ids`, oldest first. Unknown ids are skipped.
    pub fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<ThoughtMetadata>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT id, conversation_id, role, text_content, created_at
             FROM thoughts WHERE id IN ({})
             ORDER BY created_at ASC, rowid ASC",
            placeholders
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), raw_columns)?;

        let mut out = Vec::with_capacity(ids.len());
        for row in rows {
            let msg = into_raw_message(row?)?;
            out.push(ThoughtMetadata {
                id: msg.id,
                conversation_id: msg.conversation_id,
                role: msg.role,
                text_content: msg.text_content,
                created_at: msg.created_at,
                distance: None,
            });
        }
        Ok(out)
    }

    /// Rows carrying any `provider` embedding
    pub fn count_with_embedding(&self, provider: Provider) -> Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM thoughts WHERE {} IS NOT NULL",
                provider.embedding_column()
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Rows whose `provider` embedding has exactly `dimension` elements.
    /// This is the authoritative point count for the provider's index.
    pub fn count_indexable(&self, provider: Provider, dimension: usize) -> Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM thoughts WHERE length({col}) = ?1",
                col = provider.embedding_column()
            ),
            [encoded_len(dimension)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Every indexable `(id, vector)` for `provider`, ordered by id.
    /// Rows with a vector of another length are logged and left out.
    pub fn indexable_embeddings(
        &self,
        provider: Provider,
        dimension: usize,
    ) -> Result<Vec<(String, Vec<f32>)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, {col} FROM thoughts WHERE {col} IS NOT NULL ORDER BY id ASC",
            col = provider.embedding_column()
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, blob) = row?;
            match decode_embedding(&blob) {
                Ok(vector) if vector.len() == dimension => out.push((id, vector)),
                Ok(vector) => warn!(
                    "Skipping thought {}: {} embedding has {} dimensions, expected {}",
                    id,
                    provider,
                    vector.len(),
                    dimension
                ),
                Err(e) => warn!("Skipping thought {}: undecodable {} embedding ({})", id, provider, e),
            }
        }
        Ok(out)
    }

    /// Persisted `(id, label)` pairs for indexable rows, in id order.
    pub fn load_labels(&self, provider: Provider, dimension: usize) -> Result<Vec<(String, Option<i64>)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, {lbl} FROM thoughts WHERE length({emb}) = ?1 ORDER BY id ASC",
            lbl = provider.label_column(),
            emb = provider.embedding_column()
        ))?;
        let rows = stmt
            .query_map([encoded_len(dimension)], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Replace every `provider` label with `assignments`; rows not listed
    /// end up with no label.
    pub fn reassign_labels(&self, provider: Provider, assignments: &[(String, u32)]) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute(
            &format!("UPDATE thoughts SET {} = NULL", provider.label_column()),
            [],
        )?;
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE thoughts SET {} = ?1 WHERE id = ?2",
                provider.label_column()
            ))?;
            for (id, label) in assignments {
                stmt.execute(params![*label as i64, id])?;
            }
        }
        tx.commit()?;
        debug!("Reassigned {} {} labels", assignments.len(), provider);
        Ok(())
    }

    pub fn delete_all_with_tx(&self, conn: &Connection) -> Result<usize> {
        Ok(conn.execute("DELETE FROM thoughts", [])?)
    }

    /// The `limit` newest thoughts, returned oldest first. `None` spans
    /// every conversation.
    pub fn recent_raw_messages(
        &self,
        limit: usize,
        conversation_id: Option<&str>,
    ) -> Result<Vec<RawMessageRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let mut messages = match conversation_id {
            Some(conversation_id) => {
                let mut stmt = conn.prepare(
                    "SELECT id, conversation_id, role, text_content, created_at
                     FROM thoughts WHERE conversation_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![conversation_id, limit as i64], raw_columns)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, conversation_id, role, text_content, created_at
                     FROM thoughts ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit as i64], raw_columns)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        }
        .into_iter()
        .map(into_raw_message)
        .collect::<Result<Vec<_>>>()?;

        messages.reverse();
        Ok(messages)
    }
}

type RawColumns = (String, String, String, String, String);

fn raw_columns(row: &Row<'_>) -> rusqlite::Result<RawColumns> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_raw_message(
    (id, conversation_id, role, text_content, created_at): RawColumns,
) -> Result<RawMessageRecord> {
    Ok(RawMessageRecord {
        id,
        conversation_id,
        role: role.parse()?,
        text_content,
        created_at: timestamp_from_column(&created_at, "thoughts.created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use crate::memory_db::test_support::open_temp;
    use crate::memory_db::*;
    use chrono::{Duration, TimeZone, Utc};

    fn thought(id: &str, conversation: &str, minute: i64) -> ThoughtRecord {
        ThoughtRecord {
            id: id.to_string(),
            conversation_id: conversation.to_string(),
            role: Role::User,
            text_content: format!("text of {}", id),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minute),
            embedding_remote: None,
            embedding_local: None,
        }
    }

    fn insert(db: &MemoryDatabase, record: &ThoughtRecord, provider: Provider, label: u32) {
        db.with_transaction(|tx| db.thoughts.upsert_with_tx(tx, record, provider, label))
            .unwrap();
    }

    #[test]
    fn upsert_updates_existing_row_per_provider() {
        let (_dir, db) = open_temp();
        let mut record = thought("t1", "c1", 0);
        record.embedding_local = Some(vec![1.0, 0.0]);
        insert(&db, &record, Provider::Local, 0);

        record.text_content = "edited".to_string();
        record.embedding_local = None;
        record.embedding_remote = Some(vec![0.5, 0.5, 0.0]);
        insert(&db, &record, Provider::Remote, 3);

        let stored = db.thoughts.get_thought("t1").unwrap().unwrap();
        assert_eq!(stored.text_content, "edited");
        assert_eq!(stored.embedding_local, Some(vec![1.0, 0.0]));
        assert_eq!(stored.embedding_remote, Some(vec![0.5, 0.5, 0.0]));
        assert_eq!(db.thoughts.count_with_embedding(Provider::Local).unwrap(), 1);
        assert_eq!(db.thoughts.count_with_embedding(Provider::Remote).unwrap(), 1);
        assert_eq!(
            db.thoughts.load_labels(Provider::Remote, 3).unwrap(),
            vec![("t1".to_string(), Some(3))]
        );
    }

    #[test]
    fn fetch_by_ids_orders_chronologically() {
        let (_dir, db) = open_temp();
        for (id, minute) in [("b", 2), ("a", 5), ("c", 1)] {
            let mut record = thought(id, "c1", minute);
            record.embedding_local = Some(vec![1.0, 0.0]);
            insert(&db, &record, Provider::Local, 0);
        }
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string(), "missing".to_string()];
        let found: Vec<String> = db
            .thoughts
            .fetch_by_ids(&ids)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(found, vec!["c", "b", "a"]);
        assert!(db.thoughts.fetch_by_ids(&[]).unwrap().is_empty());
    }

    #[test]
    fn indexable_rows_exclude_wrong_lengths() {
        let (_dir, db) = open_temp();
        let mut good = thought("good", "c1", 0);
        good.embedding_local = Some(vec![0.0, 1.0]);
        insert(&db, &good, Provider::Local, 0);
        let mut bad = thought("bad", "c1", 1);
        bad.embedding_local = Some(vec![0.0, 1.0, 2.0]);
        insert(&db, &bad, Provider::Local, 1);

        assert_eq!(db.thoughts.count_with_embedding(Provider::Local).unwrap(), 2);
        assert_eq!(db.thoughts.count_indexable(Provider::Local, 2).unwrap(), 1);
        let rows = db.thoughts.indexable_embeddings(Provider::Local, 2).unwrap();
        assert_eq!(rows, vec![("good".to_string(), vec![0.0, 1.0])]);
    }

    #[test]
    fn reassign_labels_clears_unlisted_rows() {
        let (_dir, db) = open_temp();
        for (label, id) in ["x", "y"].iter().enumerate() {
            let mut record = thought(id, "c1", label as i64);
            record.embedding_local = Some(vec![1.0, 1.0]);
            insert(&db, &record, Provider::Local, label as u32 + 7);
        }
        db.thoughts
            .reassign_labels(Provider::Local, &[("y".to_string(), 0)])
            .unwrap();
        assert_eq!(
            db.thoughts.load_labels(Provider::Local, 2).unwrap(),
            vec![("x".to_string(), None), ("y".to_string(), Some(0))]
        );
    }

    #[test]
    fn recent_raw_messages_are_latest_in_ascending_order() {
        let (_dir, db) = open_temp();
        for (id, conversation, minute) in [("m1", "a", 0), ("m2", "b", 1), ("m3", "a", 2), ("m4", "a", 3)] {
            insert(&db, &thought(id, conversation, minute), Provider::Remote, 0);
        }

        let ids = |msgs: Vec<RawMessageRecord>| msgs.into_iter().map(|m| m.id).collect::<Vec<_>>();
        assert_eq!(ids(db.thoughts.recent_raw_messages(2, None).unwrap()), vec!["m3", "m4"]);
        assert_eq!(ids(db.thoughts.recent_raw_messages(10, Some("a")).unwrap()), vec!["m1", "m3", "m4"]);
        assert!(db.thoughts.recent_raw_messages(0, None).unwrap().is_empty());
    }

    #[test]
    fn delete_all_removes_every_thought() {
        let (_dir, db) = open_temp();
        insert(&db, &thought("gone", "c1", 0), Provider::Remote, 0);
        let removed = db.with_transaction(|tx| db.thoughts.delete_all_with_tx(tx)).unwrap();
        assert_eq!(removed, 1);
        assert!(db.thoughts.get_thought("gone").unwrap().is_none());
    }
}

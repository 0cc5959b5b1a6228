//! Conversation summary storage
use crate::error::{MemoryError, Result};
use crate::memory_db::schema::*;
use crate::memory_db::{SqliteConn, SqlitePool};
use chrono::{SubsecRound, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, info};

pub struct SummaryStore {
    pool: Arc<SqlitePool>,
}

type SummaryColumns = (String, String, i64, Option<String>, String);

impl SummaryStore {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<SqliteConn> {
        Ok(self.pool.get()?)
    }

    /// Persist a new summary and return it with its generated id.
    pub fn save_summary(
        &self,
        summary_text: &str,
        summarized_messages_count: i64,
        conversation_id: Option<&str>,
    ) -> Result<ConversationSummaryRecord> {
        if summary_text.trim().is_empty() {
            return Err(MemoryError::invalid_input("summary text must not be empty"));
        }
        if summarized_messages_count < 0 {
            return Err(MemoryError::invalid_input("summarized message count must not be negative"));
        }

        let record = ConversationSummaryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            summary_text: summary_text.to_string(),
            summarized_messages_count,
            conversation_id: conversation_id.map(str::to_string),
            created_at: Utc::now().trunc_subsecs(6),
        };

        let conn = self.get_conn()?;
        debug!(
            "Storing summary {} covering {} messages (conversation: {:?})",
            record.id, record.summarized_messages_count, record.conversation_id
        );
        conn.execute(
            "INSERT INTO conversation_summaries
             (id, summary_text, summarized_messages_count, conversation_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.summary_text,
                record.summarized_messages_count,
                record.conversation_id,
                format_timestamp(&record.created_at),
            ],
        )?;
        Ok(record)
    }

    /// Newest summary, scoped to a conversation when one is given.
    pub fn latest_summary(&self, conversation_id: Option<&str>) -> Result<Option<ConversationSummaryRecord>> {
        let conn = self.get_conn()?;
        let row = match conversation_id {
            Some(conversation_id) => conn
                .query_row(
                    "SELECT id, summary_text, summarized_messages_count, conversation_id, created_at
                     FROM conversation_summaries WHERE conversation_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    [conversation_id],
                    summary_columns,
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT id, summary_text, summarized_messages_count, conversation_id, created_at
                     FROM conversation_summaries
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    [],
                    summary_columns,
                )
                .optional()?,
        };
        row.map(into_summary).transpose()
    }

    /// Keep only the newest `keep_latest` summaries (per conversation when
    /// scoped, across all rows otherwise). Returns the number removed.
    pub fn cleanup_old_summaries(&self, conversation_id: Option<&str>, keep_latest: usize) -> Result<usize> {
        let conn = self.get_conn()?;
        let deleted = match conversation_id {
            Some(conversation_id) => conn.execute(
                "DELETE FROM conversation_summaries
                 WHERE conversation_id = ?1 AND rowid NOT IN (
                    SELECT rowid FROM conversation_summaries WHERE conversation_id = ?1
                    ORDER BY created_at DESC, rowid DESC LIMIT ?2
                 )",
                params![conversation_id, keep_latest as i64],
            )?,
            None => conn.execute(
                "DELETE FROM conversation_summaries
                 WHERE rowid NOT IN (
                    SELECT rowid FROM conversation_summaries
                    ORDER BY created_at DESC, rowid DESC LIMIT ?1
                 )",
                [keep_latest as i64],
            )?,
        };
        if deleted > 0 {
            info!("Cleaned up {} old summaries", deleted);
        }
        Ok(deleted)
    }
}

fn summary_columns(row: &Row<'_>) -> rusqlite::Result<SummaryColumns> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_summary(
    (id, summary_text, summarized_messages_count, conversation_id, created_at): SummaryColumns,
) -> Result<ConversationSummaryRecord> {
    Ok(ConversationSummaryRecord {
        id,
        summary_text,
        summarized_messages_count,
        conversation_id,
        created_at: timestamp_from_column(&created_at, "conversation_summaries.created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use crate::memory_db::test_support::open_temp;

    #[test]
    fn latest_summary_respects_scope() {
        let (_dir, db) = open_temp();
        assert!(db.summaries.latest_summary(None).unwrap().is_none());

        db.summaries.save_summary("first in a", 4, Some("a")).unwrap();
        db.summaries.save_summary("only in b", 2, Some("b")).unwrap();
        let newest_a = db.summaries.save_summary("second in a", 6, Some("a")).unwrap();
        let unscoped = db.summaries.save_summary("global", 1, None).unwrap();

        let latest_a = db.summaries.latest_summary(Some("a")).unwrap().unwrap();
        assert_eq!(latest_a, newest_a);
        assert_eq!(db.summaries.latest_summary(None).unwrap().unwrap().id, unscoped.id);
        assert!(db.summaries.latest_summary(Some("zzz")).unwrap().is_none());
    }

    #[test]
    fn invalid_summaries_are_rejected() {
        let (_dir, db) = open_temp();
        assert!(db.summaries.save_summary("", 1, None).unwrap_err().is_validation());
        assert!(db.summaries.save_summary("ok", -1, None).unwrap_err().is_validation());
    }

    #[test]
    fn cleanup_keeps_newest() {
        let (_dir, db) = open_temp();
        for i in 0..5 {
            db.summaries.save_summary(&format!("a{}", i), i, Some("a")).unwrap();
        }
        db.summaries.save_summary("b0", 1, Some("b")).unwrap();

        assert_eq!(db.summaries.cleanup_old_summaries(Some("a"), 2).unwrap(), 3);
        assert_eq!(
            db.summaries.latest_summary(Some("a")).unwrap().unwrap().summary_text,
            "a4"
        );
        assert_eq!(db.get_stats().unwrap().summaries, 3);

        assert_eq!(db.summaries.cleanup_old_summaries(None, 1).unwrap(), 2);
        assert_eq!(db.get_stats().unwrap().summaries, 1);
    }
}

//! Database schema definitions and typed records for the memory store
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{MemoryError, Result};

/// One of the two fixed-dimension embedding spaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Hosted embedding model (1536 dimensions by default)
    #[default]
    Remote,
    /// On-device embedding model (1024 dimensions by default)
    Local,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Remote, Provider::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Remote => "remote",
            Provider::Local => "local",
        }
    }

    /// Column holding this provider's embedding blob
    pub(crate) fn embedding_column(&self) -> &'static str {
        match self {
            Provider::Remote => "embedding_remote",
            Provider::Local => "embedding_local",
        }
    }

    /// Column holding this provider's index label
    pub(crate) fn label_column(&self) -> &'static str {
        match self {
            Provider::Remote => "label_remote",
            Provider::Local => "label_local",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" => Ok(Provider::Remote),
            "local" => Ok(Provider::Local),
            other => Err(MemoryError::invalid_input(format!("unknown provider: {}", other))),
        }
    }
}

/// Which index(es) a similarity search runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Single(Provider),
    Both,
}

impl From<Provider> for SearchScope {
    fn from(provider: Provider) -> Self {
        SearchScope::Single(provider)
    }
}

impl FromStr for SearchScope {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("both") {
            return Ok(SearchScope::Both);
        }
        s.parse::<Provider>().map(SearchScope::Single)
    }
}

/// Speaker of a conversational utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(MemoryError::invalid_input(format!("unknown role: {}", other))),
        }
    }
}

/// A single conversational utterance with up to one embedding per provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub text_content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_remote: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_local: Option<Vec<f32>>,
}

impl ThoughtRecord {
    pub fn embedding(&self, provider: Provider) -> Option<&[f32]> {
        match provider {
            Provider::Remote => self.embedding_remote.as_deref(),
            Provider::Local => self.embedding_local.as_deref(),
        }
    }
}

/// Thought metadata returned to callers; embeddings are never hydrated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtMetadata {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub text_content: String,
    pub created_at: DateTime<Utc>,
    /// Cosine distance to the query when produced by a similarity search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

/// A raw conversational message handed to the summarizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub text_content: String,
    pub created_at: DateTime<Utc>,
}

/// A long-lived fact, stored apart from conversational thoughts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    pub memory_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_remote: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_local: Option<Vec<f32>>,
}

impl MemoryRecord {
    pub fn new(content: impl Into<String>, memory_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            memory_type: memory_type.into(),
            created_at: Utc::now(),
            embedding_remote: None,
            embedding_local: None,
        }
    }

    pub fn with_embedding(mut self, provider: Provider, embedding: Vec<f32>) -> Self {
        match provider {
            Provider::Remote => self.embedding_remote = Some(embedding),
            Provider::Local => self.embedding_local = Some(embedding),
        }
        self
    }

    pub fn embedding(&self, provider: Provider) -> Option<&[f32]> {
        match provider {
            Provider::Remote => self.embedding_remote.as_deref(),
            Provider::Local => self.embedding_local.as_deref(),
        }
    }
}

/// A long-term memory ranked against a query vector
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryMatch {
    pub memory: MemoryRecord,
    pub distance: f32,
}

/// Rolling compression of recent turns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummaryRecord {
    pub id: String,
    pub summary_text: String,
    pub summarized_messages_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub thoughts: i64,
    pub thoughts_remote: i64,
    pub thoughts_local: i64,
    pub long_term_memories: i64,
    pub summaries: i64,
    pub completed_migrations: i64,
    pub database_size_bytes: i64,
}

/// Fixed-width UTC timestamps so text ordering in SQLite is chronological.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339 plus the bare `YYYY-MM-DD HH:MM:SS` form older rows use.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

pub(crate) fn timestamp_from_column(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(raw).ok_or_else(|| {
        MemoryError::Serialization(format!("unparseable timestamp in {}: {:?}", column, raw))
    })
}

pub fn encode_embedding(embedding: &[f32]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(embedding)?)
}

pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    Ok(bincode::deserialize(bytes)?)
}

pub(crate) fn decode_optional(bytes: Option<Vec<u8>>) -> Result<Option<Vec<f32>>> {
    bytes.map(|b| decode_embedding(&b)).transpose()
}

/// Base tables. The per-provider columns are listed here for fresh
/// databases; older files gain them through the split-embedding migration.
pub const SCHEMA_SQL: &str = "
-- Conversational utterances
CREATE TABLE IF NOT EXISTS thoughts (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    text_content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    embedding BLOB,
    embedding_remote BLOB,
    embedding_local BLOB,
    label_remote INTEGER,
    label_local INTEGER
);
-- Long-lived facts
CREATE TABLE IF NOT EXISTS long_term_memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    memory_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT,
    embedding_remote BLOB,
    embedding_local BLOB
);
-- Rolling conversation summaries
CREATE TABLE IF NOT EXISTS conversation_summaries (
    id TEXT PRIMARY KEY,
    summary_text TEXT NOT NULL,
    summarized_messages_count INTEGER NOT NULL,
    conversation_id TEXT,
    created_at TEXT NOT NULL
);
-- One-time data migrations
CREATE TABLE IF NOT EXISTS migration_flags (
    name TEXT PRIMARY KEY,
    completed INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_thoughts_conversation ON thoughts (conversation_id);
CREATE INDEX IF NOT EXISTS idx_thoughts_created ON thoughts (created_at);
CREATE INDEX IF NOT EXISTS idx_summaries_conversation ON conversation_summaries (conversation_id, created_at);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_and_scope_parse() {
        assert_eq!("remote".parse::<Provider>().unwrap(), Provider::Remote);
        assert_eq!(" Local ".parse::<Provider>().unwrap(), Provider::Local);
        assert_eq!("both".parse::<SearchScope>().unwrap(), SearchScope::Both);
        assert_eq!(
            "local".parse::<SearchScope>().unwrap(),
            SearchScope::Single(Provider::Local)
        );
        assert!("openai".parse::<Provider>().is_err());
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in [Role::User, Role::Assistant, Role::System, Role::Tool] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("narrator".parse::<Role>().is_err());
    }

    #[test]
    fn timestamps_sort_lexically() {
        let early = parse_timestamp("2024-01-01T09:00:00Z").unwrap();
        let late = parse_timestamp("2024-01-01T10:00:00.5Z").unwrap();
        assert!(format_timestamp(&early) < format_timestamp(&late));
        assert_eq!(format_timestamp(&early).len(), format_timestamp(&late).len());
    }

    #[test]
    fn legacy_timestamp_format_is_accepted() {
        let ts = parse_timestamp("2023-05-06 07:08:09").unwrap();
        assert_eq!(format_timestamp(&ts), "2023-05-06T07:08:09.000000Z");
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn embedding_blob_preserves_values() {
        let v = vec![0.25_f32, -1.0, 3.5];
        let bytes = encode_embedding(&v).unwrap();
        assert_eq!(decode_embedding(&bytes).unwrap(), v);
        assert!(decode_embedding(&[1, 2]).is_err());
    }
}

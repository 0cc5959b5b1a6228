use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::memory_db::Provider;

pub const DEFAULT_REMOTE_DIMENSION: usize = 1536;
pub const DEFAULT_LOCAL_DIMENSION: usize = 1024;
pub const DEFAULT_INDEX_CAPACITY_FLOOR: usize = 10_000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the database, index snapshots and legacy files
    pub data_dir: PathBuf,
    pub database_file: String,
    pub remote_dimension: usize,
    pub local_dimension: usize,
    /// Minimum capacity any index is created or rebuilt with
    pub index_capacity_floor: usize,
    pub pool_size: u32,
    pub legacy_memories_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_data_dir("./data")
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let data_dir = env::var("MEMORY_DATA_DIR").unwrap_or_else(|_| "./data".into());
        let config = Self {
            data_dir: PathBuf::from(data_dir),
            database_file: env::var("MEMORY_DATABASE_FILE").unwrap_or_else(|_| "memory.db".into()),
            remote_dimension: env::var("REMOTE_EMBEDDING_DIM")
                .unwrap_or_else(|_| DEFAULT_REMOTE_DIMENSION.to_string())
                .parse()
                .context("REMOTE_EMBEDDING_DIM must be a positive integer")?,
            local_dimension: env::var("LOCAL_EMBEDDING_DIM")
                .unwrap_or_else(|_| DEFAULT_LOCAL_DIMENSION.to_string())
                .parse()
                .context("LOCAL_EMBEDDING_DIM must be a positive integer")?,
            index_capacity_floor: env::var("INDEX_CAPACITY_FLOOR")
                .unwrap_or_else(|_| DEFAULT_INDEX_CAPACITY_FLOOR.to_string())
                .parse()
                .context("INDEX_CAPACITY_FLOOR must be a positive integer")?,
            pool_size: env::var("DB_POOL_SIZE")
                .unwrap_or_else(|_| "10".into())
                .parse()
                .context("DB_POOL_SIZE must be a positive integer")?,
            legacy_memories_file: env::var("MEMORY_LEGACY_FILE").unwrap_or_else(|_| "memories.json".into()),
        };
        config.validate()?;

        info!(
            "Memory configuration: data dir {}, dimensions remote={} local={}, capacity floor {}",
            config.data_dir.display(),
            config.remote_dimension,
            config.local_dimension,
            config.index_capacity_floor
        );
        Ok(config)
    }

    /// Defaults rooted at `data_dir`, ignoring the environment.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            database_file: "memory.db".into(),
            remote_dimension: DEFAULT_REMOTE_DIMENSION,
            local_dimension: DEFAULT_LOCAL_DIMENSION,
            index_capacity_floor: DEFAULT_INDEX_CAPACITY_FLOOR,
            pool_size: 10,
            legacy_memories_file: "memories.json".into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote_dimension == 0 || self.local_dimension == 0 {
            anyhow::bail!("embedding dimensions must be non-zero");
        }
        if self.pool_size == 0 {
            anyhow::bail!("DB_POOL_SIZE must be at least 1");
        }
        let legacy = Path::new(&self.legacy_memories_file);
        if self.legacy_memories_file.trim().is_empty() || legacy.components().count() != 1 {
            anyhow::bail!("MEMORY_LEGACY_FILE must be a file name inside the data directory");
        }
        Ok(())
    }

    pub fn dimension(&self, provider: Provider) -> usize {
        match provider {
            Provider::Remote => self.remote_dimension,
            Provider::Local => self.local_dimension,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn snapshot_path(&self, provider: Provider) -> PathBuf {
        self.data_dir.join(format!("thoughts_{}.hnsw", provider.as_str()))
    }

    pub fn legacy_memories_path(&self) -> PathBuf {
        self.data_dir.join(&self.legacy_memories_file)
    }

    pub fn quarantined_memories_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.migrated", self.legacy_memories_file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_live_under_data_dir() {
        let config = Config::with_data_dir("/tmp/mem");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/mem/memory.db"));
        assert_eq!(
            config.snapshot_path(Provider::Remote),
            PathBuf::from("/tmp/mem/thoughts_remote.hnsw")
        );
        assert_eq!(
            config.snapshot_path(Provider::Local),
            PathBuf::from("/tmp/mem/thoughts_local.hnsw")
        );
        assert_eq!(
            config.quarantined_memories_path(),
            PathBuf::from("/tmp/mem/memories.json.migrated")
        );
    }

    #[test]
    fn defaults_match_provider_dimensions() {
        let config = Config::default();
        assert_eq!(config.dimension(Provider::Remote), 1536);
        assert_eq!(config.dimension(Provider::Local), 1024);
        assert_eq!(config.index_capacity_floor, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn legacy_file_name_comes_from_environment() {
        env::set_var("MEMORY_LEGACY_FILE", "notes.json");
        let config = Config::from_env();
        env::remove_var("MEMORY_LEGACY_FILE");

        let config = config.unwrap();
        assert_eq!(config.legacy_memories_path(), config.data_dir.join("notes.json"));
        assert_eq!(
            config.quarantined_memories_path(),
            config.data_dir.join("notes.json.migrated")
        );
    }

    #[test]
    fn legacy_file_must_stay_in_data_dir() {
        let mut config = Config::default();
        for bad in ["", "../memories.json", "nested/memories.json"] {
            config.legacy_memories_file = bad.into();
            assert!(config.validate().is_err(), "{:?} accepted", bad);
        }
    }

    #[test]
    fn zero_dimension_is_rejected() {
        let mut config = Config::default();
        config.local_dimension = 0;
        assert!(config.validate().is_err());
    }
}

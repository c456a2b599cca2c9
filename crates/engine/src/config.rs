//! Runtime configuration, loadable from TOML. Every key is optional.
//!
//! ```toml
//! [storage]
//! data_dir = "/var/lib/tasks"
//!
//! [sync]
//! batch_size = 50
//! collections = ["projects", "tasks"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tasksync_core::Collection;

use crate::error::SyncError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the database file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_file_name")]
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Rows per pull or push round-trip.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pull interval when the backend offers no change notifications.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// How long pending work or retrying may last before status reports stale.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,

    #[serde(default = "default_collections")]
    pub collections: Vec<Collection>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_file_name() -> String {
    "tasksync.db".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    30_000
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

fn default_stale_after_ms() -> u64 {
    600_000
}

fn default_collections() -> Vec<Collection> {
    Collection::ALL.to_vec()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            file_name: default_file_name(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            stale_after_ms: default_stale_after_ms(),
            collections: default_collections(),
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.file_name)
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, SyncError> {
        let config: Self = toml::from_str(s).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// A config rooted at `data_dir`, everything else default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: data_dir.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.sync.batch_size == 0 {
            return Err(SyncError::Config("sync.batch_size must be positive".into()));
        }
        if self.sync.backoff_base_ms == 0 || self.sync.backoff_max_ms < self.sync.backoff_base_ms {
            return Err(SyncError::Config(
                "sync.backoff_max_ms must be at least sync.backoff_base_ms, which must be positive".into(),
            ));
        }
        Ok(())
    }
}

use std::path::PathBuf;

use tasksync_core::Collection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot open storage at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("storage directory recovery failed for {path}: {source}")]
    Recovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("migration {version} ({description}) failed: {source}")]
    Migration {
        version: u32,
        description: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("invalid migration registry: {0}")]
    InvalidRegistry(String),

    #[error("schema at version {found}, expected {expected}; run migrations first")]
    SchemaOutdated { found: u32, expected: u32 },

    #[error("not found: {collection} {id}")]
    NotFound { collection: Collection, id: String },

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("category {category_id} is still used by {project_count} project(s)")]
    ReferentialGuard {
        category_id: String,
        project_count: u64,
    },

    #[error("connection lock poisoned")]
    Poisoned,

    #[error("core error: {0}")]
    Core(#[from] tasksync_core::CoreError),
}

impl StorageError {
    pub(crate) fn not_found(collection: Collection, id: impl ToString) -> Self {
        Self::NotFound {
            collection,
            id: id.to_string(),
        }
    }

    /// Map a failed write, surfacing SQLite constraint failures as
    /// `ConstraintViolation` instead of a raw driver error.
    pub(crate) fn from_write(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::ConstraintViolation(msg.unwrap_or_else(|| e.to_string()))
            }
            other => Self::Sqlite(other),
        }
    }
}

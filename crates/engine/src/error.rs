use tasksync_core::{Collection, CoreError};
use tasksync_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Network or backend unavailability. The only retryable kind.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend's schema or payloads disagree with ours.
    #[error("schema conflict in {collection}: {detail}")]
    SchemaConflict {
        collection: Collection,
        detail: String,
    },

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The collection stopped after an earlier authorization or schema
    /// failure and needs an explicit resume.
    #[error("sync for {collection} is halted: {reason}")]
    Halted {
        collection: Collection,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sync engine is shut down")]
    Shutdown,
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Errors that stop the collection until it is explicitly resumed.
    pub fn halts(&self) -> bool {
        matches!(self, Self::Authorization(_) | Self::SchemaConflict { .. })
    }
}

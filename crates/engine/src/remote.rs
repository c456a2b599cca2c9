use std::future::Future;

use tasksync_core::{Collection, Hlc, OutboundBatch, RemoteRow};
use tokio::sync::broadcast;

use crate::error::SyncError;

/// The remote document store a [`SyncEngine`](crate::SyncEngine) talks to.
///
/// Implementations report unreachability as [`SyncError::Transport`],
/// rejected credentials as [`SyncError::Authorization`] and payloads they
/// cannot accept as [`SyncError::SchemaConflict`].
pub trait RemoteBackend: Send + Sync + 'static {
    /// Rows with `updated_at` strictly greater than `cursor` (all rows when
    /// `None`), ascending by `updated_at`, at most `limit`.
    fn pull_since(
        &self,
        collection: Collection,
        cursor: Option<Hlc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<RemoteRow>, SyncError>> + Send;

    /// Upsert every row of the batch, tombstones included. Returning `Ok`
    /// acknowledges the whole batch. Re-sending a batch with the same
    /// `batch_id` must be harmless.
    fn push(&self, batch: &OutboundBatch) -> impl Future<Output = Result<(), SyncError>> + Send;

    /// Change notifications, if the backend offers them. Without them the
    /// engine polls.
    fn notifications(&self) -> Option<broadcast::Receiver<Collection>> {
        None
    }
}

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tasksync_core::{BatchId, Collection, Hlc, OutboundBatch, RemoteRow, SyncRecord};
use tasksync_engine::{RemoteBackend, SyncError};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A failure to inject into the next backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transport,
    /// A push is applied but its response never arrives. On a pull this is
    /// a plain transport failure.
    LostAck,
    Authorization,
    SchemaConflict,
}

#[derive(Default)]
struct BackendState {
    rows: HashMap<Collection, BTreeMap<Uuid, RemoteRow>>,
    offline: bool,
    failures: VecDeque<Failure>,
    pushes: Vec<OutboundBatch>,
    applied_batches: HashSet<BatchId>,
    pulls: usize,
}

struct Inner {
    state: Mutex<BackendState>,
    notify: broadcast::Sender<Collection>,
    notifications: bool,
}

/// In-memory stand-in for the remote document store. Clones share state, so
/// several devices can sync through one backend.
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<Inner>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// A backend without change notifications; engines must poll.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A backend that announces every accepted write.
    pub fn with_notifications() -> Self {
        Self::build(true)
    }

    fn build(notifications: bool) -> Self {
        let (notify, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BackendState::default()),
                notify,
                notifications,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        // A panicking test thread must not cascade into every other call.
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Fail the next call (pull or push) with `failure`. Queues.
    pub fn fail_next(&self, failure: Failure) {
        self.state().failures.push_back(failure);
    }

    /// Write a row directly, as another client would.
    pub fn seed(&self, record: &SyncRecord) -> Result<(), SyncError> {
        let row = RemoteRow::from_record(record)?;
        let collection = row.collection;
        upsert_newest(&mut self.state(), row);
        let _ = self.inner.notify.send(collection);
        Ok(())
    }

    /// Store a raw row without checking its body, as a misbehaving client
    /// or an incompatible schema would.
    pub fn seed_raw(&self, row: RemoteRow) {
        let collection = row.collection;
        upsert_newest(&mut self.state(), row);
        let _ = self.inner.notify.send(collection);
    }

    pub fn rows(&self, collection: Collection) -> Vec<RemoteRow> {
        self.state()
            .rows
            .get(&collection)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record(&self, collection: Collection, id: impl Into<Uuid>) -> Option<SyncRecord> {
        let id = id.into();
        let state = self.state();
        let row = state.rows.get(&collection)?.get(&id)?;
        row.decode().ok()
    }

    /// Every batch received, in arrival order, including re-sent ones.
    pub fn pushed_batches(&self) -> Vec<OutboundBatch> {
        self.state().pushes.clone()
    }

    /// Ids pushed for `collection`, in push order, with repeats.
    pub fn pushed_ids(&self, collection: Collection) -> Vec<Uuid> {
        self.state()
            .pushes
            .iter()
            .filter(|b| b.collection == collection)
            .flat_map(|b| b.rows.iter().map(|r| r.id))
            .collect()
    }

    /// Batches whose rows were actually applied; re-sends are not counted.
    pub fn applied_batch_count(&self) -> usize {
        self.state().applied_batches.len()
    }

    /// Soft-delete a row the way the backend does: only the envelope's
    /// `deleted` flag and `updated_at` change, the body is left as it was.
    pub fn soft_delete(&self, collection: Collection, id: impl Into<Uuid>, at: Hlc) -> bool {
        let id = id.into();
        let found = {
            let mut state = self.state();
            match state.rows.get_mut(&collection).and_then(|rows| rows.get_mut(&id)) {
                Some(row) => {
                    row.deleted = true;
                    row.updated_at = at;
                    true
                }
                None => false,
            }
        };
        if found {
            let _ = self.inner.notify.send(collection);
        }
        found
    }

    pub fn pull_count(&self) -> usize {
        self.state().pulls
    }

    fn take_failure(state: &mut BackendState) -> Result<(), SyncError> {
        if state.offline {
            return Err(SyncError::Transport("backend unreachable".into()));
        }
        match state.failures.pop_front() {
            None => Ok(()),
            Some(Failure::Transport | Failure::LostAck) => {
                Err(SyncError::Transport("connection reset".into()))
            }
            Some(Failure::Authorization) => Err(SyncError::Authorization("token expired".into())),
            Some(Failure::SchemaConflict) => Err(SyncError::SchemaConflict {
                collection: Collection::Users,
                detail: "column mismatch".into(),
            }),
        }
    }
}

/// The backend keeps the newer of two versions of a row; ties go to the
/// incoming write.
fn upsert_newest(state: &mut BackendState, row: RemoteRow) {
    let rows = state.rows.entry(row.collection).or_default();
    match rows.get(&row.id) {
        Some(existing) if existing.updated_at > row.updated_at => {}
        _ => {
            rows.insert(row.id, row);
        }
    }
}

impl RemoteBackend for MockBackend {
    async fn pull_since(
        &self,
        collection: Collection,
        cursor: Option<Hlc>,
        limit: usize,
    ) -> Result<Vec<RemoteRow>, SyncError> {
        let mut state = self.state();
        Self::take_failure(&mut state)?;
        state.pulls += 1;
        let mut rows: Vec<RemoteRow> = state
            .rows
            .get(&collection)
            .map(|rows| {
                rows.values()
                    .filter(|r| cursor.is_none_or(|c| r.updated_at > c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|r| r.updated_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn push(&self, batch: &OutboundBatch) -> Result<(), SyncError> {
        let lost_ack = {
            let mut state = self.state();
            let lost_ack = !state.offline && state.failures.front() == Some(&Failure::LostAck);
            if lost_ack {
                state.failures.pop_front();
            } else {
                Self::take_failure(&mut state)?;
            }
            if !batch.verify_checksum() {
                return Err(SyncError::SchemaConflict {
                    collection: batch.collection,
                    detail: format!("batch {} failed its checksum", batch.batch_id),
                });
            }
            state.pushes.push(batch.clone());
            if state.applied_batches.insert(batch.batch_id) {
                for row in &batch.rows {
                    upsert_newest(&mut state, row.clone());
                }
            }
            lost_ack
        };
        let _ = self.inner.notify.send(batch.collection);
        if lost_ack {
            return Err(SyncError::Transport("response lost after apply".into()));
        }
        Ok(())
    }

    fn notifications(&self) -> Option<broadcast::Receiver<Collection>> {
        self.inner
            .notifications
            .then(|| self.inner.notify.subscribe())
    }
}

//! Per-collection background synchronization.
//!
//! Each collection runs its own cycle: push every pending local row, then
//! pull and reconcile everything the backend changed since the persisted
//! cursor. Cycles are triggered by local mutations, backend notifications, a
//! poll interval, or [`SyncEngine::sync_now`]. Transport failures back off
//! exponentially forever; authorization and schema failures halt the
//! collection until [`SyncEngine::resume`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tasksync_core::{Collection, Hlc, OutboundBatch, RemoteRow, hlc::physical_now};
use tasksync_storage::{ChangeEvent, ChangeOrigin, InboundOutcome, LocalStore, StorageError};
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::remote::RemoteBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    PushingOutbound,
    PullingInbound,
    Reconciling,
    Retrying { attempt: u32, delay: Duration },
    Halted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub collection: Collection,
    pub phase: SyncPhase,
    pub pending: u64,
    pub last_success_at_ms: Option<u64>,
    /// Unsynced work has been outstanding longer than the staleness window.
    pub stale: bool,
}

/// What one completed cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pushed: usize,
    pub pulled: usize,
    pub kept_local: usize,
    pub parked: usize,
}

struct Lane {
    phase: Mutex<SyncPhase>,
    /// One cycle at a time per collection.
    cycle: tokio::sync::Mutex<()>,
    resumed: Notify,
}

struct Shared<B> {
    store: LocalStore,
    backend: B,
    config: SyncConfig,
    backoff: Backoff,
    lanes: HashMap<Collection, Lane>,
    stop: watch::Receiver<bool>,
    started: Instant,
}

pub struct SyncEngine<B: RemoteBackend> {
    shared: Arc<Shared<B>>,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: RemoteBackend> SyncEngine<B> {
    pub fn new(store: LocalStore, backend: B, config: SyncConfig) -> Self {
        let (stop_tx, stop) = watch::channel(false);
        let lanes = config
            .collections
            .iter()
            .map(|c| {
                let lane = Lane {
                    phase: Mutex::new(SyncPhase::Idle),
                    cycle: tokio::sync::Mutex::new(()),
                    resumed: Notify::new(),
                };
                (*c, lane)
            })
            .collect();
        let backoff = Backoff::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        Self {
            shared: Arc::new(Shared {
                store,
                backend,
                config,
                backoff,
                lanes,
                stop,
                started: Instant::now(),
            }),
            stop_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.shared.store
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Spawn one background worker per configured collection. Must be called
    /// from within a tokio runtime; calling it twice has no further effect.
    pub fn start(&self) -> Result<(), SyncError> {
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| SyncError::Storage(StorageError::Poisoned))?;
        if !workers.is_empty() {
            return Ok(());
        }
        if *self.stop_tx.borrow() {
            return Err(SyncError::Shutdown);
        }
        for collection in self.shared.config.collections.iter().copied() {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(worker(shared, collection)));
        }
        info!(collections = workers.len(), "sync engine started");
        Ok(())
    }

    /// Run one full cycle for `collection` now, ignoring any backoff delay.
    pub async fn sync_now(&self, collection: Collection) -> Result<CycleReport, SyncError> {
        run_cycle(&self.shared, collection).await
    }

    pub fn status(&self, collection: Collection) -> Result<SyncStatus, SyncError> {
        let lane = self.shared.lane(collection)?;
        let state = self.shared.store.sync_state(collection)?;
        let pending = self.shared.store.pending_count(collection)?;
        let mut phase = lane.phase()?;
        if let (SyncPhase::Idle, Some(reason)) = (&phase, &state.halted_reason) {
            phase = SyncPhase::Halted(reason.clone());
        }

        let unsynced = pending > 0 || !matches!(phase, SyncPhase::Idle);
        let now_ms = physical_now()?;
        let started_ms = now_ms.saturating_sub(self.shared.started.elapsed().as_millis() as u64);
        let since = state.last_success_at_ms.unwrap_or(0).max(started_ms);
        let stale = unsynced && now_ms.saturating_sub(since) > self.shared.config.stale_after_ms;

        Ok(SyncStatus {
            collection,
            phase,
            pending,
            last_success_at_ms: state.last_success_at_ms,
            stale,
        })
    }

    /// Clear a halt (after re-authentication, say) and any backoff, and wake
    /// the collection's worker.
    pub fn resume(&self, collection: Collection) -> Result<(), SyncError> {
        let lane = self.shared.lane(collection)?;
        self.shared.store.resume_sync(collection)?;
        lane.set_phase(collection, SyncPhase::Idle);
        lane.resumed.notify_one();
        Ok(())
    }

    /// Stop every worker. A cycle in flight finishes its current batch and
    /// exits; nothing is persisted for a batch that did not complete.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "sync worker ended abnormally");
            }
        }
        info!("sync engine stopped");
    }
}

impl<B> Shared<B> {
    fn lane(&self, collection: Collection) -> Result<&Lane, SyncError> {
        self.lanes.get(&collection).ok_or_else(|| {
            SyncError::Config(format!("collection {collection} is not configured for sync"))
        })
    }

    fn check_running(&self) -> Result<(), SyncError> {
        if *self.stop.borrow() {
            return Err(SyncError::Shutdown);
        }
        Ok(())
    }

    /// Run a store transaction on the blocking pool so SQLite never holds up
    /// the runtime's worker threads.
    async fn blocking<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&LocalStore) -> Result<T, StorageError> + Send + 'static,
    {
        let store = self.store.clone();
        let out = tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
        Ok(out?)
    }
}

impl Lane {
    fn phase(&self) -> Result<SyncPhase, SyncError> {
        self.phase
            .lock()
            .map(|p| p.clone())
            .map_err(|_| SyncError::Storage(StorageError::Poisoned))
    }

    fn set_phase(&self, collection: Collection, phase: SyncPhase) {
        if let Ok(mut current) = self.phase.lock() {
            if *current != phase {
                debug!(%collection, ?phase, "sync phase");
                *current = phase;
            }
        }
    }
}

async fn run_cycle<B: RemoteBackend>(
    shared: &Shared<B>,
    collection: Collection,
) -> Result<CycleReport, SyncError> {
    shared.check_running()?;
    let lane = shared.lane(collection)?;
    let _cycle = lane.cycle.lock().await;

    let state = shared.blocking(move |s| s.sync_state(collection)).await?;
    if let Some(reason) = state.halted_reason {
        lane.set_phase(collection, SyncPhase::Halted(reason.clone()));
        return Err(SyncError::Halted { collection, reason });
    }

    let mut report = CycleReport::default();
    let outcome = async {
        push_pending(shared, lane, collection, &mut report).await?;
        pull_remote(shared, lane, collection, &mut report).await
    }
    .await;

    match outcome {
        Ok(()) => {
            shared.blocking(move |s| s.record_sync_success(collection)).await?;
            if report.pushed > 0 {
                // Tombstones just acknowledged are no longer needed locally.
                let removed = shared.blocking(|s| s.compact_tombstones()).await?;
                debug!(%collection, removed, "compacted after push");
            }
            lane.set_phase(collection, SyncPhase::Idle);
            debug!(%collection, ?report, "sync cycle complete");
            Ok(report)
        }
        Err(e) if e.is_retryable() => {
            let attempt = state.backoff.attempts.saturating_add(1);
            let delay = shared.backoff.delay(state.backoff.attempts);
            let next_at = physical_now()?.saturating_add(delay.as_millis() as u64);
            shared
                .blocking(move |s| s.record_backoff(collection, attempt, next_at))
                .await?;
            lane.set_phase(collection, SyncPhase::Retrying { attempt, delay });
            warn!(%collection, attempt, delay_ms = delay.as_millis() as u64, error = %e, "sync failed; backing off");
            Err(e)
        }
        Err(e) if e.halts() => {
            let reason = e.to_string();
            let persisted = reason.clone();
            shared
                .blocking(move |s| s.halt_sync(collection, &persisted))
                .await?;
            lane.set_phase(collection, SyncPhase::Halted(reason));
            error!(%collection, error = %e, "sync halted until resumed");
            Err(e)
        }
        Err(e) => {
            lane.set_phase(collection, SyncPhase::Idle);
            Err(e)
        }
    }
}

async fn push_pending<B: RemoteBackend>(
    shared: &Shared<B>,
    lane: &Lane,
    collection: Collection,
    report: &mut CycleReport,
) -> Result<(), SyncError> {
    let limit = shared.config.batch_size;
    loop {
        shared.check_running()?;
        let rows = shared
            .blocking(move |s| s.next_outbound_batch(collection, limit))
            .await?;
        if rows.is_empty() {
            return Ok(());
        }
        lane.set_phase(collection, SyncPhase::PushingOutbound);

        let full = rows.len() == limit;
        let acked: Vec<(Uuid, Hlc)> = rows
            .iter()
            .map(|r| (r.entry.id, r.record.updated_at()))
            .collect();
        let remote_rows = rows
            .iter()
            .map(|r| RemoteRow::from_record(&r.record))
            .collect::<Result<Vec<_>, _>>()?;
        let batch = OutboundBatch::new(collection, remote_rows);
        debug!(
            %collection,
            batch = %batch.batch_id,
            rows = batch.rows.len(),
            high_water = ?batch.high_water(),
            "pushing batch"
        );

        shared.backend.push(&batch).await?;
        let sent = acked.len();
        shared
            .blocking(move |s| s.acknowledge_outbound(collection, &acked))
            .await?;
        report.pushed += sent;
        if !full {
            return Ok(());
        }
    }
}

async fn pull_remote<B: RemoteBackend>(
    shared: &Shared<B>,
    lane: &Lane,
    collection: Collection,
    report: &mut CycleReport,
) -> Result<(), SyncError> {
    let limit = shared.config.batch_size;
    loop {
        shared.check_running()?;
        lane.set_phase(collection, SyncPhase::PullingInbound);
        let cursor = shared.blocking(move |s| s.sync_state(collection)).await?.cursor;
        let rows = shared.backend.pull_since(collection, cursor, limit).await?;
        if rows.is_empty() {
            return Ok(());
        }
        let full = rows.len() >= limit;

        lane.set_phase(collection, SyncPhase::Reconciling);
        let records = rows
            .iter()
            .map(|row| {
                if row.collection != collection {
                    return Err(SyncError::SchemaConflict {
                        collection,
                        detail: format!("pulled a {} row", row.collection),
                    });
                }
                row.decode().map_err(|e| SyncError::SchemaConflict {
                    collection,
                    detail: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let applied = shared
            .blocking(move |s| s.apply_inbound_batch(collection, records))
            .await?;
        report.pulled += applied.outcomes.len();
        report.kept_local += applied.count(InboundOutcome::KeptLocal);
        report.parked += applied.count(InboundOutcome::Parked);
        if !full {
            return Ok(());
        }
    }
}

/// Resolves on the next local mutation of `collection`. Remote and derived
/// changes do not need a push.
async fn local_change(rx: &mut broadcast::Receiver<ChangeEvent>, collection: Collection) {
    loop {
        match rx.recv().await {
            Ok(ChangeEvent { collection: c, origin: ChangeOrigin::Local, .. }) if c == collection => {
                return;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Resolves on the next backend notification for `collection`; never, if the
/// backend has none.
async fn remote_change(rx: &mut Option<broadcast::Receiver<Collection>>, collection: Collection) {
    if let Some(inner) = rx.as_mut() {
        loop {
            match inner.recv().await {
                Ok(c) if c == collection => return,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => return,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(%collection, "backend notifications closed; relying on polling");
        *rx = None;
    }
    std::future::pending::<()>().await
}

/// Drop queued events so a burst of edits triggers one cycle.
fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) {
    while !matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed)
    ) {}
}

async fn worker<B: RemoteBackend>(shared: Arc<Shared<B>>, collection: Collection) {
    let Ok(lane) = shared.lane(collection) else {
        return;
    };
    let mut stop = shared.stop.clone();
    let mut local = shared.store.changes();
    let mut remote = shared.backend.notifications();
    let mut poll = tokio::time::interval(shared.config.poll_interval());
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    poll.tick().await;

    loop {
        if *stop.borrow() {
            break;
        }

        // Halted or backing off: wait it out, or for an explicit resume.
        let wait = match shared.blocking(move |s| s.sync_state(collection)).await {
            Ok(state) if state.halted_reason.is_some() => None,
            Ok(state) => {
                let now = physical_now().unwrap_or(0);
                let until = state.backoff.next_attempt_at_ms.unwrap_or(0);
                Some(Duration::from_millis(until.saturating_sub(now)))
            }
            Err(e) => {
                error!(%collection, error = %e, "reading sync state failed");
                Some(shared.backoff.nominal(0))
            }
        };
        match wait {
            None => {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = lane.resumed.notified() => continue,
                }
            }
            Some(delay) if !delay.is_zero() => {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = lane.resumed.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Some(_) => {}
        }

        match run_cycle(&shared, collection).await {
            Ok(_) => {}
            Err(SyncError::Shutdown) => break,
            // Backoff or halt is now persisted; the top of the loop honours it.
            Err(e) if e.is_retryable() || e.halts() => continue,
            Err(SyncError::Halted { .. }) => continue,
            Err(e) => {
                error!(%collection, error = %e, "sync cycle failed");
            }
        }

        tokio::select! {
            _ = stop.changed() => break,
            _ = local_change(&mut local, collection) => drain(&mut local),
            _ = remote_change(&mut remote, collection) => {}
            _ = poll.tick() => {}
            _ = lane.resumed.notified() => {}
        }
    }
    debug!(%collection, "sync worker exiting");
}

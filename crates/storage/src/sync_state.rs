//! Per-collection sync bookkeeping: pull cursor, push high-water mark,
//! persisted backoff and halt reason. Survives restarts so a resumed engine
//! neither re-pulls acknowledged rows nor forgets it was backing off.

use rusqlite::{Connection, OptionalExtension};
use tasksync_core::{Collection, Hlc, hlc::physical_now};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::store::{LocalStore, WriteCtx};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    /// Consecutive failed cycles; zero when healthy.
    pub attempts: u32,
    /// Unix milliseconds before which no retry should start.
    pub next_attempt_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    /// Highest remote `updated_at` applied locally.
    pub cursor: Option<Hlc>,
    /// Highest `updated_at` the backend has acknowledged from us.
    pub high_water: Option<Hlc>,
    pub backoff: BackoffState,
    pub last_success_at_ms: Option<u64>,
    pub halted_reason: Option<String>,
}

fn opt_hlc(bytes: Option<Vec<u8>>) -> Result<Option<Hlc>, StorageError> {
    Ok(bytes.map(|b| Hlc::from_slice(&b)).transpose()?)
}

fn ensure_row(conn: &Connection, collection: Collection) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR IGNORE INTO sync_state (collection) VALUES (?1)",
        [collection.as_str()],
    )?;
    Ok(())
}

pub(crate) fn load_sync_state(conn: &Connection, collection: Collection) -> Result<SyncState, StorageError> {
    let row = conn
        .query_row(
            "SELECT cursor, high_water, backoff_attempts, next_attempt_at, last_success_at, halted_reason
             FROM sync_state WHERE collection = ?1",
            [collection.as_str()],
            |row| {
                Ok((
                    row.get::<_, Option<Vec<u8>>>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((cursor, high_water, attempts, next_at, last_success, halted_reason)) = row else {
        return Ok(SyncState::default());
    };
    Ok(SyncState {
        cursor: opt_hlc(cursor)?,
        high_water: opt_hlc(high_water)?,
        backoff: BackoffState {
            attempts,
            next_attempt_at_ms: next_at.map(|ms| ms as u64),
        },
        last_success_at_ms: last_success.map(|ms| ms as u64),
        halted_reason,
    })
}

/// Advance the pull cursor inside the transaction that applied the batch.
/// Never moves backwards.
pub(crate) fn advance_cursor(
    ctx: &WriteCtx<'_>,
    collection: Collection,
    cursor: Hlc,
) -> Result<(), StorageError> {
    ensure_row(ctx.tx, collection)?;
    let current = load_sync_state(ctx.tx, collection)?.cursor;
    if current.is_some_and(|c| c >= cursor) {
        return Ok(());
    }
    ctx.tx.execute(
        "UPDATE sync_state SET cursor = ?2 WHERE collection = ?1",
        rusqlite::params![collection.as_str(), &cursor.to_bytes()[..]],
    )?;
    Ok(())
}

/// Raise the push high-water mark. Never moves backwards.
pub(crate) fn advance_high_water(
    ctx: &WriteCtx<'_>,
    collection: Collection,
    high_water: Hlc,
) -> Result<(), StorageError> {
    ensure_row(ctx.tx, collection)?;
    let current = load_sync_state(ctx.tx, collection)?.high_water;
    if current.is_some_and(|h| h >= high_water) {
        return Ok(());
    }
    ctx.tx.execute(
        "UPDATE sync_state SET high_water = ?2 WHERE collection = ?1",
        rusqlite::params![collection.as_str(), &high_water.to_bytes()[..]],
    )?;
    Ok(())
}

impl LocalStore {
    pub fn sync_state(&self, collection: Collection) -> Result<SyncState, StorageError> {
        self.read(|conn| load_sync_state(conn, collection))
    }

    /// Persist a failed cycle's backoff.
    pub fn record_backoff(
        &self,
        collection: Collection,
        attempts: u32,
        next_attempt_at_ms: u64,
    ) -> Result<(), StorageError> {
        self.write(|ctx| {
            ensure_row(ctx.tx, collection)?;
            ctx.tx.execute(
                "UPDATE sync_state SET backoff_attempts = ?2, next_attempt_at = ?3 WHERE collection = ?1",
                rusqlite::params![collection.as_str(), attempts, next_attempt_at_ms as i64],
            )?;
            Ok(())
        })
    }

    /// A cycle finished cleanly: reset backoff and stamp the success time.
    pub fn record_sync_success(&self, collection: Collection) -> Result<(), StorageError> {
        let now = physical_now()?;
        self.write(|ctx| {
            ensure_row(ctx.tx, collection)?;
            ctx.tx.execute(
                "UPDATE sync_state SET backoff_attempts = 0, next_attempt_at = NULL, last_success_at = ?2
                 WHERE collection = ?1",
                rusqlite::params![collection.as_str(), now as i64],
            )?;
            Ok(())
        })
    }

    /// Stop syncing `collection` until [`resume_sync`](Self::resume_sync).
    pub fn halt_sync(&self, collection: Collection, reason: &str) -> Result<(), StorageError> {
        warn!(%collection, reason, "sync halted");
        self.write(|ctx| {
            ensure_row(ctx.tx, collection)?;
            ctx.tx.execute(
                "UPDATE sync_state SET halted_reason = ?2 WHERE collection = ?1",
                rusqlite::params![collection.as_str(), reason],
            )?;
            Ok(())
        })
    }

    /// Clear a halt and any backoff so the next cycle runs immediately.
    pub fn resume_sync(&self, collection: Collection) -> Result<(), StorageError> {
        debug!(%collection, "sync resumed");
        self.write(|ctx| {
            ctx.tx.execute(
                "UPDATE sync_state SET halted_reason = NULL, backoff_attempts = 0, next_attempt_at = NULL
                 WHERE collection = ?1",
                [collection.as_str()],
            )?;
            Ok(())
        })
    }
}

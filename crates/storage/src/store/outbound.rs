use rusqlite::Connection;
use tasksync_core::{
    CategoryId, Collection, Hlc, ProjectId, SubtaskId, SyncRecord, TaskId, UserId,
};
use tracing::debug;
use uuid::Uuid;

use super::categories::load_category;
use super::projects::load_project;
use super::subtasks::load_subtask;
use super::tasks::load_task;
use super::users::load_user;
use super::{LocalStore, hlc_col, uuid_col};
use crate::error::StorageError;
use crate::sync_state;

/// A row waiting to be pushed, in first-enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    pub seq: i64,
    pub id: Uuid,
    /// The latest local edit at enqueue time.
    pub updated_at: Hlc,
}

/// A pending entry resolved to the row's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRow {
    pub entry: PendingEntry,
    pub record: SyncRecord,
}

/// Current state of any synchronized row, tombstones included.
pub(crate) fn load_record(
    conn: &Connection,
    collection: Collection,
    id: Uuid,
) -> Result<Option<SyncRecord>, StorageError> {
    Ok(match collection {
        Collection::Users => load_user(conn, UserId::from_uuid(id))?.map(SyncRecord::User),
        Collection::Categories => {
            load_category(conn, CategoryId::from_uuid(id))?.map(SyncRecord::Category)
        }
        Collection::Projects => load_project(conn, ProjectId::from_uuid(id))?.map(SyncRecord::Project),
        Collection::Tasks => load_task(conn, TaskId::from_uuid(id))?.map(SyncRecord::Task),
        Collection::Subtasks => load_subtask(conn, SubtaskId::from_uuid(id))?.map(SyncRecord::Subtask),
    })
}

fn pending(conn: &Connection, collection: Collection, limit: usize) -> Result<Vec<PendingEntry>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT seq, entity_id, updated_at FROM sync_pending
         WHERE collection = ?1 ORDER BY seq LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![collection.as_str(), limit as i64], |row| {
            Ok(PendingEntry {
                seq: row.get(0)?,
                id: uuid_col(row, 1)?,
                updated_at: hlc_col(row, 2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl LocalStore {
    /// Up to `limit` pending entries for `collection`, oldest first.
    pub fn pending_outbound(
        &self,
        collection: Collection,
        limit: usize,
    ) -> Result<Vec<PendingEntry>, StorageError> {
        self.read(|conn| pending(conn, collection, limit))
    }

    pub fn pending_count(&self, collection: Collection) -> Result<u64, StorageError> {
        self.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM sync_pending WHERE collection = ?1",
                [collection.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// The next batch to push. Entries whose row has since been removed by a
    /// cascade are dropped from the queue rather than returned.
    pub fn next_outbound_batch(
        &self,
        collection: Collection,
        limit: usize,
    ) -> Result<Vec<OutboundRow>, StorageError> {
        self.write(|ctx| {
            let mut rows = Vec::new();
            for entry in pending(ctx.tx, collection, limit)? {
                match load_record(ctx.tx, collection, entry.id)? {
                    Some(record) => rows.push(OutboundRow { entry, record }),
                    None => {
                        debug!(%collection, id = %entry.id, "dropping pending entry for vanished row");
                        ctx.drop_pending(collection, entry.id)?;
                    }
                }
            }
            Ok(rows)
        })
    }

    /// Remove acknowledged rows from the queue. An entry re-edited after the
    /// batch was built carries a newer `updated_at` and stays pending.
    /// Returns how many entries were removed.
    pub fn acknowledge_outbound(
        &self,
        collection: Collection,
        acked: &[(Uuid, Hlc)],
    ) -> Result<usize, StorageError> {
        self.write(|ctx| {
            let mut removed = 0;
            let mut high_water: Option<Hlc> = None;
            for (id, updated_at) in acked {
                removed += ctx.tx.execute(
                    "DELETE FROM sync_pending
                     WHERE collection = ?1 AND entity_id = ?2 AND updated_at <= ?3",
                    rusqlite::params![
                        collection.as_str(),
                        id.as_bytes().as_slice(),
                        &updated_at.to_bytes()[..]
                    ],
                )?;
                high_water = high_water.max(Some(*updated_at));
            }
            if let Some(high_water) = high_water {
                sync_state::advance_high_water(ctx, collection, high_water)?;
            }
            Ok(removed)
        })
    }
}

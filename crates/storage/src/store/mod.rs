mod categories;
mod inbound;
mod observe;
mod outbound;
mod projects;
mod subtasks;
mod tasks;
mod users;

pub use categories::{CategoryChanges, CategoryQuery, NewCategory};
pub use inbound::{InboundOutcome, InboundReport};
pub use observe::Observation;
pub use outbound::{OutboundRow, PendingEntry};
pub use projects::{NewProject, ProjectChanges, ProjectOrder, ProjectQuery};
pub use subtasks::{NewSubtask, SubtaskChanges};
pub use tasks::{NewTask, TaskChanges, TaskOrder, TaskQuery};
pub use users::{NewUser, UserChanges};

use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, Transaction};
use tasksync_core::{Collection, Hlc, HlcClock};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::connection::Database;
use crate::error::StorageError;
use crate::migrations;

const CHANGE_FEED_CAPACITY: usize = 1024;

/// Who caused a committed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A mutation through the public store API; the row is pending outbound.
    Local,
    /// A row applied from an inbound sync batch.
    Remote,
    /// A derived-field recomputation.
    Derived,
}

/// Published on the change feed after the owning transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub id: Uuid,
    pub origin: ChangeOrigin,
}

struct StoreInner {
    db: Database,
    clock: Mutex<HlcClock>,
    changes: broadcast::Sender<ChangeEvent>,
}

/// Typed, transactional access to the domain tables.
///
/// Cheap to clone; all clones share the connection, clock and change feed.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl LocalStore {
    /// Wrap a migrated database. Fails if migrations have not been run.
    pub fn open(db: Database) -> Result<Self, StorageError> {
        let last_stamp = {
            let conn = db.lock()?;
            let found = migrations::current_version(&conn)?;
            let expected = migrations::latest_version();
            if found < expected {
                return Err(StorageError::SchemaOutdated { found, expected });
            }
            latest_stamp(&conn)?
        };
        debug!(last_stamp = %last_stamp, "local store opened");
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                clock: Mutex::new(HlcClock::starting_after(last_stamp)),
                changes,
            }),
        })
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    /// Subscribe to committed changes.
    pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes.subscribe()
    }

    pub(crate) fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let conn = self.inner.db.lock()?;
        f(&conn)
    }

    /// Run `f` in one transaction. Either everything it wrote commits and its
    /// events are published, or nothing is kept.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&mut WriteCtx<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let (out, events) = {
            let mut conn = self.inner.db.lock()?;
            let tx = conn.transaction()?;
            let mut ctx = WriteCtx {
                tx: &tx,
                clock: &self.inner.clock,
                events: Vec::new(),
            };
            let out = f(&mut ctx)?;
            let events = std::mem::take(&mut ctx.events);
            tx.commit()?;
            (out, events)
        };
        for event in events {
            // No subscribers is fine.
            let _ = self.inner.changes.send(event);
        }
        Ok(out)
    }

    /// Hard-delete tombstones that are no longer waiting to be pushed.
    pub fn compact_tombstones(&self) -> Result<usize, StorageError> {
        let removed = self.write(|ctx| {
            let mut removed = 0;
            // Children first so no foreign key is left dangling.
            for collection in Collection::ALL.iter().rev() {
                removed += ctx.tx.execute(
                    &format!(
                        "DELETE FROM {table} WHERE deleted = 1 AND NOT EXISTS (
                            SELECT 1 FROM sync_pending p
                            WHERE p.collection = ?1 AND p.entity_id = {table}.id)",
                        table = collection.table()
                    ),
                    [collection.as_str()],
                )?;
            }
            Ok(removed)
        })?;
        if removed > 0 {
            info!(removed, "compacted acknowledged tombstones");
        }
        Ok(removed)
    }
}

/// Transaction-scoped state handed to every write.
pub(crate) struct WriteCtx<'a> {
    pub(crate) tx: &'a Transaction<'a>,
    clock: &'a Mutex<HlcClock>,
    events: Vec<ChangeEvent>,
}

impl WriteCtx<'_> {
    pub(crate) fn tick(&self) -> Result<Hlc, StorageError> {
        let mut clock = self.clock.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(clock.tick()?)
    }

    /// A stamp strictly newer than `floor` and than anything issued so far.
    pub(crate) fn tick_after(&self, floor: Hlc) -> Result<Hlc, StorageError> {
        let mut clock = self.clock.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(clock.tick_after(floor)?)
    }

    /// Absorb an inbound row's stamp before anything in the same
    /// transaction is stamped locally.
    pub(crate) fn observe_remote(&self, stamp: Hlc) -> Result<(), StorageError> {
        let mut clock = self.clock.lock().map_err(|_| StorageError::Poisoned)?;
        if let Err(e) = clock.receive(&stamp) {
            tracing::warn!(remote = %stamp, error = %e, "not absorbing remote timestamp");
        }
        Ok(())
    }

    pub(crate) fn emit(&mut self, collection: Collection, id: Uuid, origin: ChangeOrigin) {
        self.events.push(ChangeEvent {
            collection,
            id,
            origin,
        });
    }

    /// Record a local mutation: add the row to the collection's pending
    /// outbound set (keeping its original position) and announce it.
    pub(crate) fn enqueue(
        &mut self,
        collection: Collection,
        id: Uuid,
        updated_at: Hlc,
    ) -> Result<(), StorageError> {
        self.tx.execute(
            "INSERT INTO sync_pending (collection, entity_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection, entity_id) DO UPDATE SET updated_at = excluded.updated_at",
            rusqlite::params![collection.as_str(), id.as_bytes().as_slice(), &updated_at.to_bytes()[..]],
        )?;
        self.emit(collection, id, ChangeOrigin::Local);
        Ok(())
    }

    pub(crate) fn drop_pending(&self, collection: Collection, id: Uuid) -> Result<(), StorageError> {
        self.tx.execute(
            "DELETE FROM sync_pending WHERE collection = ?1 AND entity_id = ?2",
            rusqlite::params![collection.as_str(), id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    /// Reject a reference to a row that is missing or tombstoned.
    pub(crate) fn require_live(&self, collection: Collection, id: Uuid) -> Result<(), StorageError> {
        match self.row_meta(collection, id)? {
            Some((_, false)) => Ok(()),
            _ => Err(StorageError::ConstraintViolation(format!(
                "referenced {collection} row {id} does not exist"
            ))),
        }
    }

    /// `(updated_at, deleted)` for a row, tombstones included.
    pub(crate) fn row_meta(
        &self,
        collection: Collection,
        id: Uuid,
    ) -> Result<Option<(Hlc, bool)>, StorageError> {
        row_meta(self.tx, collection, id)
    }
}

pub(crate) fn row_meta(
    conn: &Connection,
    collection: Collection,
    id: Uuid,
) -> Result<Option<(Hlc, bool)>, StorageError> {
    let meta = conn
        .query_row(
            &format!(
                "SELECT updated_at, deleted FROM {} WHERE id = ?1",
                collection.table()
            ),
            [id.as_bytes().as_slice()],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, bool>(1)?)),
        )
        .optional()?;
    match meta {
        Some((stamp, deleted)) => Ok(Some((Hlc::from_slice(&stamp)?, deleted))),
        None => Ok(None),
    }
}

fn latest_stamp(conn: &Connection) -> Result<Hlc, StorageError> {
    let mut latest = Hlc::ZERO;
    for collection in Collection::ALL {
        let stamp: Option<Vec<u8>> = conn.query_row(
            &format!("SELECT MAX(updated_at) FROM {}", collection.table()),
            [],
            |row| row.get(0),
        )?;
        if let Some(bytes) = stamp {
            latest = latest.max(Hlc::from_slice(&bytes)?);
        }
    }
    Ok(latest)
}

/// Map a `query_map` closure failure back to a `rusqlite::Error`.
pub(crate) fn conversion_error(index: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Blob, Box::new(err))
}

pub(crate) fn hlc_col(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Hlc> {
    let bytes: Vec<u8> = row.get(index)?;
    Hlc::from_slice(&bytes).map_err(|e| conversion_error(index, e))
}

pub(crate) fn uuid_col(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Uuid> {
    let bytes: Vec<u8> = row.get(index)?;
    Uuid::from_slice(&bytes).map_err(|e| conversion_error(index, e))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tasksync_core::*;

    pub(crate) fn store() -> LocalStore {
        let db = Database::open_in_memory().unwrap();
        migrations::run_migrations(&db).unwrap();
        LocalStore::open(db).unwrap()
    }

    pub(crate) fn seeded() -> (LocalStore, User, Category) {
        let store = store();
        let user = store
            .create_user(NewUser {
                id: None,
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                email: "ada@example.com".into(),
                profile_image_url: None,
            })
            .unwrap();
        let category = store
            .create_category(NewCategory {
                user_id: user.id,
                name: "Work".into(),
            })
            .unwrap();
        (store, user, category)
    }

    pub(crate) fn project(store: &LocalStore, user: &User, category: &Category, name: &str) -> Project {
        store
            .create_project(NewProject {
                user_id: user.id,
                name: name.into(),
                description: None,
                color: "#3366ff".into(),
                category_id: category.id,
            })
            .unwrap()
    }

    pub(crate) fn task(store: &LocalStore, project: &Project, title: &str) -> Task {
        store
            .create_task(NewTask {
                user_id: project.user_id,
                project_id: project.id,
                title: title.into(),
                status: TaskStatus::Pending,
                priority: Priority::Medium,
                start_date: None,
                due_date: None,
            })
            .unwrap()
    }

    pub(crate) fn pending_ids(store: &LocalStore, collection: Collection) -> Vec<Uuid> {
        store
            .pending_outbound(collection, 1000)
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn open_rejects_unmigrated_database() {
        let db = Database::open_in_memory().unwrap();
        match LocalStore::open(db) {
            Err(StorageError::SchemaOutdated { found: 0, .. }) => {}
            Err(other) => panic!("expected SchemaOutdated, got {other:?}"),
            Ok(_) => panic!("expected SchemaOutdated"),
        }
    }

    #[test]
    fn reopened_store_stamps_after_existing_rows() {
        let (store, user, _) = seeded();
        let db = store.database().clone();
        drop(store);

        let reopened = LocalStore::open(db).unwrap();
        let updated = reopened
            .update_user(user.id, UserChanges { first_name: Some("Augusta".into()), ..Default::default() })
            .unwrap();
        assert!(updated.updated_at > user.updated_at);
    }

    #[test]
    fn failed_write_publishes_nothing() {
        let (store, _, _) = seeded();
        let mut rx = store.changes();
        let result: Result<(), StorageError> = store.write(|ctx| {
            ctx.emit(Collection::Users, Uuid::nil(), ChangeOrigin::Local);
            Err(StorageError::ConstraintViolation("forced".into()))
        });
        assert!(result.is_err());
        assert!(rx.try_recv().is_err());
    }
}

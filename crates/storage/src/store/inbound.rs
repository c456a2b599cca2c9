//! Applying pulled rows. One batch is one transaction: the rows, the derived
//! recomputation they trigger and the advanced cursor commit together.

use tasksync_core::{Collection, CoreError, Hlc, SyncRecord, hlc::physical_now};
use tracing::{debug, trace};
use uuid::Uuid;

use super::categories::upsert_category;
use super::outbound::load_record;
use super::projects::upsert_project;
use super::subtasks::upsert_subtask;
use super::tasks::upsert_task;
use super::users::upsert_user;
use super::{ChangeOrigin, LocalStore, WriteCtx};
use crate::aggregate;
use crate::error::StorageError;
use crate::sync_state;

/// What happened to one inbound row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundOutcome {
    /// New locally.
    Inserted,
    /// Overwrote an older or equally old local row.
    Replaced,
    /// The local row is strictly newer and stays queued for push.
    KeptLocal,
    /// A remote tombstone removed the local row.
    Deleted,
    /// A remote tombstone lost to a newer local edit.
    Resurrected,
    /// The parent has not arrived yet; retried on later batches.
    Parked,
    /// The parent is tombstoned locally.
    Discarded,
    /// A tombstone for a row never seen locally.
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundReport {
    pub outcomes: Vec<(Uuid, InboundOutcome)>,
    /// The collection's cursor after the batch.
    pub cursor: Option<Hlc>,
}

impl InboundReport {
    pub fn count(&self, outcome: InboundOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }
}

/// Hard parents a row needs before it can be stored.
fn parents(record: &SyncRecord) -> Vec<(Collection, Uuid)> {
    match record {
        SyncRecord::User(_) => vec![],
        SyncRecord::Category(c) => vec![(Collection::Users, c.user_id.into())],
        SyncRecord::Project(p) => vec![(Collection::Users, p.user_id.into())],
        SyncRecord::Task(t) => vec![
            (Collection::Users, t.user_id.into()),
            (Collection::Projects, t.project_id.into()),
        ],
        SyncRecord::Subtask(s) => vec![(Collection::Tasks, s.task_id.into())],
    }
}

fn upsert(ctx: &WriteCtx<'_>, record: &SyncRecord) -> Result<(), StorageError> {
    match record {
        SyncRecord::User(r) => upsert_user(ctx.tx, r),
        SyncRecord::Category(r) => upsert_category(ctx.tx, r),
        SyncRecord::Project(r) => upsert_project(ctx.tx, r),
        SyncRecord::Task(r) => upsert_task(ctx.tx, r),
        SyncRecord::Subtask(r) => upsert_subtask(ctx.tx, r),
    }
}

/// Bring derived fields in line after `record` (and the row it replaced,
/// if any) changed.
fn refresh_derived(
    ctx: &mut WriteCtx<'_>,
    record: &SyncRecord,
    previous: Option<&SyncRecord>,
) -> Result<(), StorageError> {
    match (record, previous) {
        (SyncRecord::Project(p), _) => aggregate::recompute_project_counters(ctx, p.id),
        (SyncRecord::Task(t), prev) => {
            aggregate::recompute_task_progress(ctx, t.id)?;
            aggregate::recompute_project_counters(ctx, t.project_id)?;
            match prev {
                Some(SyncRecord::Task(old)) if old.project_id != t.project_id => {
                    aggregate::recompute_project_counters(ctx, old.project_id)
                }
                _ => Ok(()),
            }
        }
        (SyncRecord::Subtask(s), prev) => {
            aggregate::recompute_task_progress(ctx, s.task_id)?;
            match prev {
                Some(SyncRecord::Subtask(old)) if old.task_id != s.task_id => {
                    aggregate::recompute_task_progress(ctx, old.task_id)
                }
                _ => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

fn park(ctx: &WriteCtx<'_>, record: &SyncRecord) -> Result<(), StorageError> {
    ctx.tx.execute(
        "INSERT OR REPLACE INTO sync_parked (collection, entity_id, updated_at, body, parked_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            record.collection().as_str(),
            record.id().as_bytes().as_slice(),
            &record.updated_at().to_bytes()[..],
            record.to_msgpack()?,
            physical_now()? as i64,
        ],
    )?;
    Ok(())
}

/// Take every parked row of `collection` out of the parking table.
fn unpark(ctx: &WriteCtx<'_>, collection: Collection) -> Result<Vec<SyncRecord>, StorageError> {
    let parked = {
        let mut stmt = ctx.tx.prepare(
            "SELECT body FROM sync_parked WHERE collection = ?1 ORDER BY updated_at",
        )?;
        stmt.query_map([collection.as_str()], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?
    };
    ctx.tx
        .execute("DELETE FROM sync_parked WHERE collection = ?1", [collection.as_str()])?;
    parked
        .into_iter()
        .map(|body| Ok(SyncRecord::from_msgpack(&body)?))
        .collect()
}

fn apply_one(ctx: &mut WriteCtx<'_>, record: SyncRecord) -> Result<InboundOutcome, StorageError> {
    let collection = record.collection();
    let id = record.id();
    let remote_at = record.updated_at();
    ctx.observe_remote(remote_at)?;
    let local = ctx.row_meta(collection, id)?;
    // Any parked copy is superseded by this one.
    ctx.tx.execute(
        "DELETE FROM sync_parked WHERE collection = ?1 AND entity_id = ?2",
        rusqlite::params![collection.as_str(), id.as_bytes().as_slice()],
    )?;

    if record.deleted() {
        let Some((local_at, local_deleted)) = local else {
            return Ok(InboundOutcome::Ignored);
        };
        if local_at > remote_at {
            ctx.enqueue(collection, id, local_at)?;
            return Ok(if local_deleted {
                InboundOutcome::KeptLocal
            } else {
                InboundOutcome::Resurrected
            });
        }
        let previous = load_record(ctx.tx, collection, id)?;
        ctx.tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", collection.table()),
            [id.as_bytes().as_slice()],
        )?;
        ctx.drop_pending(collection, id)?;
        ctx.emit(collection, id, ChangeOrigin::Remote);
        for child in Collection::ALL.iter().filter(|c| **c > collection) {
            ctx.emit(*child, id, ChangeOrigin::Derived);
        }
        if let Some(previous) = previous {
            // The parent of the removed row lost a child.
            refresh_derived_after_removal(ctx, &previous)?;
        }
        return Ok(InboundOutcome::Deleted);
    }

    for (parent_collection, parent_id) in parents(&record) {
        match ctx.row_meta(parent_collection, parent_id)? {
            None => {
                park(ctx, &record)?;
                return Ok(InboundOutcome::Parked);
            }
            Some((_, true)) => return Ok(InboundOutcome::Discarded),
            Some((_, false)) => {}
        }
    }

    let outcome = match local {
        Some((local_at, _)) if local_at > remote_at => {
            ctx.enqueue(collection, id, local_at)?;
            return Ok(InboundOutcome::KeptLocal);
        }
        Some(_) => InboundOutcome::Replaced,
        None => InboundOutcome::Inserted,
    };
    let previous = match outcome {
        InboundOutcome::Replaced => load_record(ctx.tx, collection, id)?,
        _ => None,
    };
    upsert(ctx, &record)?;
    ctx.drop_pending(collection, id)?;
    ctx.emit(collection, id, ChangeOrigin::Remote);
    refresh_derived(ctx, &record, previous.as_ref())?;
    Ok(outcome)
}

fn refresh_derived_after_removal(
    ctx: &mut WriteCtx<'_>,
    removed: &SyncRecord,
) -> Result<(), StorageError> {
    match removed {
        SyncRecord::Task(t) => aggregate::recompute_project_counters(ctx, t.project_id),
        SyncRecord::Subtask(s) => aggregate::recompute_task_progress(ctx, s.task_id),
        _ => Ok(()),
    }
}

impl LocalStore {
    /// Apply one pulled batch for `collection` under last-write-wins, with
    /// ties going to the remote. Afterwards every parked row is retried,
    /// parents before children, in case this batch supplied its parent.
    pub fn apply_inbound_batch(
        &self,
        collection: Collection,
        mut records: Vec<SyncRecord>,
    ) -> Result<InboundReport, StorageError> {
        if let Some(stray) = records.iter().find(|r| r.collection() != collection) {
            return Err(CoreError::RecordMismatch(format!(
                "{} row {} in a {collection} batch",
                stray.collection(),
                stray.id()
            ))
            .into());
        }
        records.sort_by_key(|r| r.updated_at());
        let batch_max = records.last().map(|r| r.updated_at());

        let report = self.write(|ctx| {
            let mut outcomes = Vec::with_capacity(records.len());
            for record in records {
                let id = record.id();
                let outcome = apply_one(ctx, record)?;
                outcomes.push((id, outcome));
            }
            for parked_collection in Collection::ALL {
                for record in unpark(ctx, parked_collection)? {
                    let id = record.id();
                    let outcome = apply_one(ctx, record)?;
                    trace!(collection = %parked_collection, %id, ?outcome, "retried parked row");
                }
            }
            if let Some(max) = batch_max {
                sync_state::advance_cursor(ctx, collection, max)?;
            }
            let cursor = sync_state::load_sync_state(ctx.tx, collection)?.cursor;
            Ok(InboundReport { outcomes, cursor })
        })?;

        debug!(
            %collection,
            rows = report.outcomes.len(),
            parked = report.count(InboundOutcome::Parked),
            kept_local = report.count(InboundOutcome::KeptLocal),
            "applied inbound batch"
        );
        Ok(report)
    }

    /// Rows waiting for a parent, across all collections.
    pub fn parked_count(&self) -> Result<u64, StorageError> {
        self.read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM sync_parked", [], |row| row.get(0))?))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::TaskChanges;
    use super::*;
    use tasksync_core::{Priority, Subtask, SubtaskId, Task, TaskId, TaskStatus};

    /// Ahead of anything the local clock has issued, within drift limits.
    fn remote_stamp(counter: u32) -> Hlc {
        Hlc::new(physical_now().unwrap() + 1_000, counter)
    }

    fn remote_task(project: &tasksync_core::Project, title: &str, at: Hlc) -> Task {
        Task {
            id: TaskId::new(),
            user_id: project.user_id,
            project_id: project.id,
            title: title.into(),
            status: TaskStatus::Pending,
            priority: Priority::High,
            start_date: None,
            due_date: None,
            progress_percentage: 77,
            created_at: at,
            updated_at: at,
            deleted: false,
        }
    }

    #[test]
    fn insert_recomputes_counters_and_advances_cursor() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let at = remote_stamp(1);
        let mut done = remote_task(&alpha, "done", at);
        done.status = TaskStatus::Completed;

        let report = store
            .apply_inbound_batch(Collection::Tasks, vec![SyncRecord::Task(done.clone())])
            .unwrap();
        assert_eq!(report.outcomes, vec![(Uuid::from(done.id), InboundOutcome::Inserted)]);
        assert_eq!(report.cursor, Some(at));

        let stored = store.get_task(done.id).unwrap().unwrap();
        assert_eq!(stored.progress_percentage, 0, "derived field comes from local subtasks");
        let alpha = store.get_project(alpha.id).unwrap().unwrap();
        assert_eq!((alpha.task_count, alpha.completed_task_count), (1, 1));
        assert_eq!(store.pending_count(Collection::Tasks).unwrap(), 0);
    }

    #[test]
    fn newer_local_edit_survives_and_stays_queued() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let local = task(&store, &alpha, "local");
        let mut stale = local.clone();
        stale.title = "stale remote".into();
        stale.updated_at = Hlc::new(local.updated_at.wall_ms() - 1, 0);

        let report = store.apply_inbound_batch(Collection::Tasks, vec![SyncRecord::Task(stale)]).unwrap();
        assert_eq!(report.count(InboundOutcome::KeptLocal), 1);
        assert_eq!(store.get_task(local.id).unwrap().unwrap().title, "local");
        assert_eq!(pending_ids(&store, Collection::Tasks), vec![Uuid::from(local.id)]);
    }

    #[test]
    fn tie_goes_to_remote() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let local = task(&store, &alpha, "local");
        let mut same_stamp = local.clone();
        same_stamp.title = "remote".into();

        let report = store.apply_inbound_batch(Collection::Tasks, vec![SyncRecord::Task(same_stamp)]).unwrap();
        assert_eq!(report.count(InboundOutcome::Replaced), 1);
        assert_eq!(store.get_task(local.id).unwrap().unwrap().title, "remote");
        assert!(pending_ids(&store, Collection::Tasks).is_empty());
    }

    #[test]
    fn status_follow_up_is_stamped_after_the_remote_row() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let t = task(&store, &alpha, "done locally");
        let step = store
            .create_subtask(super::super::NewSubtask { task_id: t.id, text: "only".into() })
            .unwrap();
        store.set_subtask_completed(step.id, true).unwrap();
        let mut reopened = store.get_task(t.id).unwrap().unwrap();
        assert_eq!(reopened.status, TaskStatus::Completed);
        reopened.status = TaskStatus::Pending;
        reopened.updated_at = Hlc::new(physical_now().unwrap() + 3_000, 0);

        let report = store
            .apply_inbound_batch(Collection::Tasks, vec![SyncRecord::Task(reopened.clone())])
            .unwrap();
        assert_eq!(report.count(InboundOutcome::Replaced), 1);

        let stored = store.get_task(t.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.updated_at > reopened.updated_at);
        let queued = store.pending_outbound(Collection::Tasks, 10).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].updated_at, stored.updated_at);
    }

    #[test]
    fn remote_tombstone_removes_row_and_children() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let t = task(&store, &alpha, "doomed");
        let mut tombstone = t.clone();
        tombstone.deleted = true;
        tombstone.updated_at = remote_stamp(5);

        let report = store.apply_inbound_batch(Collection::Tasks, vec![SyncRecord::Task(tombstone)]).unwrap();
        assert_eq!(report.count(InboundOutcome::Deleted), 1);
        assert!(store.get_task(t.id).unwrap().is_none());
        assert_eq!(store.get_project(alpha.id).unwrap().unwrap().task_count, 0);
    }

    #[test]
    fn remote_tombstone_loses_to_newer_local_edit() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let t = task(&store, &alpha, "keep");
        let mut tombstone = t.clone();
        tombstone.deleted = true;
        store
            .update_task(t.id, TaskChanges { title: Some("edited".into()), ..Default::default() })
            .unwrap();

        let report = store.apply_inbound_batch(Collection::Tasks, vec![SyncRecord::Task(tombstone)]).unwrap();
        assert_eq!(report.count(InboundOutcome::Resurrected), 1);
        assert_eq!(store.get_task(t.id).unwrap().unwrap().title, "edited");
    }

    #[test]
    fn orphan_is_parked_until_parent_arrives() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let at = remote_stamp(1);
        let parent = remote_task(&alpha, "parent", at);
        let child = Subtask {
            id: SubtaskId::new(),
            task_id: parent.id,
            text: "child".into(),
            completed: true,
            created_at: at,
            updated_at: at,
            deleted: false,
        };

        let report = store.apply_inbound_batch(Collection::Subtasks, vec![SyncRecord::Subtask(child.clone())]).unwrap();
        assert_eq!(report.count(InboundOutcome::Parked), 1);
        assert_eq!(store.parked_count().unwrap(), 1);

        store.apply_inbound_batch(Collection::Tasks, vec![SyncRecord::Task(parent.clone())]).unwrap();
        assert_eq!(store.parked_count().unwrap(), 0);
        assert_eq!(store.query_subtasks(parent.id).unwrap(), vec![child]);
        assert_eq!(store.get_task(parent.id).unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn child_of_tombstoned_parent_is_discarded() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        store.delete_project(alpha.id).unwrap();
        let orphan = remote_task(&alpha, "late", remote_stamp(1));

        let report = store.apply_inbound_batch(Collection::Tasks, vec![SyncRecord::Task(orphan)]).unwrap();
        assert_eq!(report.count(InboundOutcome::Discarded), 1);
        assert_eq!(store.parked_count().unwrap(), 0);
    }

    #[test]
    fn mixed_collection_batch_is_rejected() {
        let (store, user, _) = seeded();
        let err = store
            .apply_inbound_batch(Collection::Tasks, vec![SyncRecord::User(user)])
            .unwrap_err();
        assert!(matches!(err, StorageError::Core(CoreError::RecordMismatch(_))));
    }
}

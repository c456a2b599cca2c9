use rusqlite::{Connection, OptionalExtension};
use tasksync_core::{Collection, Subtask, SubtaskId, TaskId};

use super::{LocalStore, Observation, hlc_col, uuid_col};
use crate::aggregate;
use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct NewSubtask {
    pub task_id: TaskId,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct SubtaskChanges {
    pub text: Option<String>,
    pub completed: Option<bool>,
}

const COLUMNS: &str = "id, task_id, text, completed, created_at, updated_at, deleted";

fn read_subtask(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subtask> {
    Ok(Subtask {
        id: SubtaskId::from_uuid(uuid_col(row, 0)?),
        task_id: TaskId::from_uuid(uuid_col(row, 1)?),
        text: row.get(2)?,
        completed: row.get(3)?,
        created_at: hlc_col(row, 4)?,
        updated_at: hlc_col(row, 5)?,
        deleted: row.get(6)?,
    })
}

pub(crate) fn load_subtask(conn: &Connection, id: SubtaskId) -> Result<Option<Subtask>, StorageError> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM subtasks WHERE id = ?1"),
            [id.as_bytes().as_slice()],
            read_subtask,
        )
        .optional()?)
}

pub(crate) fn upsert_subtask(conn: &Connection, subtask: &Subtask) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO subtasks (id, task_id, text, completed, created_at, updated_at, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            task_id = excluded.task_id, text = excluded.text, completed = excluded.completed,
            updated_at = excluded.updated_at, deleted = excluded.deleted",
        rusqlite::params![
            subtask.id.as_bytes().as_slice(),
            subtask.task_id.as_bytes().as_slice(),
            subtask.text,
            subtask.completed,
            &subtask.created_at.to_bytes()[..],
            &subtask.updated_at.to_bytes()[..],
            subtask.deleted,
        ],
    )
    .map_err(StorageError::from_write)?;
    Ok(())
}

fn task_subtasks(conn: &Connection, task_id: TaskId) -> Result<Vec<Subtask>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM subtasks WHERE task_id = ?1 AND deleted = 0 ORDER BY created_at"
    ))?;
    let rows = stmt
        .query_map([task_id.as_bytes().as_slice()], read_subtask)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl LocalStore {
    pub fn create_subtask(&self, new: NewSubtask) -> Result<Subtask, StorageError> {
        self.write(|ctx| {
            ctx.require_live(Collection::Tasks, new.task_id.into())?;
            let now = ctx.tick()?;
            let subtask = Subtask {
                id: SubtaskId::new(),
                task_id: new.task_id,
                text: new.text,
                completed: false,
                created_at: now,
                updated_at: now,
                deleted: false,
            };
            upsert_subtask(ctx.tx, &subtask)?;
            ctx.enqueue(Collection::Subtasks, subtask.id.into(), now)?;
            aggregate::recompute_task_progress(ctx, subtask.task_id)?;
            Ok(subtask)
        })
    }

    pub fn get_subtask(&self, id: SubtaskId) -> Result<Option<Subtask>, StorageError> {
        self.read(|conn| Ok(load_subtask(conn, id)?.filter(|s| !s.deleted)))
    }

    /// Live subtasks of one task, oldest first.
    pub fn query_subtasks(&self, task_id: TaskId) -> Result<Vec<Subtask>, StorageError> {
        self.read(|conn| task_subtasks(conn, task_id))
    }

    pub fn observe_task_subtasks(&self, task_id: TaskId) -> Observation<Subtask> {
        let store = self.clone();
        Observation::new(self, &[Collection::Subtasks], move || store.query_subtasks(task_id))
    }

    pub fn update_subtask(
        &self,
        id: SubtaskId,
        changes: SubtaskChanges,
    ) -> Result<Subtask, StorageError> {
        self.write(|ctx| {
            let mut subtask = load_subtask(ctx.tx, id)?
                .filter(|s| !s.deleted)
                .ok_or_else(|| StorageError::not_found(Collection::Subtasks, id))?;
            if let Some(text) = changes.text {
                subtask.text = text;
            }
            if let Some(completed) = changes.completed {
                subtask.completed = completed;
            }
            subtask.updated_at = ctx.tick()?;
            upsert_subtask(ctx.tx, &subtask)?;
            ctx.enqueue(Collection::Subtasks, id.into(), subtask.updated_at)?;
            aggregate::recompute_task_progress(ctx, subtask.task_id)?;
            Ok(subtask)
        })
    }

    pub fn set_subtask_completed(
        &self,
        id: SubtaskId,
        completed: bool,
    ) -> Result<Subtask, StorageError> {
        self.update_subtask(
            id,
            SubtaskChanges {
                completed: Some(completed),
                ..Default::default()
            },
        )
    }

    pub fn delete_subtask(&self, id: SubtaskId) -> Result<(), StorageError> {
        self.write(|ctx| {
            let mut subtask = load_subtask(ctx.tx, id)?
                .filter(|s| !s.deleted)
                .ok_or_else(|| StorageError::not_found(Collection::Subtasks, id))?;
            subtask.deleted = true;
            subtask.updated_at = ctx.tick()?;
            upsert_subtask(ctx.tx, &subtask)?;
            ctx.enqueue(Collection::Subtasks, id.into(), subtask.updated_at)?;
            aggregate::recompute_task_progress(ctx, subtask.task_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use tasksync_core::TaskStatus;

    fn subtask(store: &LocalStore, task_id: TaskId, text: &str) -> Subtask {
        store
            .create_subtask(NewSubtask { task_id, text: text.into() })
            .unwrap()
    }

    #[test]
    fn progress_and_status_follow_subtasks() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let t = task(&store, &alpha, "ship");
        let a = subtask(&store, t.id, "a");
        let b = subtask(&store, t.id, "b");

        store.set_subtask_completed(a.id, true).unwrap();
        let t1 = store.get_task(t.id).unwrap().unwrap();
        assert_eq!((t1.progress_percentage, t1.status), (50, TaskStatus::InProgress));
        assert!(t1.updated_at > t.updated_at);

        store.set_subtask_completed(b.id, true).unwrap();
        let t2 = store.get_task(t.id).unwrap().unwrap();
        assert_eq!((t2.progress_percentage, t2.status), (100, TaskStatus::Completed));
        let alpha = store.get_project(alpha.id).unwrap().unwrap();
        assert_eq!(alpha.progress_percentage, 100);

        store.set_subtask_completed(b.id, false).unwrap();
        let t3 = store.get_task(t.id).unwrap().unwrap();
        assert_eq!((t3.progress_percentage, t3.status), (50, TaskStatus::InProgress));
        assert_eq!(store.get_project(alpha.id).unwrap().unwrap().completed_task_count, 0);
    }

    #[test]
    fn untouched_subtasks_leave_status_alone() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let t = task(&store, &alpha, "ship");
        subtask(&store, t.id, "a");

        let after = store.get_task(t.id).unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Pending);
        assert_eq!(after.progress_percentage, 0);
        assert_eq!(after.updated_at, t.updated_at);
    }

    #[test]
    fn deleting_the_last_open_subtask_completes_the_task() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let t = task(&store, &alpha, "ship");
        let done = subtask(&store, t.id, "done");
        let open = subtask(&store, t.id, "open");
        store.set_subtask_completed(done.id, true).unwrap();

        store.delete_subtask(open.id).unwrap();
        let t = store.get_task(t.id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(store.query_subtasks(t.id).unwrap().len(), 1);
    }

    #[test]
    fn deleting_a_task_removes_its_subtasks() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let t = task(&store, &alpha, "ship");
        let s = subtask(&store, t.id, "a");

        store.delete_task(t.id).unwrap();
        assert!(store.get_subtask(s.id).unwrap().is_none());
        let err = store.create_subtask(NewSubtask { task_id: t.id, text: "x".into() }).unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn observation_follows_one_task() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let t = task(&store, &alpha, "ship");
        let other = task(&store, &alpha, "other");
        let mut live = store.observe_task_subtasks(t.id);
        assert!(live.next().await.unwrap().unwrap().is_empty());

        subtask(&store, other.id, "elsewhere");
        subtask(&store, t.id, "here");
        let rows = live.next().await.unwrap().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "here");
    }
}

use rusqlite::{Connection, OptionalExtension};
use tasksync_core::{Collection, Priority, ProjectId, Task, TaskId, TaskStatus, UserId};

use super::{ChangeOrigin, LocalStore, Observation, conversion_error, hlc_col, uuid_col};
use crate::aggregate;
use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub start_date: Option<i64>,
    pub due_date: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskChanges {
    pub title: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub start_date: Option<Option<i64>>,
    pub due_date: Option<Option<i64>>,
    /// Move the task to another project.
    pub project_id: Option<ProjectId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaskOrder {
    #[default]
    CreatedAsc,
    CreatedDesc,
    /// Earliest due first; undated tasks last.
    DueDate,
    PriorityDesc,
}

impl TaskOrder {
    fn sql(&self) -> &'static str {
        match self {
            Self::CreatedAsc => "created_at ASC",
            Self::CreatedDesc => "created_at DESC",
            Self::DueDate => "due_date IS NULL, due_date ASC, created_at ASC",
            Self::PriorityDesc => {
                "CASE priority WHEN 'high' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END, created_at ASC"
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub project_id: Option<ProjectId>,
    pub user_id: Option<UserId>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub include_deleted: bool,
    pub order: TaskOrder,
    pub limit: Option<usize>,
}

const COLUMNS: &str = "id, user_id, project_id, title, status, priority, start_date, due_date, \
     progress_percentage, created_at, updated_at, deleted";

fn read_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(4)?;
    let priority: String = row.get(5)?;
    Ok(Task {
        id: TaskId::from_uuid(uuid_col(row, 0)?),
        user_id: UserId::from_uuid(uuid_col(row, 1)?),
        project_id: ProjectId::from_uuid(uuid_col(row, 2)?),
        title: row.get(3)?,
        status: TaskStatus::parse(&status).map_err(|e| conversion_error(4, e))?,
        priority: Priority::parse(&priority).map_err(|e| conversion_error(5, e))?,
        start_date: row.get(6)?,
        due_date: row.get(7)?,
        progress_percentage: row.get(8)?,
        created_at: hlc_col(row, 9)?,
        updated_at: hlc_col(row, 10)?,
        deleted: row.get(11)?,
    })
}

pub(crate) fn load_task(conn: &Connection, id: TaskId) -> Result<Option<Task>, StorageError> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
            [id.as_bytes().as_slice()],
            read_task,
        )
        .optional()?)
}

/// Like projects, `progress_percentage` is only written on first insert.
pub(crate) fn upsert_task(conn: &Connection, task: &Task) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO tasks (id, user_id, project_id, title, status, priority, start_date, due_date,
                            progress_percentage, created_at, updated_at, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
            user_id = excluded.user_id, project_id = excluded.project_id, title = excluded.title,
            status = excluded.status, priority = excluded.priority,
            start_date = excluded.start_date, due_date = excluded.due_date,
            updated_at = excluded.updated_at, deleted = excluded.deleted",
        rusqlite::params![
            task.id.as_bytes().as_slice(),
            task.user_id.as_bytes().as_slice(),
            task.project_id.as_bytes().as_slice(),
            task.title,
            task.status.as_str(),
            task.priority.as_str(),
            task.start_date,
            task.due_date,
            &task.created_at.to_bytes()[..],
            &task.updated_at.to_bytes()[..],
            task.deleted,
        ],
    )
    .map_err(StorageError::from_write)?;
    Ok(())
}

fn query_tasks(conn: &Connection, query: &TaskQuery) -> Result<Vec<Task>, StorageError> {
    let mut sql = format!("SELECT {COLUMNS} FROM tasks WHERE 1 = 1");
    let mut params: Vec<rusqlite::types::Value> = Vec::new();
    if !query.include_deleted {
        sql.push_str(" AND deleted = 0");
    }
    if let Some(project_id) = query.project_id {
        params.push(project_id.as_bytes().to_vec().into());
        sql.push_str(&format!(" AND project_id = ?{}", params.len()));
    }
    if let Some(user_id) = query.user_id {
        params.push(user_id.as_bytes().to_vec().into());
        sql.push_str(&format!(" AND user_id = ?{}", params.len()));
    }
    if let Some(status) = query.status {
        params.push(status.as_str().to_owned().into());
        sql.push_str(&format!(" AND status = ?{}", params.len()));
    }
    if let Some(priority) = query.priority {
        params.push(priority.as_str().to_owned().into());
        sql.push_str(&format!(" AND priority = ?{}", params.len()));
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(query.order.sql());
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), read_task)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl LocalStore {
    pub fn create_task(&self, new: NewTask) -> Result<Task, StorageError> {
        self.write(|ctx| {
            ctx.require_live(Collection::Users, new.user_id.into())?;
            ctx.require_live(Collection::Projects, new.project_id.into())?;
            let now = ctx.tick()?;
            let task = Task {
                id: TaskId::new(),
                user_id: new.user_id,
                project_id: new.project_id,
                title: new.title,
                status: new.status,
                priority: new.priority,
                start_date: new.start_date,
                due_date: new.due_date,
                progress_percentage: 0,
                created_at: now,
                updated_at: now,
                deleted: false,
            };
            upsert_task(ctx.tx, &task)?;
            ctx.enqueue(Collection::Tasks, task.id.into(), now)?;
            aggregate::recompute_project_counters(ctx, task.project_id)?;
            Ok(task)
        })
    }

    pub fn get_task(&self, id: TaskId) -> Result<Option<Task>, StorageError> {
        self.read(|conn| Ok(load_task(conn, id)?.filter(|t| !t.deleted)))
    }

    pub fn query_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, StorageError> {
        self.read(|conn| query_tasks(conn, query))
    }

    pub fn observe_tasks(&self, query: TaskQuery) -> Observation<Task> {
        let store = self.clone();
        Observation::new(self, &[Collection::Tasks], move || store.query_tasks(&query))
    }

    /// Live tasks of one project, oldest first.
    pub fn project_tasks(&self, project_id: ProjectId) -> Result<Vec<Task>, StorageError> {
        self.query_tasks(&TaskQuery {
            project_id: Some(project_id),
            ..Default::default()
        })
    }

    pub fn observe_project_tasks(&self, project_id: ProjectId) -> Observation<Task> {
        self.observe_tasks(TaskQuery {
            project_id: Some(project_id),
            ..Default::default()
        })
    }

    pub fn update_task(&self, id: TaskId, changes: TaskChanges) -> Result<Task, StorageError> {
        self.write(|ctx| {
            let mut task = load_task(ctx.tx, id)?
                .filter(|t| !t.deleted)
                .ok_or_else(|| StorageError::not_found(Collection::Tasks, id))?;
            let previous_project = task.project_id;
            if let Some(project_id) = changes.project_id {
                ctx.require_live(Collection::Projects, project_id.into())?;
                task.project_id = project_id;
            }
            if let Some(title) = changes.title {
                task.title = title;
            }
            if let Some(status) = changes.status {
                task.status = status;
            }
            if let Some(priority) = changes.priority {
                task.priority = priority;
            }
            if let Some(start_date) = changes.start_date {
                task.start_date = start_date;
            }
            if let Some(due_date) = changes.due_date {
                task.due_date = due_date;
            }
            task.updated_at = ctx.tick()?;
            upsert_task(ctx.tx, &task)?;
            ctx.enqueue(Collection::Tasks, id.into(), task.updated_at)?;
            aggregate::recompute_project_counters(ctx, task.project_id)?;
            if previous_project != task.project_id {
                aggregate::recompute_project_counters(ctx, previous_project)?;
            }
            Ok(task)
        })
    }

    /// Tombstone the task and remove its subtasks.
    pub fn delete_task(&self, id: TaskId) -> Result<(), StorageError> {
        self.write(|ctx| {
            let mut task = load_task(ctx.tx, id)?
                .filter(|t| !t.deleted)
                .ok_or_else(|| StorageError::not_found(Collection::Tasks, id))?;
            task.deleted = true;
            task.updated_at = ctx.tick()?;
            upsert_task(ctx.tx, &task)?;
            let removed = ctx
                .tx
                .execute("DELETE FROM subtasks WHERE task_id = ?1", [id.as_bytes().as_slice()])?;
            if removed > 0 {
                ctx.emit(Collection::Subtasks, id.into(), ChangeOrigin::Derived);
            }
            ctx.enqueue(Collection::Tasks, id.into(), task.updated_at)?;
            aggregate::recompute_project_counters(ctx, task.project_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn create_requires_live_project() {
        let (store, user, category) = seeded();
        let project = project(&store, &user, &category, "Alpha");
        store.delete_project(project.id).unwrap();
        let err = store
            .create_task(NewTask {
                user_id: user.id,
                project_id: project.id,
                title: "late".into(),
                status: TaskStatus::Pending,
                priority: Priority::Low,
                start_date: None,
                due_date: None,
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation(_)));
    }

    #[test]
    fn status_changes_move_project_counters() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let a = task(&store, &alpha, "a");
        task(&store, &alpha, "b");

        store
            .update_task(a.id, TaskChanges { status: Some(TaskStatus::Completed), ..Default::default() })
            .unwrap();
        let alpha = store.get_project(alpha.id).unwrap().unwrap();
        assert_eq!((alpha.task_count, alpha.completed_task_count, alpha.progress_percentage), (2, 1, 50));

        store.delete_task(a.id).unwrap();
        let alpha = store.get_project(alpha.id).unwrap().unwrap();
        assert_eq!((alpha.task_count, alpha.completed_task_count, alpha.progress_percentage), (1, 0, 0));
    }

    #[test]
    fn moving_a_task_updates_both_projects() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let beta = project(&store, &user, &category, "Beta");
        let t = task(&store, &alpha, "wander");

        store
            .update_task(t.id, TaskChanges { project_id: Some(beta.id), ..Default::default() })
            .unwrap();
        assert_eq!(store.get_project(alpha.id).unwrap().unwrap().task_count, 0);
        assert_eq!(store.get_project(beta.id).unwrap().unwrap().task_count, 1);
        assert_eq!(store.project_tasks(beta.id).unwrap()[0].id, t.id);
    }

    #[test]
    fn derived_recompute_does_not_touch_project_stamp() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        task(&store, &alpha, "a");
        let after = store.get_project(alpha.id).unwrap().unwrap();
        assert_eq!(after.updated_at, alpha.updated_at);
        assert_eq!(after.task_count, 1);
    }

    #[test]
    fn filters_and_orders() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let low = task(&store, &alpha, "low");
        let high = task(&store, &alpha, "high");
        store
            .update_task(low.id, TaskChanges { priority: Some(Priority::Low), due_date: Some(Some(10)), ..Default::default() })
            .unwrap();
        store
            .update_task(high.id, TaskChanges { priority: Some(Priority::High), ..Default::default() })
            .unwrap();

        let by_priority = store
            .query_tasks(&TaskQuery { order: TaskOrder::PriorityDesc, ..Default::default() })
            .unwrap();
        assert_eq!(by_priority[0].id, high.id);

        let by_due = store
            .query_tasks(&TaskQuery { order: TaskOrder::DueDate, ..Default::default() })
            .unwrap();
        assert_eq!(by_due[0].id, low.id);

        let only_high = store
            .query_tasks(&TaskQuery { priority: Some(Priority::High), ..Default::default() })
            .unwrap();
        assert_eq!(only_high.len(), 1);
    }

    #[test]
    fn delete_is_a_pending_tombstone() {
        let (store, user, category) = seeded();
        let alpha = project(&store, &user, &category, "Alpha");
        let t = task(&store, &alpha, "gone");
        store.delete_task(t.id).unwrap();

        assert!(store.get_task(t.id).unwrap().is_none());
        assert!(pending_ids(&store, Collection::Tasks).contains(&t.id.into()));
        let all = store
            .query_tasks(&TaskQuery { include_deleted: true, ..Default::default() })
            .unwrap();
        assert!(all[0].deleted);
    }
}

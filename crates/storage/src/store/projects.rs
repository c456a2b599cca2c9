use rusqlite::{Connection, OptionalExtension};
use tasksync_core::{CategoryId, Collection, Project, ProjectId, UserId};

use super::{ChangeOrigin, LocalStore, Observation, hlc_col, uuid_col};
use crate::aggregate;
use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct NewProject {
    pub user_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub color: String,
    pub category_id: CategoryId,
}

/// Authored fields only; the task counters cannot be set from here.
#[derive(Debug, Clone, Default)]
pub struct ProjectChanges {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub color: Option<String>,
    pub category_id: Option<CategoryId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProjectOrder {
    #[default]
    CreatedAsc,
    CreatedDesc,
    Name,
    ProgressDesc,
}

impl ProjectOrder {
    fn sql(&self) -> &'static str {
        match self {
            Self::CreatedAsc => "created_at ASC",
            Self::CreatedDesc => "created_at DESC",
            Self::Name => "name COLLATE NOCASE ASC, created_at ASC",
            Self::ProgressDesc => "progress_percentage DESC, created_at ASC",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProjectQuery {
    pub user_id: Option<UserId>,
    pub category_id: Option<CategoryId>,
    pub include_deleted: bool,
    pub order: ProjectOrder,
    pub limit: Option<usize>,
}

const COLUMNS: &str = "id, user_id, name, description, color, category_id, task_count, \
     completed_task_count, progress_percentage, created_at, updated_at, deleted";

fn read_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: ProjectId::from_uuid(uuid_col(row, 0)?),
        user_id: UserId::from_uuid(uuid_col(row, 1)?),
        name: row.get(2)?,
        description: row.get(3)?,
        color: row.get(4)?,
        category_id: CategoryId::from_uuid(uuid_col(row, 5)?),
        task_count: row.get(6)?,
        completed_task_count: row.get(7)?,
        progress_percentage: row.get(8)?,
        created_at: hlc_col(row, 9)?,
        updated_at: hlc_col(row, 10)?,
        deleted: row.get(11)?,
    })
}

pub(crate) fn load_project(conn: &Connection, id: ProjectId) -> Result<Option<Project>, StorageError> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM projects WHERE id = ?1"),
            [id.as_bytes().as_slice()],
            read_project,
        )
        .optional()?)
}

/// Insert or overwrite the authored columns. Derived counters are written on
/// first insert only and afterwards belong to the aggregation step.
pub(crate) fn upsert_project(conn: &Connection, project: &Project) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO projects (id, user_id, name, description, color, category_id, task_count,
                               completed_task_count, progress_percentage, created_at, updated_at, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, 0, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            user_id = excluded.user_id, name = excluded.name, description = excluded.description,
            color = excluded.color, category_id = excluded.category_id,
            updated_at = excluded.updated_at, deleted = excluded.deleted",
        rusqlite::params![
            project.id.as_bytes().as_slice(),
            project.user_id.as_bytes().as_slice(),
            project.name,
            project.description,
            project.color,
            project.category_id.as_bytes().as_slice(),
            &project.created_at.to_bytes()[..],
            &project.updated_at.to_bytes()[..],
            project.deleted,
        ],
    )
    .map_err(StorageError::from_write)?;
    Ok(())
}

fn query_projects(conn: &Connection, query: &ProjectQuery) -> Result<Vec<Project>, StorageError> {
    let mut sql = format!("SELECT {COLUMNS} FROM projects WHERE 1 = 1");
    let mut params: Vec<Vec<u8>> = Vec::new();
    if !query.include_deleted {
        sql.push_str(" AND deleted = 0");
    }
    if let Some(user_id) = query.user_id {
        params.push(user_id.as_bytes().to_vec());
        sql.push_str(&format!(" AND user_id = ?{}", params.len()));
    }
    if let Some(category_id) = query.category_id {
        params.push(category_id.as_bytes().to_vec());
        sql.push_str(&format!(" AND category_id = ?{}", params.len()));
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(query.order.sql());
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), read_project)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl LocalStore {
    pub fn create_project(&self, new: NewProject) -> Result<Project, StorageError> {
        self.write(|ctx| {
            ctx.require_live(Collection::Users, new.user_id.into())?;
            ctx.require_live(Collection::Categories, new.category_id.into())?;
            let now = ctx.tick()?;
            let project = Project {
                id: ProjectId::new(),
                user_id: new.user_id,
                name: new.name,
                description: new.description,
                color: new.color,
                category_id: new.category_id,
                task_count: 0,
                completed_task_count: 0,
                progress_percentage: 0,
                created_at: now,
                updated_at: now,
                deleted: false,
            };
            upsert_project(ctx.tx, &project)?;
            ctx.enqueue(Collection::Projects, project.id.into(), now)?;
            Ok(project)
        })
    }

    pub fn get_project(&self, id: ProjectId) -> Result<Option<Project>, StorageError> {
        self.read(|conn| Ok(load_project(conn, id)?.filter(|p| !p.deleted)))
    }

    pub fn query_projects(&self, query: &ProjectQuery) -> Result<Vec<Project>, StorageError> {
        self.read(|conn| query_projects(conn, query))
    }

    /// Re-emits on task changes too, since they move the derived counters.
    pub fn observe_projects(&self, query: ProjectQuery) -> Observation<Project> {
        let store = self.clone();
        Observation::new(self, &[Collection::Projects, Collection::Tasks], move || {
            store.query_projects(&query)
        })
    }

    pub fn update_project(
        &self,
        id: ProjectId,
        changes: ProjectChanges,
    ) -> Result<Project, StorageError> {
        self.write(|ctx| {
            let mut project = load_project(ctx.tx, id)?
                .filter(|p| !p.deleted)
                .ok_or_else(|| StorageError::not_found(Collection::Projects, id))?;
            if let Some(category_id) = changes.category_id {
                ctx.require_live(Collection::Categories, category_id.into())?;
                project.category_id = category_id;
            }
            if let Some(name) = changes.name {
                project.name = name;
            }
            if let Some(description) = changes.description {
                project.description = description;
            }
            if let Some(color) = changes.color {
                project.color = color;
            }
            project.updated_at = ctx.tick()?;
            upsert_project(ctx.tx, &project)?;
            ctx.enqueue(Collection::Projects, id.into(), project.updated_at)?;
            Ok(project)
        })
    }

    /// Tombstone the project; its tasks (and their subtasks) are removed.
    pub fn delete_project(&self, id: ProjectId) -> Result<(), StorageError> {
        self.write(|ctx| {
            let mut project = load_project(ctx.tx, id)?
                .filter(|p| !p.deleted)
                .ok_or_else(|| StorageError::not_found(Collection::Projects, id))?;
            project.deleted = true;
            project.updated_at = ctx.tick()?;
            upsert_project(ctx.tx, &project)?;
            let removed = ctx
                .tx
                .execute("DELETE FROM tasks WHERE project_id = ?1", [id.as_bytes().as_slice()])?;
            if removed > 0 {
                ctx.emit(Collection::Tasks, id.into(), ChangeOrigin::Derived);
                ctx.emit(Collection::Subtasks, id.into(), ChangeOrigin::Derived);
            }
            aggregate::recompute_project_counters(ctx, id)?;
            ctx.enqueue(Collection::Projects, id.into(), project.updated_at)?;
            Ok(())
        })
    }

    /// Recalculate `task_count`, `completed_task_count` and
    /// `progress_percentage` from the project's live tasks.
    pub fn recompute_project_counters(&self, id: ProjectId) -> Result<Project, StorageError> {
        self.write(|ctx| {
            aggregate::recompute_project_counters(ctx, id)?;
            load_project(ctx.tx, id)?.ok_or_else(|| StorageError::not_found(Collection::Projects, id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::NewCategory;
    use super::*;

    #[test]
    fn create_requires_existing_category() {
        let (store, user, _) = seeded();
        let err = store
            .create_project(NewProject {
                user_id: user.id,
                name: "Ghost".into(),
                description: None,
                color: "#000".into(),
                category_id: CategoryId::new(),
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation(_)));
    }

    #[test]
    fn new_project_has_zero_progress() {
        let (store, user, category) = seeded();
        let project = project(&store, &user, &category, "Alpha");
        assert_eq!(project.task_count, 0);
        assert_eq!(project.progress_percentage, 0);
        assert_eq!(store.get_project(project.id).unwrap(), Some(project));
    }

    #[test]
    fn update_moves_between_categories() {
        let (store, user, category) = seeded();
        let other = store.create_category(NewCategory { user_id: user.id, name: "Home".into() }).unwrap();
        let project = project(&store, &user, &category, "Alpha");

        let moved = store
            .update_project(project.id, ProjectChanges { category_id: Some(other.id), ..Default::default() })
            .unwrap();
        assert_eq!(moved.category_id, other.id);
        assert!(moved.updated_at > project.updated_at);

        let in_other = store
            .query_projects(&ProjectQuery { category_id: Some(other.id), ..Default::default() })
            .unwrap();
        assert_eq!(in_other.len(), 1);
    }

    #[test]
    fn delete_tombstones_and_removes_tasks() {
        let (store, user, category) = seeded();
        let project = project(&store, &user, &category, "Alpha");
        let t = task(&store, &project, "one");

        store.delete_project(project.id).unwrap();
        assert!(store.get_project(project.id).unwrap().is_none());
        assert!(store.get_task(t.id).unwrap().is_none());
        let tombstones = store
            .query_projects(&ProjectQuery { include_deleted: true, ..Default::default() })
            .unwrap();
        assert_eq!(tombstones.len(), 1);
        assert!(tombstones[0].deleted);

        let err = store.update_project(project.id, ProjectChanges::default()).unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[test]
    fn order_and_limit() {
        let (store, user, category) = seeded();
        project(&store, &user, &category, "beta");
        project(&store, &user, &category, "Alpha");
        project(&store, &user, &category, "gamma");

        let names: Vec<String> = store
            .query_projects(&ProjectQuery { order: ProjectOrder::Name, limit: Some(2), ..Default::default() })
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "beta"]);

        let newest = store
            .query_projects(&ProjectQuery { order: ProjectOrder::CreatedDesc, limit: Some(1), ..Default::default() })
            .unwrap();
        assert_eq!(newest[0].name, "gamma");
    }
}

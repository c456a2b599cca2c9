use rusqlite::{Connection, OptionalExtension};
use tasksync_core::{Category, CategoryId, Collection, UserId};

use super::{LocalStore, Observation, hlc_col, uuid_col};
use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct NewCategory {
    pub user_id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct CategoryChanges {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CategoryQuery {
    pub user_id: Option<UserId>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

const COLUMNS: &str = "id, user_id, name, created_at, updated_at, deleted";

fn read_category(row: &rusqlite::Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: CategoryId::from_uuid(uuid_col(row, 0)?),
        user_id: UserId::from_uuid(uuid_col(row, 1)?),
        name: row.get(2)?,
        created_at: hlc_col(row, 3)?,
        updated_at: hlc_col(row, 4)?,
        deleted: row.get(5)?,
    })
}

pub(crate) fn load_category(conn: &Connection, id: CategoryId) -> Result<Option<Category>, StorageError> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM categories WHERE id = ?1"),
            [id.as_bytes().as_slice()],
            read_category,
        )
        .optional()?)
}

pub(crate) fn upsert_category(conn: &Connection, category: &Category) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO categories (id, user_id, name, created_at, updated_at, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            user_id = excluded.user_id, name = excluded.name,
            updated_at = excluded.updated_at, deleted = excluded.deleted",
        rusqlite::params![
            category.id.as_bytes().as_slice(),
            category.user_id.as_bytes().as_slice(),
            category.name,
            &category.created_at.to_bytes()[..],
            &category.updated_at.to_bytes()[..],
            category.deleted,
        ],
    )
    .map_err(StorageError::from_write)?;
    Ok(())
}

fn query_categories(conn: &Connection, query: &CategoryQuery) -> Result<Vec<Category>, StorageError> {
    let mut sql = format!("SELECT {COLUMNS} FROM categories WHERE 1 = 1");
    let mut params: Vec<Vec<u8>> = Vec::new();
    if !query.include_deleted {
        sql.push_str(" AND deleted = 0");
    }
    if let Some(user_id) = query.user_id {
        params.push(user_id.as_bytes().to_vec());
        sql.push_str(&format!(" AND user_id = ?{}", params.len()));
    }
    sql.push_str(" ORDER BY name COLLATE NOCASE, created_at");
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), read_category)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl LocalStore {
    pub fn create_category(&self, new: NewCategory) -> Result<Category, StorageError> {
        self.write(|ctx| {
            ctx.require_live(Collection::Users, new.user_id.into())?;
            let now = ctx.tick()?;
            let category = Category {
                id: CategoryId::new(),
                user_id: new.user_id,
                name: new.name,
                created_at: now,
                updated_at: now,
                deleted: false,
            };
            upsert_category(ctx.tx, &category)?;
            ctx.enqueue(Collection::Categories, category.id.into(), now)?;
            Ok(category)
        })
    }

    pub fn get_category(&self, id: CategoryId) -> Result<Option<Category>, StorageError> {
        self.read(|conn| Ok(load_category(conn, id)?.filter(|c| !c.deleted)))
    }

    pub fn query_categories(&self, query: &CategoryQuery) -> Result<Vec<Category>, StorageError> {
        self.read(|conn| query_categories(conn, query))
    }

    pub fn observe_categories(&self, query: CategoryQuery) -> Observation<Category> {
        let store = self.clone();
        Observation::new(self, &[Collection::Categories], move || {
            store.query_categories(&query)
        })
    }

    pub fn update_category(
        &self,
        id: CategoryId,
        changes: CategoryChanges,
    ) -> Result<Category, StorageError> {
        self.write(|ctx| {
            let mut category = load_category(ctx.tx, id)?
                .filter(|c| !c.deleted)
                .ok_or_else(|| StorageError::not_found(Collection::Categories, id))?;
            if let Some(name) = changes.name {
                category.name = name;
            }
            category.updated_at = ctx.tick()?;
            upsert_category(ctx.tx, &category)?;
            ctx.enqueue(Collection::Categories, id.into(), category.updated_at)?;
            Ok(category)
        })
    }

    /// Refused with `ReferentialGuard` while any live project uses the category.
    pub fn delete_category(&self, id: CategoryId) -> Result<(), StorageError> {
        self.write(|ctx| {
            let mut category = load_category(ctx.tx, id)?
                .filter(|c| !c.deleted)
                .ok_or_else(|| StorageError::not_found(Collection::Categories, id))?;
            let project_count: u64 = ctx.tx.query_row(
                "SELECT COUNT(*) FROM projects WHERE category_id = ?1 AND deleted = 0",
                [id.as_bytes().as_slice()],
                |row| row.get(0),
            )?;
            if project_count > 0 {
                return Err(StorageError::ReferentialGuard {
                    category_id: id.to_string(),
                    project_count,
                });
            }
            category.deleted = true;
            category.updated_at = ctx.tick()?;
            upsert_category(ctx.tx, &category)?;
            ctx.enqueue(Collection::Categories, id.into(), category.updated_at)?;
            Ok(())
        })
    }
}

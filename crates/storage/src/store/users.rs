use rusqlite::{Connection, OptionalExtension};
use tasksync_core::{Collection, User, UserId};

use super::{ChangeOrigin, LocalStore, WriteCtx, hlc_col, uuid_col};
use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct NewUser {
    /// Stable identity from the auth provider; generated when absent.
    pub id: Option<UserId>,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub profile_image_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub profile_image_url: Option<Option<String>>,
}

const COLUMNS: &str =
    "id, first_name, last_name, email, profile_image_url, created_at, updated_at, deleted";

fn read_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId::from_uuid(uuid_col(row, 0)?),
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        profile_image_url: row.get(4)?,
        created_at: hlc_col(row, 5)?,
        updated_at: hlc_col(row, 6)?,
        deleted: row.get(7)?,
    })
}

pub(crate) fn load_user(conn: &Connection, id: UserId) -> Result<Option<User>, StorageError> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM users WHERE id = ?1"),
            [id.as_bytes().as_slice()],
            read_user,
        )
        .optional()?)
}

pub(crate) fn upsert_user(conn: &Connection, user: &User) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO users (id, first_name, last_name, email, profile_image_url, created_at, updated_at, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            first_name = excluded.first_name, last_name = excluded.last_name,
            email = excluded.email, profile_image_url = excluded.profile_image_url,
            updated_at = excluded.updated_at, deleted = excluded.deleted",
        rusqlite::params![
            user.id.as_bytes().as_slice(),
            user.first_name,
            user.last_name,
            user.email,
            user.profile_image_url,
            &user.created_at.to_bytes()[..],
            &user.updated_at.to_bytes()[..],
            user.deleted,
        ],
    )
    .map_err(StorageError::from_write)?;
    Ok(())
}

fn live_user(ctx: &WriteCtx<'_>, id: UserId) -> Result<User, StorageError> {
    load_user(ctx.tx, id)?
        .filter(|u| !u.deleted)
        .ok_or_else(|| StorageError::not_found(Collection::Users, id))
}

impl LocalStore {
    pub fn create_user(&self, new: NewUser) -> Result<User, StorageError> {
        self.write(|ctx| {
            let now = ctx.tick()?;
            let user = User {
                id: new.id.unwrap_or_default(),
                first_name: new.first_name,
                last_name: new.last_name,
                email: new.email,
                profile_image_url: new.profile_image_url,
                created_at: now,
                updated_at: now,
                deleted: false,
            };
            if load_user(ctx.tx, user.id)?.is_some() {
                return Err(StorageError::ConstraintViolation(format!(
                    "user {} already exists",
                    user.id
                )));
            }
            upsert_user(ctx.tx, &user)?;
            ctx.enqueue(Collection::Users, user.id.into(), now)?;
            Ok(user)
        })
    }

    pub fn get_user(&self, id: UserId) -> Result<Option<User>, StorageError> {
        self.read(|conn| Ok(load_user(conn, id)?.filter(|u| !u.deleted)))
    }

    pub fn list_users(&self) -> Result<Vec<User>, StorageError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM users WHERE deleted = 0 ORDER BY created_at"
            ))?;
            let users = stmt.query_map([], read_user)?.collect::<Result<Vec<_>, _>>()?;
            Ok(users)
        })
    }

    pub fn update_user(&self, id: UserId, changes: UserChanges) -> Result<User, StorageError> {
        self.write(|ctx| {
            let mut user = live_user(ctx, id)?;
            if let Some(v) = changes.first_name {
                user.first_name = v;
            }
            if let Some(v) = changes.last_name {
                user.last_name = v;
            }
            if let Some(v) = changes.email {
                user.email = v;
            }
            if let Some(v) = changes.profile_image_url {
                user.profile_image_url = v;
            }
            user.updated_at = ctx.tick()?;
            upsert_user(ctx.tx, &user)?;
            ctx.enqueue(Collection::Users, id.into(), user.updated_at)?;
            Ok(user)
        })
    }

    /// Account deletion: tombstone the user and hard-delete everything it owns.
    pub fn delete_user(&self, id: UserId) -> Result<(), StorageError> {
        self.write(|ctx| {
            let mut user = live_user(ctx, id)?;
            user.deleted = true;
            user.updated_at = ctx.tick()?;
            upsert_user(ctx.tx, &user)?;

            let owner = id.as_bytes().as_slice();
            // Project deletion cascades to tasks and subtasks.
            ctx.tx.execute("DELETE FROM projects WHERE user_id = ?1", [owner])?;
            ctx.tx.execute("DELETE FROM tasks WHERE user_id = ?1", [owner])?;
            ctx.tx.execute("DELETE FROM categories WHERE user_id = ?1", [owner])?;
            for collection in [Collection::Categories, Collection::Projects, Collection::Tasks, Collection::Subtasks] {
                ctx.emit(collection, id.into(), ChangeOrigin::Derived);
            }

            ctx.enqueue(Collection::Users, id.into(), user.updated_at)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn create_with_external_identity() {
        let store = store();
        let id = UserId::new();
        let user = store
            .create_user(NewUser {
                id: Some(id),
                first_name: "Grace".into(),
                last_name: "Hopper".into(),
                email: "grace@example.com".into(),
                profile_image_url: Some("https://img/grace.png".into()),
            })
            .unwrap();
        assert_eq!(user.id, id);
        assert_eq!(store.get_user(id).unwrap(), Some(user));
        assert_eq!(pending_ids(&store, Collection::Users), vec![uuid::Uuid::from(id)]);
    }

    #[test]
    fn duplicate_identity_is_a_constraint_violation() {
        let (store, user, _) = seeded();
        let err = store
            .create_user(NewUser {
                id: Some(user.id),
                first_name: "Dup".into(),
                last_name: "Licate".into(),
                email: "dup@example.com".into(),
                profile_image_url: None,
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation(_)));
    }

    #[test]
    fn update_clears_optional_field() {
        let (store, user, _) = seeded();
        store
            .update_user(user.id, UserChanges { profile_image_url: Some(Some("a.png".into())), ..Default::default() })
            .unwrap();
        let updated = store
            .update_user(user.id, UserChanges { profile_image_url: Some(None), ..Default::default() })
            .unwrap();
        assert_eq!(updated.profile_image_url, None);
        assert_eq!(updated.first_name, "Ada");
    }

    #[test]
    fn update_missing_user_is_not_found() {
        let store = store();
        let err = store.update_user(UserId::new(), UserChanges::default()).unwrap_err();
        assert!(matches!(err, StorageError::NotFound { collection: Collection::Users, .. }));
    }

    #[test]
    fn account_deletion_removes_owned_rows() {
        let (store, user, category) = seeded();
        let project = project(&store, &user, &category, "Alpha");
        task(&store, &project, "one");

        store.delete_user(user.id).unwrap();
        assert!(store.get_user(user.id).unwrap().is_none());
        assert!(store.get_project(project.id).unwrap().is_none());
        assert!(store.get_category(category.id).unwrap().is_none());
        let remaining: i64 = store
            .read(|c| Ok(c.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(remaining, 0);
    }
}

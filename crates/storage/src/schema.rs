//! DDL for each registered migration. Every statement is idempotent so a unit
//! re-run after a crash mid-way is harmless.

use rusqlite::{Connection, Transaction};

pub(crate) fn create_entity_tables(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id BLOB PRIMARY KEY CHECK (length(id) = 16),
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT NOT NULL,
            profile_image_url TEXT,
            created_at BLOB NOT NULL CHECK (length(created_at) = 12),
            updated_at BLOB NOT NULL CHECK (length(updated_at) = 12)
        );

        CREATE TABLE IF NOT EXISTS categories (
            id BLOB PRIMARY KEY CHECK (length(id) = 16),
            user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            created_at BLOB NOT NULL CHECK (length(created_at) = 12),
            updated_at BLOB NOT NULL CHECK (length(updated_at) = 12)
        );

        -- category_id is a soft reference: checked on write, guarded on delete.
        CREATE TABLE IF NOT EXISTS projects (
            id BLOB PRIMARY KEY CHECK (length(id) = 16),
            user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            description TEXT,
            color TEXT NOT NULL,
            category_id BLOB NOT NULL CHECK (length(category_id) = 16),
            task_count INTEGER NOT NULL DEFAULT 0,
            completed_task_count INTEGER NOT NULL DEFAULT 0,
            progress_percentage INTEGER NOT NULL DEFAULT 0,
            created_at BLOB NOT NULL CHECK (length(created_at) = 12),
            updated_at BLOB NOT NULL CHECK (length(updated_at) = 12)
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id BLOB PRIMARY KEY CHECK (length(id) = 16),
            user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            project_id BLOB NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'in_progress', 'completed')),
            priority TEXT NOT NULL CHECK (priority IN ('low', 'medium', 'high')),
            start_date INTEGER,
            due_date INTEGER,
            progress_percentage INTEGER NOT NULL DEFAULT 0,
            created_at BLOB NOT NULL CHECK (length(created_at) = 12),
            updated_at BLOB NOT NULL CHECK (length(updated_at) = 12)
        );

        CREATE TABLE IF NOT EXISTS subtasks (
            id BLOB PRIMARY KEY CHECK (length(id) = 16),
            task_id BLOB NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            text TEXT NOT NULL,
            completed INTEGER NOT NULL DEFAULT 0,
            created_at BLOB NOT NULL CHECK (length(created_at) = 12),
            updated_at BLOB NOT NULL CHECK (length(updated_at) = 12)
        );
        ",
    )
}

pub(crate) fn add_tombstone_columns(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    for table in ["users", "categories", "projects", "tasks", "subtasks"] {
        ensure_column(tx, table, "deleted", "INTEGER NOT NULL DEFAULT 0")?;
    }
    Ok(())
}

pub(crate) fn create_sync_tables(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_state (
            collection TEXT PRIMARY KEY,
            cursor BLOB CHECK (cursor IS NULL OR length(cursor) = 12),
            high_water BLOB CHECK (high_water IS NULL OR length(high_water) = 12),
            backoff_attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER,
            last_success_at INTEGER,
            halted_reason TEXT
        );

        -- seq keeps first-enqueue order; updated_at tracks the latest local edit.
        CREATE TABLE IF NOT EXISTS sync_pending (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            entity_id BLOB NOT NULL CHECK (length(entity_id) = 16),
            updated_at BLOB NOT NULL CHECK (length(updated_at) = 12),
            UNIQUE (collection, entity_id)
        );

        CREATE TABLE IF NOT EXISTS sync_parked (
            collection TEXT NOT NULL,
            entity_id BLOB NOT NULL CHECK (length(entity_id) = 16),
            updated_at BLOB NOT NULL CHECK (length(updated_at) = 12),
            body BLOB NOT NULL,
            parked_at INTEGER NOT NULL,
            PRIMARY KEY (collection, entity_id)
        );
        ",
    )
}

pub(crate) fn index_foreign_keys(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_categories_user ON categories (user_id);
        CREATE INDEX IF NOT EXISTS idx_projects_user ON projects (user_id);
        CREATE INDEX IF NOT EXISTS idx_projects_category ON projects (category_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks (project_id, deleted);
        CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks (user_id);
        CREATE INDEX IF NOT EXISTS idx_subtasks_task ON subtasks (task_id, deleted);
        CREATE INDEX IF NOT EXISTS idx_sync_pending_order ON sync_pending (collection, seq);
        ",
    )
}

/// `ALTER TABLE ... ADD COLUMN` unless the column already exists.
pub(crate) fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?
        .iter()
        .any(|name| name == column);
    if !exists {
        conn.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN {column} {definition}"
        ))?;
    }
    Ok(())
}

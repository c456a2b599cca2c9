use rusqlite::Transaction;
use tasksync_storage::migrations::{REGISTRY, current_version, latest_version};
use tasksync_storage::{Database, LocalStore, MigrationUnit, StorageError, run_migrations, run_migrations_with};

fn schema_snapshot(db: &Database) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare("SELECT sql FROM sqlite_master WHERE sql IS NOT NULL ORDER BY name")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn table_exists(db: &Database, name: &str) -> Result<bool, Box<dyn std::error::Error>> {
    let conn = db.lock()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count == 1)
}

fn create_audit(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch("CREATE TABLE IF NOT EXISTS audit (id INTEGER PRIMARY KEY)")
}

fn create_then_fail(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch("CREATE TABLE half_done (id INTEGER PRIMARY KEY)")?;
    tx.execute_batch("ALTER TABLE no_such_table ADD COLUMN x INTEGER")
}

fn create_never(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch("CREATE TABLE never (id INTEGER PRIMARY KEY)")
}

#[test]
fn fresh_database_reaches_latest_version() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open_in_memory()?;
    let report = run_migrations(&db)?;

    assert_eq!(report.from_version, 0);
    assert_eq!(report.to_version, latest_version());
    assert_eq!(report.applied, REGISTRY.iter().map(|m| m.version).collect::<Vec<_>>());
    for table in ["users", "categories", "projects", "tasks", "subtasks", "sync_state", "sync_pending"] {
        assert!(table_exists(&db, table)?, "missing table {table}");
    }
    Ok(())
}

#[test]
fn running_twice_equals_running_once() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open_in_memory()?;
    run_migrations(&db)?;
    let once = schema_snapshot(&db)?;

    let second = run_migrations(&db)?;
    assert!(second.applied.is_empty());
    assert_eq!(second.from_version, second.to_version);
    assert_eq!(schema_snapshot(&db)?, once);
    Ok(())
}

#[test]
fn resumes_after_interruption() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open_in_memory()?;
    {
        let mut conn = db.lock()?;
        let partial = run_migrations_with(&mut conn, &REGISTRY[..2])?;
        assert_eq!(partial.to_version, 2);
    }

    let report = run_migrations(&db)?;
    assert_eq!(report.from_version, 2);
    assert_eq!(report.applied, vec![3, 4]);
    Ok(())
}

#[test]
fn failing_unit_rolls_back_and_stops() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open_in_memory()?;
    let mut registry = REGISTRY.to_vec();
    registry.push(MigrationUnit { version: 10, description: "add audit", apply: create_audit });
    registry.push(MigrationUnit { version: 11, description: "half done", apply: create_then_fail });
    registry.push(MigrationUnit { version: 12, description: "never reached", apply: create_never });

    let err = {
        let mut conn = db.lock()?;
        run_migrations_with(&mut conn, &registry).unwrap_err()
    };
    match err {
        StorageError::Migration { version, .. } => assert_eq!(version, 11),
        other => panic!("expected a migration error, got {other:?}"),
    }

    assert_eq!(current_version(&*db.lock()?)?, 10);
    assert!(table_exists(&db, "audit")?);
    assert!(!table_exists(&db, "half_done")?, "failed unit must roll back");
    assert!(!table_exists(&db, "never")?, "later units must not run");
    Ok(())
}

#[test]
fn units_run_in_version_order_regardless_of_listing() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open_in_memory()?;
    let mut registry = REGISTRY.to_vec();
    registry.reverse();
    let report = {
        let mut conn = db.lock()?;
        run_migrations_with(&mut conn, &registry)?
    };
    assert_eq!(report.applied, vec![1, 2, 3, 4]);
    Ok(())
}

#[test]
fn rejects_duplicate_and_zero_versions() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open_in_memory()?;
    let mut conn = db.lock()?;

    let duplicate = [
        MigrationUnit { version: 1, description: "a", apply: create_audit },
        MigrationUnit { version: 1, description: "b", apply: create_never },
    ];
    assert!(matches!(
        run_migrations_with(&mut conn, &duplicate),
        Err(StorageError::InvalidRegistry(_))
    ));

    let zero = [MigrationUnit { version: 0, description: "zero", apply: create_audit }];
    assert!(matches!(
        run_migrations_with(&mut conn, &zero),
        Err(StorageError::InvalidRegistry(_))
    ));
    assert_eq!(current_version(&conn)?, 0);
    Ok(())
}

#[test]
fn store_refuses_a_partially_migrated_database() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open_in_memory()?;
    {
        let mut conn = db.lock()?;
        run_migrations_with(&mut conn, &REGISTRY[..1])?;
    }
    assert!(matches!(
        LocalStore::open(db.clone()),
        Err(StorageError::SchemaOutdated { found: 1, .. })
    ));
    run_migrations(&db)?;
    assert!(LocalStore::open(db).is_ok());
    Ok(())
}

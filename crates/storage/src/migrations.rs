use std::collections::BTreeSet;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::connection::Database;
use crate::error::StorageError;
use crate::schema;

pub type ApplyFn = fn(&Transaction<'_>) -> rusqlite::Result<()>;

/// One ordered schema change. `apply` must be idempotent: a unit interrupted
/// before commit is re-run from the start on the next launch.
#[derive(Clone, Copy)]
pub struct MigrationUnit {
    pub version: u32,
    pub description: &'static str,
    pub apply: ApplyFn,
}

impl std::fmt::Debug for MigrationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationUnit")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

pub const REGISTRY: &[MigrationUnit] = &[
    MigrationUnit {
        version: 1,
        description: "create entity tables",
        apply: schema::create_entity_tables,
    },
    MigrationUnit {
        version: 2,
        description: "add tombstone columns",
        apply: schema::add_tombstone_columns,
    },
    MigrationUnit {
        version: 3,
        description: "create sync bookkeeping tables",
        apply: schema::create_sync_tables,
    },
    MigrationUnit {
        version: 4,
        description: "index foreign keys",
        apply: schema::index_foreign_keys,
    },
];

/// Highest version in the built-in registry.
pub fn latest_version() -> u32 {
    REGISTRY.iter().map(|m| m.version).max().unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<u32>,
}

/// The stored schema version lives in the database header (`user_version`),
/// so it commits or rolls back together with the DDL that bumped it.
pub fn current_version(conn: &Connection) -> Result<u32, StorageError> {
    let v: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    u32::try_from(v).map_err(|_| StorageError::InvalidRegistry(format!("stored schema version {v} out of range")))
}

pub fn run_migrations(db: &Database) -> Result<MigrationReport, StorageError> {
    let mut conn = db.lock()?;
    run_migrations_with(&mut conn, REGISTRY)
}

/// Apply every unit with `version` above the stored one, ascending, each in
/// its own exclusive transaction. Stops at the first failure, leaving the
/// stored version at the last unit that committed.
pub fn run_migrations_with(
    conn: &mut Connection,
    registry: &[MigrationUnit],
) -> Result<MigrationReport, StorageError> {
    validate(registry)?;

    let from_version = current_version(conn)?;
    let mut pending: Vec<&MigrationUnit> = registry
        .iter()
        .filter(|m| m.version > from_version)
        .collect();
    pending.sort_by_key(|m| m.version);

    if pending.is_empty() {
        debug!(version = from_version, "schema up to date");
        return Ok(MigrationReport {
            from_version,
            to_version: from_version,
            applied: Vec::new(),
        });
    }

    let mut applied = Vec::with_capacity(pending.len());
    for unit in pending {
        info!(version = unit.version, description = unit.description, "applying migration");
        apply_unit(conn, unit).inspect_err(|e| {
            warn!(version = unit.version, error = %e, "migration failed; rolled back");
        })?;
        applied.push(unit.version);
    }

    let to_version = current_version(conn)?;
    info!(from = from_version, to = to_version, "migrations complete");
    Ok(MigrationReport {
        from_version,
        to_version,
        applied,
    })
}

fn apply_unit(conn: &mut Connection, unit: &MigrationUnit) -> Result<(), StorageError> {
    let wrap = |source| StorageError::Migration {
        version: unit.version,
        description: unit.description.to_string(),
        source,
    };
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Exclusive)
        .map_err(wrap)?;
    (unit.apply)(&tx).map_err(wrap)?;
    tx.pragma_update(None, "user_version", unit.version)
        .map_err(wrap)?;
    tx.commit().map_err(wrap)
}

fn validate(registry: &[MigrationUnit]) -> Result<(), StorageError> {
    let mut seen = BTreeSet::new();
    for unit in registry {
        if unit.version == 0 {
            return Err(StorageError::InvalidRegistry(format!(
                "migration '{}' has version 0",
                unit.description
            )));
        }
        if !seen.insert(unit.version) {
            return Err(StorageError::InvalidRegistry(format!(
                "duplicate migration version {}",
                unit.version
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &Transaction<'_>) -> rusqlite::Result<()> {
        Ok(())
    }

    #[test]
    fn fresh_database_reaches_latest() {
        let db = Database::open_in_memory().unwrap();
        let report = run_migrations(&db).unwrap();
        assert_eq!(report.from_version, 0);
        assert_eq!(report.to_version, latest_version());
        assert_eq!(report.applied, vec![1, 2, 3, 4]);
    }

    #[test]
    fn second_run_is_a_no_op() {
        let db = Database::open_in_memory().unwrap();
        run_migrations(&db).unwrap();
        let report = run_migrations(&db).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.to_version, latest_version());
    }

    #[test]
    fn rejects_duplicate_versions() {
        let registry = [
            MigrationUnit { version: 1, description: "a", apply: noop },
            MigrationUnit { version: 1, description: "b", apply: noop },
        ];
        let mut conn = Connection::open_in_memory().unwrap();
        let err = run_migrations_with(&mut conn, &registry).unwrap_err();
        assert!(matches!(err, StorageError::InvalidRegistry(_)));
    }

    #[test]
    fn rejects_version_zero() {
        let registry = [MigrationUnit { version: 0, description: "zero", apply: noop }];
        let mut conn = Connection::open_in_memory().unwrap();
        assert!(run_migrations_with(&mut conn, &registry).is_err());
    }

    #[test]
    fn unsorted_registry_runs_ascending() {
        fn t2(tx: &Transaction<'_>) -> rusqlite::Result<()> {
            // Depends on t1's table.
            tx.execute("INSERT INTO log (v) VALUES (2)", []).map(|_| ())
        }
        fn t1(tx: &Transaction<'_>) -> rusqlite::Result<()> {
            tx.execute_batch("CREATE TABLE IF NOT EXISTS log (v INTEGER)")
        }
        let registry = [
            MigrationUnit { version: 2, description: "insert", apply: t2 },
            MigrationUnit { version: 1, description: "create", apply: t1 },
        ];
        let mut conn = Connection::open_in_memory().unwrap();
        let report = run_migrations_with(&mut conn, &registry).unwrap();
        assert_eq!(report.applied, vec![1, 2]);
    }
}

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::StorageError;

const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA cache_size = -16000;
    PRAGMA busy_timeout = 5000;
";

/// Shared handle to the single open database connection.
///
/// Cloning is cheap; every clone refers to the same connection. Writers take
/// the lock for the duration of one transaction.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self::new(conn))
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

fn configure(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(PRAGMAS)
}

fn open_configured(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

fn is_cannot_open(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::CannotOpen
    )
}

/// Make `dir` a usable directory: a stray file in its place is removed, a
/// missing directory is created.
fn recover_storage_dir(dir: &Path) -> Result<(), StorageError> {
    let recovery = |source| StorageError::Recovery {
        path: dir.to_path_buf(),
        source,
    };
    match std::fs::symlink_metadata(dir) {
        Ok(meta) if !meta.is_dir() => {
            warn!(path = %dir.display(), "removing file occupying storage directory");
            std::fs::remove_file(dir).map_err(recovery)?;
            std::fs::create_dir_all(dir).map_err(recovery)?;
        }
        Ok(_) => {
            debug!(path = %dir.display(), "storage directory present; retrying open as-is");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %dir.display(), "creating missing storage directory");
            std::fs::create_dir_all(dir).map_err(recovery)?;
        }
        Err(e) => return Err(recovery(e)),
    }
    Ok(())
}

/// Open the database, running at most one recovery pass on the storage
/// directory when SQLite reports it cannot open the file.
fn open_with_recovery(path: &Path) -> Result<Connection, StorageError> {
    let open_err = |source| StorageError::Open {
        path: path.to_path_buf(),
        source,
    };
    match open_configured(path) {
        Ok(conn) => Ok(conn),
        Err(e) if is_cannot_open(&e) => {
            warn!(path = %path.display(), error = %e, "storage open failed; attempting recovery");
            let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
            match dir {
                Some(dir) => recover_storage_dir(dir)?,
                None => return Err(open_err(e)),
            }
            open_configured(path).map_err(open_err)
        }
        Err(e) => Err(open_err(e)),
    }
}

/// Owns the lazily-opened database handle.
///
/// Concurrent first calls to [`get_connection`](Self::get_connection) share a
/// single in-flight open; later calls return the cached handle.
pub struct ConnectionManager {
    path: PathBuf,
    cell: OnceCell<Database>,
    open_attempts: Arc<AtomicUsize>,
}

impl ConnectionManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cell: OnceCell::new(),
            open_attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get_connection(&self) -> Result<Database, StorageError> {
        self.cell
            .get_or_try_init(|| async {
                let path = self.path.clone();
                let attempts = Arc::clone(&self.open_attempts);
                let conn = tokio::task::spawn_blocking(move || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    open_with_recovery(&path)
                })
                .await
                .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;
                info!(path = %self.path.display(), "storage opened");
                Ok::<_, StorageError>(Database::new(conn))
            })
            .await
            .cloned()
    }

    /// Number of times an open has actually been attempted.
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.cell.initialized()
    }

    /// Release the cached handle. The connection closes once every clone of
    /// the returned [`Database`] is dropped; the next `get_connection` reopens.
    pub fn shutdown(&mut self) -> Option<Database> {
        self.cell.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_once_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConnectionManager::new(dir.path().join("tasks.db"));

        let a = manager.get_connection().await.unwrap();
        let b = manager.get_connection().await.unwrap();
        assert_eq!(manager.open_attempts(), 1);
        assert!(Arc::ptr_eq(&a.conn, &b.conn));
    }

    #[tokio::test]
    async fn enables_foreign_keys_and_wal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConnectionManager::new(dir.path().join("tasks.db"));
        let db = manager.get_connection().await.unwrap();
        let conn = db.lock().unwrap();

        let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0)).unwrap();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        assert_eq!(fk, 1);
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tasks.db");
        let manager = ConnectionManager::new(&path);

        manager.get_connection().await.unwrap();
        assert!(dir.path().join("nested").is_dir());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn shutdown_allows_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ConnectionManager::new(dir.path().join("tasks.db"));
        manager.get_connection().await.unwrap();
        assert!(manager.shutdown().is_some());
        assert!(!manager.is_open());

        manager.get_connection().await.unwrap();
        assert_eq!(manager.open_attempts(), 2);
    }
}

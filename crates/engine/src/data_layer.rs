use tasksync_storage::{
    ConnectionManager, LocalStore, MigrationReport, StorageError, run_migrations,
};
use tracing::info;

use crate::config::Config;
use crate::error::SyncError;
use crate::remote::RemoteBackend;
use crate::sync::SyncEngine;

/// The assembled data layer: connection, migrated schema, entity store and
/// background sync, brought up in that order.
pub struct DataLayer<B: RemoteBackend> {
    connections: ConnectionManager,
    store: LocalStore,
    sync: SyncEngine<B>,
    migrations: MigrationReport,
}

impl<B: RemoteBackend> DataLayer<B> {
    /// Open storage, migrate it, and start syncing. Storage and migration
    /// failures abort startup.
    pub async fn init(config: Config, backend: B) -> Result<Self, SyncError> {
        let connections = ConnectionManager::new(config.storage.database_path());
        let db = connections.get_connection().await?;

        let migrations = {
            let db = db.clone();
            tokio::task::spawn_blocking(move || run_migrations(&db))
                .await
                .map_err(|e| StorageError::Io(std::io::Error::other(e)))??
        };
        let store = LocalStore::open(db)?;

        let sync = SyncEngine::new(store.clone(), backend, config.sync);
        sync.start()?;
        info!(
            path = %connections.path().display(),
            schema = migrations.to_version,
            "data layer ready"
        );
        Ok(Self {
            connections,
            store,
            sync,
            migrations,
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn sync(&self) -> &SyncEngine<B> {
        &self.sync
    }

    pub fn migration_report(&self) -> &MigrationReport {
        &self.migrations
    }

    /// Stop sync, then release the connection.
    pub async fn shutdown(self) {
        let Self {
            mut connections,
            store,
            sync,
            ..
        } = self;
        sync.shutdown().await;
        drop(sync);
        drop(store);
        connections.shutdown();
    }
}

use std::path::PathBuf;

use tasksync_core::{
    Category, Collection, Priority, Project, Task, TaskStatus, User,
};
use tasksync_engine::{CycleReport, SyncConfig, SyncEngine, SyncError};
use tasksync_storage::{
    ConnectionManager, LocalStore, NewCategory, NewProject, NewTask, NewUser, run_migrations,
};
use tempfile::TempDir;

use crate::backend::MockBackend;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

/// One client: its own on-disk database and sync engine, talking to a shared
/// [`MockBackend`]. Background workers are not started unless asked, so tests
/// drive cycles deterministically with [`sync_all`](Self::sync_all).
pub struct TestDevice {
    dir: TempDir,
    manager: ConnectionManager,
    pub store: LocalStore,
    pub sync: SyncEngine<MockBackend>,
    backend: MockBackend,
    config: SyncConfig,
}

/// Short timings so backoff and polling tests finish quickly.
pub fn fast_sync_config() -> SyncConfig {
    SyncConfig {
        batch_size: 100,
        poll_interval_ms: 50,
        backoff_base_ms: 20,
        backoff_max_ms: 200,
        stale_after_ms: 60_000,
        ..SyncConfig::default()
    }
}

impl TestDevice {
    pub async fn new(backend: &MockBackend) -> TestResult<Self> {
        Self::with_config(backend, fast_sync_config()).await
    }

    pub async fn with_config(backend: &MockBackend, config: SyncConfig) -> TestResult<Self> {
        Self::open(tempfile::tempdir()?, backend.clone(), config).await
    }

    async fn open(dir: TempDir, backend: MockBackend, config: SyncConfig) -> TestResult<Self> {
        let manager = ConnectionManager::new(dir.path().join("tasksync.db"));
        let db = manager.get_connection().await?;
        run_migrations(&db)?;
        let store = LocalStore::open(db)?;
        let sync = SyncEngine::new(store.clone(), backend.clone(), config.clone());
        Ok(Self {
            dir,
            manager,
            store,
            sync,
            backend,
            config,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.manager.path().to_path_buf()
    }

    pub fn backend(&self) -> &MockBackend {
        &self.backend
    }

    /// Simulate a process kill and relaunch: stop sync, close the database,
    /// and reopen everything from what was persisted.
    pub async fn restart(self) -> TestResult<Self> {
        let Self {
            dir,
            mut manager,
            store,
            sync,
            backend,
            config,
        } = self;
        sync.shutdown().await;
        drop(sync);
        drop(store);
        manager.shutdown();
        drop(manager);
        Self::open(dir, backend, config).await
    }

    /// One cycle per collection, parents first.
    pub async fn sync_all(&self) -> Result<Vec<CycleReport>, SyncError> {
        let mut reports = Vec::new();
        for collection in Collection::ALL {
            reports.push(self.sync.sync_now(collection).await?);
        }
        Ok(reports)
    }

    pub fn user(&self, first_name: &str) -> TestResult<User> {
        Ok(self.store.create_user(NewUser {
            id: None,
            first_name: first_name.into(),
            last_name: "Tester".into(),
            email: format!("{}@example.com", first_name.to_lowercase()),
            profile_image_url: None,
        })?)
    }

    pub fn category(&self, user: &User, name: &str) -> TestResult<Category> {
        Ok(self.store.create_category(NewCategory {
            user_id: user.id,
            name: name.into(),
        })?)
    }

    pub fn project(&self, user: &User, category: &Category, name: &str) -> TestResult<Project> {
        Ok(self.store.create_project(NewProject {
            user_id: user.id,
            name: name.into(),
            description: None,
            color: "#22aa88".into(),
            category_id: category.id,
        })?)
    }

    pub fn task(&self, project: &Project, title: &str) -> TestResult<Task> {
        Ok(self.store.create_task(NewTask {
            user_id: project.user_id,
            project_id: project.id,
            title: title.into(),
            status: TaskStatus::Pending,
            priority: Priority::Medium,
            start_date: None,
            due_date: None,
        })?)
    }

    /// A user, a category and an empty project.
    pub fn seed_project(&self, name: &str) -> TestResult<(User, Category, Project)> {
        let user = self.user("Ada")?;
        let category = self.category(&user, "Work")?;
        let project = self.project(&user, &category, name)?;
        Ok((user, category, project))
    }
}

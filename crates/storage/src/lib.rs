mod aggregate;
pub mod connection;
pub mod error;
pub mod migrations;
mod schema;
pub mod store;
pub mod sync_state;

pub use connection::{ConnectionManager, Database};
pub use error::StorageError;
pub use migrations::{MigrationReport, MigrationUnit, run_migrations, run_migrations_with};
pub use store::*;
pub use sync_state::{BackoffState, SyncState};

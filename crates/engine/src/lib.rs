pub mod backoff;
pub mod config;
pub mod data_layer;
pub mod error;
pub mod remote;
pub mod sync;

pub use backoff::Backoff;
pub use config::{Config, StorageConfig, SyncConfig};
pub use data_layer::DataLayer;
pub use error::SyncError;
pub use remote::RemoteBackend;
pub use sync::{CycleReport, SyncEngine, SyncPhase, SyncStatus};

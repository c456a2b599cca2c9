//! Test support: an in-memory backend and on-disk client devices.

pub mod backend;
pub mod device;

pub use backend::{Failure, MockBackend};
pub use device::{TestDevice, fast_sync_config};

/// Route `tracing` output to the test writer. Honours `RUST_LOG`; safe to
/// call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

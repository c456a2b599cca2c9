pub mod entities;
pub mod error;
pub mod hlc;
pub mod ids;
pub mod records;

pub use entities::*;
pub use error::CoreError;
pub use hlc::{Hlc, HlcClock};
pub use ids::*;
pub use records::{Collection, OutboundBatch, RemoteRow, SyncRecord};

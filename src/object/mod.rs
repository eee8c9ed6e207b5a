//! Object model: status state machine and the per-object context

pub mod status;
pub mod types;

pub use status::{ObjectStatus, UnknownStatus};
pub use types::{ObjectContext, ObjectMetadata, ObjectSummary, SyncObject};

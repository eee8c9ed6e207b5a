//! Migration engine
//!
//! ```text
//!   source.all_objects()
//!          │
//!          ▼
//!   ┌──────────────┐  directory   ┌──────────────┐
//!   │  sync pool   │ ───────────► │  query pool  │
//!   │  (bounded)   │ ◄─────────── │ (unbounded)  │
//!   └──────┬───────┘   children   └──────────────┘
//!          │ recoverable failure
//!          ▼
//!   ┌──────────────┐
//!   │  retry pool  │ ── resubmits into the sync pool
//!   │  (1 thread)  │
//!   └──────────────┘
//! ```
//!
//! Every sync task records its outcome in the status store. The run is
//! complete when all three pools are idle. An optional estimate pool walks
//! the source on the side to count objects and bytes; the run does not wait
//! for it. Submissions and transfers can be throttled, and the query and
//! sync pools can be resized while the run is under way.

pub mod coordinator;
pub mod estimate;
pub mod pool;
pub mod stats;
mod task;
pub mod throttle;

pub use coordinator::{EngineProgress, SyncEngine, SyncSummary, TerminateHandle};
pub use estimate::SyncEstimate;
pub use pool::WorkerPool;
pub use stats::{FailedObject, SyncCounts, SyncStats};
pub use throttle::Throttle;

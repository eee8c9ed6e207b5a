//! Status store: persistent per-object migration tracking in SQLite
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Sync Worker Threads (N)                │
//! │  lock(id) → get_record → set_status → unlock        │
//! └─────────────────────┬───────────────────────────────┘
//!                       │ one short statement per call
//!                       ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                   StatusStore                       │
//! │  RecordCodec   builds statements, maps rows         │
//! │  IdLock        serializes first writes per id       │
//! │  RecordCursor  streams range queries                │
//! └─────────────────────┬───────────────────────────────┘
//!                       │ ConnectionPool (bounded, WAL)
//!                       ▼
//! ┌─────────────────────────────────────────────────────┐
//! │               SQLite status table                   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod cursor;
pub mod lock;
pub mod pool;
pub mod record;
pub mod schema;
pub mod store;

pub use codec::{Param, ParamValue, Params, RecordCodec, RecordFilter, Statement};
pub use cursor::RecordCursor;
pub use lock::{IdLock, IdLockGuard};
pub use pool::{ConnectionPool, PooledConnection};
pub use record::SyncRecord;
pub use schema::{FieldDescriptor, FieldRegistry, FieldType};
pub use store::{StatusStore, StoreConfig};

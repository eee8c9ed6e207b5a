//! Error types for objsync
//!
//! This module defines the error hierarchy that covers:
//! - Status store (SQLite) errors
//! - Configuration and CLI errors
//! - Worker pool errors
//! - Per-object migration failures
//!
//! Per-object failures are recovered inside the engine (logged, recorded,
//! counted). Store and configuration errors are surfaced to the caller.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for objsync
#[derive(Error, Debug)]
pub enum SyncError {
    /// Status store errors
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker pool errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Failure enumerating the source
    #[error("Source error: {0}")]
    Source(#[from] ObjectError),

    /// A required plugin was not configured before `run()`
    #[error("No {0} configured")]
    MissingPlugin(&'static str),

    /// `run()` was called on an engine that already ran
    #[error("Engine has already been started")]
    AlreadyStarted,
}

/// Status store errors
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to open or create the database file
    #[error("Failed to open database at '{path}': {reason}")]
    CreateFailed { path: PathBuf, reason: String },

    /// A status write was requested for a context with no status
    #[error("Object context for '{source_id}' has no status set")]
    MissingStatus { source_id: String },

    /// The connection pool has been closed
    #[error("Connection pool is closed")]
    PoolClosed,

    /// No connection became available in time
    #[error("Timed out after {waited:?} waiting for a database connection")]
    PoolTimeout { waited: Duration },

    /// The store has been closed
    #[error("Status store is closed")]
    StoreClosed,

    /// Streaming cursor failure
    #[error("Cursor error: {0}")]
    Cursor(String),
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid thread count
    #[error("Invalid {pool} thread count {count}: must be between 1 and {max}")]
    InvalidThreadCount {
        pool: &'static str,
        count: usize,
        max: usize,
    },

    /// Invalid queue size
    #[error("Invalid queue size {size}: must be at least {min}")]
    InvalidQueueSize { size: usize, min: usize },

    /// Invalid status table name
    #[error("Invalid table name '{name}': must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidTableName { name: String },

    /// Invalid maximum error message size
    #[error("Invalid max error size {size}: must be at least 1")]
    InvalidErrorSize { size: usize },

    /// Throttle rate that is not a positive number
    #[error("Invalid {name} limit {value}: must be greater than zero")]
    InvalidThrottle { name: &'static str, value: f64 },

    /// Mutually exclusive options were both given
    #[error("Conflicting options: {0}")]
    Conflict(String),

    /// Database path error
    #[error("Invalid database path '{path}': {reason}")]
    InvalidDbPath { path: PathBuf, reason: String },

    /// No registered storage plugin handles this URI
    #[error("No storage plugin registered for '{uri}'")]
    UnknownStorage { uri: String },

    /// No registered filter plugin has this name
    #[error("No filter plugin registered as '{name}'")]
    UnknownFilter { name: String },

    /// A plugin rejected its options
    #[error("Invalid options for plugin '{plugin}': {reason}")]
    InvalidPluginOption { plugin: String, reason: String },
}

/// Worker pool errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The pool is shut down and accepts no new tasks
    #[error("Pool '{pool}' is shut down; task rejected")]
    Rejected { pool: String },

    /// A blocked submission was abandoned by a forced stop
    #[error("Pool '{pool}' was stopped while waiting to submit")]
    Stopped { pool: String },

    /// Worker thread could not be started
    #[error("Failed to start worker {id} of pool '{pool}': {reason}")]
    InitFailed {
        pool: String,
        id: usize,
        reason: String,
    },
}

/// Per-object failures raised by plugins and the sync task
#[derive(Error, Debug)]
pub enum ObjectError {
    /// Object does not exist
    #[error("Object not found: '{identifier}'")]
    NotFound { identifier: String },

    /// Transfer through the filter chain failed
    #[error("Transfer of '{identifier}' failed: {reason}")]
    Transfer { identifier: String, reason: String },

    /// Read-back comparison failed
    #[error("Verification of '{identifier}' failed: {reason}")]
    Verify { identifier: String, reason: String },

    /// Failure that must not be retried
    #[error("'{identifier}' cannot be synced: {reason}")]
    NonRetriable { identifier: String, reason: String },

    /// A filter asked for the object to be skipped
    #[error("'{identifier}' skipped: {reason}")]
    Skip { identifier: String, reason: String },

    /// Status bookkeeping failed for this object
    #[error("Status store error: {0}")]
    Store(#[from] DbError),
}

impl ObjectError {
    /// Check if this failure may be retried
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ObjectError::Transfer { .. } | ObjectError::Verify { .. }
        )
    }

    /// Check if this is a skip signal rather than a failure
    pub fn is_skip(&self) -> bool {
        matches!(self, ObjectError::Skip { .. })
    }
}

/// Result type alias for SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

/// Result type alias for DbError
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Result type alias for ObjectError
pub type ObjectResult<T> = std::result::Result<T, ObjectError>;

/// Result type alias for WorkerError
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

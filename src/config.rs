//! Configuration types for objsync
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation
//! - Engine options shared by the library and the binary

use crate::db::schema::DEFAULT_MAX_ERROR_SIZE;
use crate::db::StoreConfig;
use crate::error::ConfigError;
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Maximum reasonable thread count for either pool
const MAX_THREADS: usize = 512;

/// Minimum sync queue capacity
const MIN_QUEUE_SIZE: usize = 1;

/// Default number of sync threads
pub const DEFAULT_SYNC_THREADS: usize = 16;

/// Sync queue slots per sync thread when no capacity is given
pub const QUEUE_SLOTS_PER_THREAD: usize = 64;

/// Default retry budget per object
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 2;

/// Table names are spliced into SQL text, so only plain identifiers pass
static TABLE_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid table name regex"));

/// Resumable object migration with a per-object status database
#[derive(Parser, Debug, Clone)]
#[command(
    name = "objsync",
    version,
    about = "Resumable object migration with a per-object status database",
    long_about = "Copies objects from a source storage to a target storage through an optional \
                  filter chain, verifying and deleting as configured.\n\n\
                  Every object's progress is tracked in a SQLite status table, so an \
                  interrupted run can be resumed and errors can be listed afterwards.",
    after_help = "EXAMPLES:\n    \
        objsync run --source 'test:?objects=500' --target test: --verify\n    \
        objsync run --source 'test:?objects=50' --target test: --filter 'delay?ms=20'\n    \
        objsync report --db objsync.db\n    \
        objsync errors --db objsync.db --retry-queue"
)]
pub struct CliArgs {
    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Migrate objects from a source to a target
    Run(RunArgs),

    /// Count status records by status
    Report(DbArgs),

    /// List records in the Error (or RetryQueue) state
    Errors {
        #[command(flatten)]
        db: DbArgs,

        /// List retry-queue records instead of errors
        #[arg(long)]
        retry_queue: bool,
    },

    /// Drop the status table
    Drop(DbArgs),
}

/// Status database location
#[derive(Args, Debug, Clone)]
pub struct DbArgs {
    /// Status database file
    #[arg(long, default_value = "objsync.db", value_name = "FILE")]
    pub db: PathBuf,

    /// Status table name
    #[arg(long, default_value = "objects", value_name = "NAME")]
    pub table: String,
}

impl DbArgs {
    /// Validated store configuration for an existing database
    pub fn store_config(&self) -> Result<StoreConfig, ConfigError> {
        validate_table_name(&self.table)?;
        validate_db_path(&self.db)?;
        Ok(StoreConfig::new(&self.db).with_table(&self.table))
    }
}

/// Arguments of the `run` subcommand
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Source storage URI (e.g. test:?objects=100)
    #[arg(long, value_name = "URI")]
    pub source: String,

    /// Target storage URI
    #[arg(long, value_name = "URI")]
    pub target: String,

    /// Filter to apply, in order (NAME or NAME?OPTIONS; can be repeated)
    #[arg(long = "filter", value_name = "FILTER", action = clap::ArgAction::Append)]
    pub filters: Vec<String>,

    #[command(flatten)]
    pub db: DbArgs,

    /// Track extended details (checksums, retention, first error)
    #[arg(long)]
    pub extended: bool,

    /// Maximum stored error message length
    #[arg(long, default_value_t = DEFAULT_MAX_ERROR_SIZE, value_name = "NUM")]
    pub max_error_size: usize,

    /// Threads listing directory children
    #[arg(long, default_value_t = default_query_threads(), value_name = "NUM")]
    pub query_threads: usize,

    /// Threads transferring objects
    #[arg(long, default_value_t = DEFAULT_SYNC_THREADS, value_name = "NUM")]
    pub sync_threads: usize,

    /// Sync queue capacity (default 64 per sync thread)
    #[arg(long, value_name = "NUM")]
    pub queue_size: Option<usize>,

    /// Do not descend into directories
    #[arg(long)]
    pub no_recursive: bool,

    /// Read back and compare every object after transfer
    #[arg(long, conflicts_with = "verify_only")]
    pub verify: bool,

    /// Only compare objects already on the target
    #[arg(long)]
    pub verify_only: bool,

    /// Delete source objects once synced
    #[arg(long)]
    pub delete_source: bool,

    /// Copy even when the status table says the target is up to date
    #[arg(long)]
    pub force_sync: bool,

    /// Retry attempts per object
    #[arg(long, default_value_t = DEFAULT_RETRY_ATTEMPTS, value_name = "NUM")]
    pub retries: u32,

    /// Maximum objects submitted for sync per second
    #[arg(long, value_name = "OBJECTS")]
    pub throughput_limit: Option<f64>,

    /// Maximum bytes transferred per second
    #[arg(long, value_name = "BYTES")]
    pub bandwidth_limit: Option<u64>,

    /// Count the source's objects and bytes alongside the run
    #[arg(long)]
    pub estimate: bool,

    /// Keep failed objects for the end-of-run summary
    #[arg(long)]
    pub remember_failed: bool,

    /// Compare checksums reported in metadata instead of hashing data
    #[arg(long)]
    pub metadata_checksum: bool,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

fn default_query_threads() -> usize {
    num_cpus::get()
}

/// Engine options
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Descend into directories
    pub recursive: bool,

    /// Verify after transfer
    pub verify: bool,

    /// Verify only, never transfer
    pub verify_only: bool,

    /// Delete source objects after a successful sync
    pub delete_source: bool,

    /// Ignore up-to-date records
    pub force_sync: bool,

    /// Retry budget per object
    pub retry_attempts: u32,

    /// Keep failed objects in memory for the summary
    pub remember_failed: bool,

    pub query_threads: usize,
    pub sync_threads: usize,

    /// Sync queue capacity; `None` means 64 slots per sync thread
    pub sync_queue_capacity: Option<usize>,

    /// Interval between idle checks
    pub poll_interval: Duration,

    /// Verifier trusts metadata checksums
    pub use_metadata_checksum: bool,

    /// Objects per second submitted for sync
    pub throughput_limit: Option<f64>,

    /// Bytes per second transferred
    pub bandwidth_limit: Option<u64>,

    /// Enumerate the source in parallel to estimate the run's size
    pub estimate: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            verify: false,
            verify_only: false,
            delete_source: false,
            force_sync: false,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            remember_failed: false,
            query_threads: default_query_threads(),
            sync_threads: DEFAULT_SYNC_THREADS,
            sync_queue_capacity: None,
            poll_interval: Duration::from_millis(100),
            use_metadata_checksum: false,
            throughput_limit: None,
            bandwidth_limit: None,
            estimate: false,
        }
    }
}

impl SyncOptions {
    /// Effective sync queue capacity
    pub fn queue_capacity(&self) -> usize {
        self.sync_queue_capacity
            .unwrap_or(self.sync_threads * QUEUE_SLOTS_PER_THREAD)
    }

    /// Check thread counts, queue capacity, throttles and conflicting flags
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_threads("query", self.query_threads)?;
        validate_threads("sync", self.sync_threads)?;
        if let Some(limit) = self.throughput_limit {
            validate_throttle("throughput", limit)?;
        }
        if let Some(limit) = self.bandwidth_limit {
            validate_throttle("bandwidth", limit as f64)?;
        }

        if self.queue_capacity() < MIN_QUEUE_SIZE {
            return Err(ConfigError::InvalidQueueSize {
                size: self.queue_capacity(),
                min: MIN_QUEUE_SIZE,
            });
        }

        if self.verify && self.verify_only {
            return Err(ConfigError::Conflict(
                "--verify and --verify-only are mutually exclusive".into(),
            ));
        }
        Ok(())
    }
}

/// Validated configuration for the `run` subcommand
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_uri: String,
    pub target_uri: String,

    /// Filter specs in chain order
    pub filters: Vec<String>,

    pub store: StoreConfig,
    pub options: SyncOptions,

    /// Show progress indicator
    pub show_progress: bool,
}

impl SyncConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: RunArgs) -> Result<Self, ConfigError> {
        let store = args.db.store_config()?;

        if args.max_error_size == 0 {
            return Err(ConfigError::InvalidErrorSize {
                size: args.max_error_size,
            });
        }

        let options = SyncOptions {
            recursive: !args.no_recursive,
            verify: args.verify,
            verify_only: args.verify_only,
            delete_source: args.delete_source,
            force_sync: args.force_sync,
            retry_attempts: args.retries,
            remember_failed: args.remember_failed,
            query_threads: args.query_threads,
            sync_threads: args.sync_threads,
            sync_queue_capacity: args.queue_size,
            use_metadata_checksum: args.metadata_checksum,
            throughput_limit: args.throughput_limit,
            bandwidth_limit: args.bandwidth_limit,
            estimate: args.estimate,
            ..SyncOptions::default()
        };
        options.validate()?;

        Ok(Self {
            source_uri: args.source,
            target_uri: args.target,
            filters: args.filters,
            store: store
                .with_extended(args.extended)
                .with_max_error_size(args.max_error_size),
            options,
            show_progress: !args.quiet,
        })
    }
}

pub(crate) fn validate_threads(pool: &'static str, count: usize) -> Result<(), ConfigError> {
    if count == 0 || count > MAX_THREADS {
        return Err(ConfigError::InvalidThreadCount {
            pool,
            count,
            max: MAX_THREADS,
        });
    }
    Ok(())
}

fn validate_throttle(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidThrottle { name, value });
    }
    Ok(())
}

/// Check that `name` is safe to splice into SQL as a table name
pub fn validate_table_name(name: &str) -> Result<(), ConfigError> {
    if !TABLE_NAME_REGEX.is_match(name) {
        return Err(ConfigError::InvalidTableName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn validate_db_path(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(ConfigError::InvalidDbPath {
                path: path.to_path_buf(),
                reason: format!("Parent directory '{}' does not exist", parent.display()),
            });
        }
    }
    Ok(())
}

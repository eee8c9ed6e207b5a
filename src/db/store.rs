//! Status store
//!
//! Owns a connection pool, creates (and migrates) the status table on first
//! use, and exposes point and range queries plus the per-object status
//! upserts the engine writes after each step.
//!
//! Every write is one short single-row statement on a pooled connection.
//! The first insert for an identifier is serialized by the caller holding
//! [`StatusStore::lock`] across the read-then-write window.

use crate::db::codec::{
    build_insert, build_select, build_update_by_source_id, RecordCodec, RecordFilter, Statement,
};
use crate::db::cursor::RecordCursor;
use crate::db::lock::{IdLock, IdLockGuard};
use crate::db::pool::ConnectionPool;
use crate::db::record::SyncRecord;
use crate::db::schema::{self, DEFAULT_MAX_ERROR_SIZE, DEFAULT_TABLE_NAME};
use crate::error::{DbError, DbResult};
use crate::object::{ObjectContext, ObjectStatus};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params_from_iter, OptionalExtension};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Process-wide count of stores that have not been closed
static LIVE_STORES: AtomicUsize = AtomicUsize::new(0);

/// Default live-instance count above which a warning is logged
pub const DEFAULT_INSTANCE_WARNING_LIMIT: usize = 50;

/// Status store settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file
    pub path: PathBuf,
    pub table_name: String,
    pub max_error_size: usize,
    /// Track the extended columns
    pub extended: bool,
    /// Maximum pooled connections
    pub pool_size: usize,
    /// SQLite busy timeout per connection
    pub busy_timeout: Duration,
    /// How long to wait for a free pooled connection
    pub acquire_timeout: Duration,
    pub instance_warning_limit: usize,
}

impl StoreConfig {
    /// Defaults for a database at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            max_error_size: DEFAULT_MAX_ERROR_SIZE,
            extended: false,
            pool_size: 8,
            busy_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(60),
            instance_warning_limit: DEFAULT_INSTANCE_WARNING_LIMIT,
        }
    }

    pub fn with_table(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    pub fn with_max_error_size(mut self, max_error_size: usize) -> Self {
        self.max_error_size = max_error_size;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }
}

/// Persistent per-object status tracking
pub struct StatusStore {
    config: StoreConfig,
    pool: ConnectionPool,
    codec: RecordCodec,
    locks: IdLock,
    /// Set once the table exists
    initialized: Mutex<bool>,
    closed: AtomicBool,
}

impl StatusStore {
    /// Create a store; the table is created lazily on first use
    pub fn new(config: StoreConfig) -> Self {
        let pool = ConnectionPool::new(
            &config.path,
            config.pool_size,
            config.busy_timeout,
            config.acquire_timeout,
        );
        let codec = RecordCodec::new(config.max_error_size, config.extended);

        let live = LIVE_STORES.fetch_add(1, Ordering::SeqCst) + 1;
        if live > config.instance_warning_limit {
            warn!(
                live,
                limit = config.instance_warning_limit,
                "Many status stores are open; are they being closed?"
            );
        } else {
            debug!(live, path = %config.path.display(), table = %config.table_name, "Status store created");
        }

        Self {
            config,
            pool,
            codec,
            locks: IdLock::new(),
            initialized: Mutex::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of stores in this process that have not been closed
    pub fn live_instances() -> usize {
        LIVE_STORES.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn table_name(&self) -> &str {
        &self.config.table_name
    }

    pub fn is_extended(&self) -> bool {
        self.codec.is_extended()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Create the table (and any missing extended columns) once
    fn init_check(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::StoreClosed);
        }

        let mut initialized = self.initialized.lock();
        if !*initialized {
            let conn = self.pool.acquire()?;
            schema::create_table(&conn, &self.config.table_name, self.codec.registry())?;
            *initialized = true;
        }
        Ok(())
    }

    fn execute(&self, stmt: &Statement) -> DbResult<usize> {
        trace!(sql = %stmt.sql, values = stmt.values.len(), "Executing");
        let conn = self.pool.acquire()?;
        Ok(conn.execute(&stmt.sql, params_from_iter(stmt.values.iter()))?)
    }

    /// Record the object's current status
    ///
    /// Inserts when `new_row` is set, otherwise updates the existing row.
    /// Fails with [`DbError::MissingStatus`] if the context has no status.
    pub fn set_status(&self, ctx: &ObjectContext, error: Option<&str>, new_row: bool) -> DbResult<bool> {
        self.init_check()?;
        let now = Utc::now();
        let table = &self.config.table_name;

        let stmt = if new_row {
            let params = self.codec.insert_status_params(ctx, error, now)?;
            build_insert(table, self.codec.registry(), &params)
        } else {
            let params = self.codec.update_status_params(ctx, error, now)?;
            build_update_by_source_id(table, self.codec.registry(), &params, ctx.source_id())
        };

        self.execute(&stmt)?;
        Ok(true)
    }

    /// Flag the object's source as deleted
    pub fn set_deleted(&self, ctx: &ObjectContext, new_row: bool) -> DbResult<bool> {
        self.init_check()?;
        let table = &self.config.table_name;

        let stmt = if new_row {
            build_insert(table, self.codec.registry(), &self.codec.insert_deleted_params(ctx))
        } else {
            build_update_by_source_id(
                table,
                self.codec.registry(),
                &self.codec.update_deleted_params(),
                ctx.source_id(),
            )
        };

        self.execute(&stmt)?;
        Ok(true)
    }

    /// Point lookup; `Ok(None)` when no row matches
    pub fn get_record(&self, source_id: &str) -> DbResult<Option<SyncRecord>> {
        self.init_check()?;
        let stmt = build_select(
            &self.config.table_name,
            self.codec.registry(),
            &RecordFilter::SourceId(source_id.to_string()),
        );

        let conn = self.pool.acquire()?;
        let record = conn
            .query_row(&stmt.sql, params_from_iter(stmt.values.iter()), |row| {
                self.codec.map_row(row)
            })
            .optional()?;
        Ok(record)
    }

    fn cursor(&self, filter: RecordFilter) -> DbResult<RecordCursor> {
        self.init_check()?;
        let stmt = build_select(&self.config.table_name, self.codec.registry(), &filter);
        RecordCursor::open(&self.pool, self.codec.clone(), stmt)
    }

    /// Stream every record
    pub fn all_records(&self) -> DbResult<RecordCursor> {
        self.cursor(RecordFilter::All)
    }

    /// Stream records in `Error`
    pub fn error_records(&self) -> DbResult<RecordCursor> {
        self.cursor(RecordFilter::Status(ObjectStatus::Error))
    }

    /// Stream records in `RetryQueue`
    pub fn retry_queue_records(&self) -> DbResult<RecordCursor> {
        self.cursor(RecordFilter::Status(ObjectStatus::RetryQueue))
    }

    /// Hold `id` exclusively until the guard drops
    pub fn lock(&self, id: &str) -> IdLockGuard<'_> {
        self.locks.lock(id)
    }

    /// Number of records per status, for reporting
    pub fn count_by_status(&self) -> DbResult<BTreeMap<String, u64>> {
        self.init_check()?;
        let conn = self.pool.acquire()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {status}, COUNT(*) FROM {table} GROUP BY {status}",
            status = schema::fields::STATUS,
            table = self.config.table_name
        ))?;

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    /// Drop the status table; the next call recreates it
    pub fn delete_database(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::StoreClosed);
        }

        let mut initialized = self.initialized.lock();
        let conn = self.pool.acquire()?;
        schema::drop_table(&conn, &self.config.table_name)?;
        *initialized = false;

        info!(table = %self.config.table_name, "Status table dropped");
        Ok(())
    }

    /// Close the store and its connection pool. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.close();
        let live = LIVE_STORES.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(live, table = %self.config.table_name, "Status store closed");
    }
}

impl Drop for StatusStore {
    fn drop(&mut self) {
        self.close();
    }
}

//! SQLite connection pool
//!
//! Provides a bounded pool of connections shared by worker threads. Every
//! status read or write borrows one connection for a single short statement
//! and returns it when the guard drops.

use crate::db::schema::CONNECTION_PRAGMAS;
use crate::error::{DbError, DbResult};
use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// A pooled connection with automatic return to pool on drop
pub struct PooledConnection {
    /// The connection (Option for taking on drop)
    conn: Option<Connection>,
    /// Pool to return to
    pool: Arc<PoolShared>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("Connection already returned")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("Connection already returned")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn);
        }
    }
}

/// Pool bookkeeping guarded by one mutex
struct PoolState {
    /// Idle connections ready for use
    idle: Vec<Connection>,
    /// Connections opened and not yet discarded (idle + checked out)
    open: usize,
}

struct PoolShared {
    path: PathBuf,
    state: Mutex<PoolState>,
    available: Condvar,
    max_connections: usize,
    busy_timeout: Duration,
    acquire_timeout: Duration,
    closed: AtomicBool,
}

impl PoolShared {
    fn return_connection(&self, conn: Connection) {
        let mut state = self.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            state.open -= 1;
            drop(state);
            drop(conn);
        } else {
            state.idle.push(conn);
            drop(state);
        }
        self.available.notify_one();
    }

    fn open_connection(&self) -> DbResult<Connection> {
        let conn = Connection::open(&self.path).map_err(|e| DbError::CreateFailed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        // Set before the pragmas so concurrent WAL switches wait instead of failing
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch(CONNECTION_PRAGMAS)?;
        trace!(path = %self.path.display(), "Opened pooled connection");
        Ok(conn)
    }
}

/// Bounded pool of SQLite connections to one database file
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a new connection pool; connections are opened lazily
    pub fn new(
        path: impl AsRef<Path>,
        max_connections: usize,
        busy_timeout: Duration,
        acquire_timeout: Duration,
    ) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            shared: Arc::new(PoolShared {
                path: path.as_ref().to_path_buf(),
                state: Mutex::new(PoolState {
                    idle: Vec::with_capacity(max_connections),
                    open: 0,
                }),
                available: Condvar::new(),
                max_connections,
                busy_timeout,
                acquire_timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Get the maximum number of connections
    pub fn max_connections(&self) -> usize {
        self.shared.max_connections
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Number of connections currently open
    pub fn open_connections(&self) -> usize {
        self.shared.state.lock().open
    }

    /// Number of idle connections
    pub fn idle_connections(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Acquire a connection from the pool
    ///
    /// Reuses an idle connection, opens a new one while under the limit, or
    /// waits for one to be returned.
    pub fn acquire(&self) -> DbResult<PooledConnection> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.acquire_timeout;
        let mut state = shared.state.lock();

        loop {
            if shared.closed.load(Ordering::SeqCst) {
                return Err(DbError::PoolClosed);
            }

            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection {
                    conn: Some(conn),
                    pool: Arc::clone(shared),
                });
            }

            if state.open < shared.max_connections {
                state.open += 1;
                drop(state);

                return match shared.open_connection() {
                    Ok(conn) => Ok(PooledConnection {
                        conn: Some(conn),
                        pool: Arc::clone(shared),
                    }),
                    Err(e) => {
                        shared.state.lock().open -= 1;
                        shared.available.notify_one();
                        Err(e)
                    }
                };
            }

            if shared.available.wait_until(&mut state, deadline).timed_out() {
                return Err(DbError::PoolTimeout {
                    waited: shared.acquire_timeout,
                });
            }
        }
    }

    /// Close the pool: idle connections are released now, checked-out ones
    /// when they are returned. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let idle = {
            let mut state = self.shared.state.lock();
            let idle = std::mem::take(&mut state.idle);
            state.open -= idle.len();
            idle
        };
        let released = idle.len();
        drop(idle);

        self.shared.available.notify_all();
        debug!(path = %self.shared.path.display(), released, "Connection pool closed");
    }
}

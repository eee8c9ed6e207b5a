//! Streaming cursor over status table queries
//!
//! A producer thread borrows one pooled connection, steps the query and
//! hands mapped rows across a rendezvous channel, so at most one row is in
//! flight at a time regardless of result size.
//!
//! ```text
//!  ┌──────────────────────┐   row   ┌──────────────────┐
//!  │ producer thread      │ ──────► │ RecordCursor     │
//!  │ pooled conn + stmt   │ (cap 0) │ Iterator<Item =  │
//!  │ map_row per step     │         │  DbResult<Rec>>  │
//!  └──────────────────────┘         └──────────────────┘
//! ```
//!
//! The cursor closes itself on exhaustion or on the first error. A consumer
//! that stops early must call [`RecordCursor::close`] (or drop the cursor).

use crate::db::codec::{RecordCodec, Statement};
use crate::db::pool::ConnectionPool;
use crate::db::record::SyncRecord;
use crate::error::{DbError, DbResult};
use crossbeam_channel::{bounded, Receiver, Sender};
use rusqlite::params_from_iter;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// Forward-only, single-pass sequence of status records
pub struct RecordCursor {
    receiver: Option<Receiver<DbResult<SyncRecord>>>,
    producer: Option<JoinHandle<()>>,
    rows_read: u64,
}

impl RecordCursor {
    /// Start streaming `stmt` on a connection from `pool`
    pub(crate) fn open(pool: &ConnectionPool, codec: RecordCodec, stmt: Statement) -> DbResult<Self> {
        // Acquire here so pool errors surface from the query call itself
        let conn = pool.acquire()?;
        let (sender, receiver) = bounded(0);

        let producer = thread::Builder::new()
            .name("record-cursor".into())
            .spawn(move || produce(conn, codec, stmt, sender))
            .map_err(|e| DbError::Cursor(format!("Failed to spawn cursor thread: {}", e)))?;

        Ok(Self {
            receiver: Some(receiver),
            producer: Some(producer),
            rows_read: 0,
        })
    }

    /// Rows yielded so far
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    pub fn is_closed(&self) -> bool {
        self.receiver.is_none()
    }

    /// Release the statement and return the connection to the pool.
    /// Idempotent.
    pub fn close(&mut self) {
        // Dropping the receiver fails the producer's next send
        if self.receiver.take().is_some() {
            trace!(rows = self.rows_read, "Closing record cursor");
        }
        if let Some(handle) = self.producer.take() {
            if handle.join().is_err() {
                debug!("Record cursor producer panicked");
            }
        }
    }
}

impl Iterator for RecordCursor {
    type Item = DbResult<SyncRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let received = self.receiver.as_ref()?.recv();
        match received {
            Ok(Ok(record)) => {
                self.rows_read += 1;
                Some(Ok(record))
            }
            Ok(Err(e)) => {
                self.close();
                Some(Err(e))
            }
            // Producer finished
            Err(_) => {
                self.close();
                None
            }
        }
    }
}

impl Drop for RecordCursor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Producer body: step the query and send one mapped row at a time
fn produce(
    conn: crate::db::pool::PooledConnection,
    codec: RecordCodec,
    stmt: Statement,
    sender: Sender<DbResult<SyncRecord>>,
) {
    let result = (|| -> DbResult<()> {
        let mut prepared = conn.prepare(&stmt.sql)?;
        let mut rows = prepared.query(params_from_iter(stmt.values.iter()))?;

        while let Some(row) = rows.next()? {
            let record = codec.map_row(row)?;
            if sender.send(Ok(record)).is_err() {
                // Consumer closed early
                return Ok(());
            }
        }
        Ok(())
    })();

    if let Err(e) = result {
        let _ = sender.send(Err(e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::codec::{build_select, RecordFilter};
    use crate::db::schema;
    use std::time::Duration;
    use tempfile::tempdir;

    fn setup(rows: usize) -> (tempfile::TempDir, ConnectionPool, RecordCodec) {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::new(
            dir.path().join("cursor.db"),
            2,
            Duration::from_secs(5),
            Duration::from_millis(500),
        );
        let codec = RecordCodec::new(2048, false);
        {
            let conn = pool.acquire().unwrap();
            schema::create_table(&conn, "objects", codec.registry()).unwrap();
            for i in 0..rows {
                conn.execute(
                    "INSERT INTO objects (source_id, is_directory, status) VALUES (?1, 0, 'Verified')",
                    [format!("/root/{}", i)],
                )
                .unwrap();
            }
        }
        (dir, pool, codec)
    }

    #[test]
    fn test_cursor_streams_all_rows() {
        let (_dir, pool, codec) = setup(25);
        let stmt = build_select("objects", codec.registry(), &RecordFilter::All);
        let mut cursor = RecordCursor::open(&pool, codec, stmt).unwrap();

        let records: Vec<_> = cursor.by_ref().collect::<DbResult<Vec<_>>>().unwrap();
        assert_eq!(records.len(), 25);
        assert_eq!(cursor.rows_read(), 25);
        assert!(cursor.is_closed());
        assert!(cursor.next().is_none());

        // Connection went back to the pool
        assert_eq!(pool.idle_connections(), pool.open_connections());
    }

    #[test]
    fn test_early_close_releases_connection() {
        let (_dir, pool, codec) = setup(10);
        let stmt = build_select("objects", codec.registry(), &RecordFilter::All);
        let mut cursor = RecordCursor::open(&pool, codec, stmt).unwrap();

        assert!(cursor.next().unwrap().is_ok());
        cursor.close();
        cursor.close();
        assert!(cursor.next().is_none());
        assert_eq!(pool.idle_connections(), pool.open_connections());
    }

    #[test]
    fn test_error_closes_cursor() {
        let (_dir, pool, codec) = setup(0);
        let stmt = Statement {
            sql: "SELECT * FROM missing_table".into(),
            values: Vec::new(),
        };
        let mut cursor = RecordCursor::open(&pool, codec, stmt).unwrap();

        assert!(matches!(cursor.next(), Some(Err(DbError::Sqlite(_)))));
        assert!(cursor.is_closed());
        assert!(cursor.next().is_none());
    }
}

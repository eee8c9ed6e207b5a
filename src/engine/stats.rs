//! Run statistics
//!
//! All counters live behind one mutex so a reader never sees, say, the
//! object count of one completion paired with the byte count of another.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Snapshot of the run counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub objects_complete: u64,
    pub objects_skipped: u64,
    pub objects_failed: u64,
    /// Objects whose data was already on the target; verify may still run
    pub objects_copy_skipped: u64,
    pub bytes_complete: u64,
    pub bytes_skipped: u64,
    pub bytes_copy_skipped: u64,
}

/// An object that failed, retained for the end-of-run summary
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FailedObject {
    pub identifier: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct StatsInner {
    counts: SyncCounts,
    failed_objects: BTreeSet<FailedObject>,
    started: Option<Instant>,
    stopped: Option<Instant>,
}

/// Shared run statistics
#[derive(Debug)]
pub struct SyncStats {
    inner: Mutex<StatsInner>,
    remember_failed: bool,
}

impl SyncStats {
    pub fn new(remember_failed: bool) -> Self {
        Self {
            inner: Mutex::new(StatsInner::default()),
            remember_failed,
        }
    }

    pub fn start(&self) {
        let mut inner = self.inner.lock();
        inner.started = Some(Instant::now());
        inner.stopped = None;
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.stopped.is_none() {
            inner.stopped = Some(Instant::now());
        }
    }

    /// Count one finished object
    ///
    /// A copy-skipped object is also counted as either skipped or complete;
    /// every counter moves under the same lock.
    pub fn record_done(&self, bytes: u64, copy_skipped: bool, skipped: bool) {
        let mut inner = self.inner.lock();
        let counts = &mut inner.counts;
        if copy_skipped {
            counts.objects_copy_skipped += 1;
            counts.bytes_copy_skipped += bytes;
        }
        if skipped {
            counts.objects_skipped += 1;
            counts.bytes_skipped += bytes;
        } else {
            counts.objects_complete += 1;
            counts.bytes_complete += bytes;
        }
    }

    /// Count a failure; the object is retained only when configured to
    pub fn add_failed(&self, identifier: &str, message: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.counts.objects_failed += 1;
        if self.remember_failed {
            inner.failed_objects.insert(FailedObject {
                identifier: identifier.to_string(),
                message: message.into(),
            });
        }
    }

    pub fn counts(&self) -> SyncCounts {
        self.inner.lock().counts
    }

    /// Failed objects in identifier order
    pub fn failed_objects(&self) -> Vec<FailedObject> {
        self.inner.lock().failed_objects.iter().cloned().collect()
    }

    /// Time since start, frozen once stopped
    pub fn elapsed(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.started, inner.stopped) {
            (Some(start), Some(stop)) => stop.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Completed objects per second
    pub fn objects_per_second(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.counts().objects_complete as f64 / secs
        } else {
            0.0
        }
    }
}

impl Default for SyncStats {
    fn default() -> Self {
        Self::new(false)
    }
}

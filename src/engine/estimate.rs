//! Background estimate of a run's total size
//!
//! The source is enumerated a second time on its own pool, independent of
//! the sync. Every object counts once; only data objects add bytes.

use crate::engine::pool::WorkerPool;
use crate::error::WorkerResult;
use crate::object::ObjectSummary;
use crate::plugin::SyncStorage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Totals counted so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncEstimate {
    pub total_objects: u64,
    pub total_bytes: u64,

    /// Enumeration finished; the totals are final
    pub complete: bool,
}

pub(crate) struct Estimator {
    source: Arc<dyn SyncStorage>,
    pool: WorkerPool,
    running: Arc<AtomicBool>,
    recursive: bool,
    objects: AtomicU64,
    bytes: AtomicU64,
    listed: AtomicBool,
    /// Stopped before the count finished
    abandoned: AtomicBool,
}

impl Estimator {
    pub fn new(
        source: Arc<dyn SyncStorage>,
        threads: usize,
        running: Arc<AtomicBool>,
        recursive: bool,
    ) -> WorkerResult<Arc<Self>> {
        Ok(Arc::new(Self {
            source,
            pool: WorkerPool::new("estimate", threads, None)?,
            running,
            recursive,
            objects: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            listed: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
        }))
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Start enumerating; returns immediately
    pub fn begin(self: &Arc<Self>) {
        let estimator = Arc::clone(self);
        if let Err(e) = self.pool.submit(move || estimator.list_top_level()) {
            debug!(error = %e, "Estimate not started");
        }
    }

    pub fn estimate(&self) -> SyncEstimate {
        SyncEstimate {
            total_objects: self.objects.load(Ordering::SeqCst),
            total_bytes: self.bytes.load(Ordering::SeqCst),
            complete: self.listed.load(Ordering::SeqCst)
                && self.pool.remaining() == 0
                && !self.abandoned.load(Ordering::SeqCst),
        }
    }

    /// Stop enumerating; queued work is dropped. Idempotent.
    pub fn stop(&self) {
        if !self.estimate().complete {
            self.abandoned.store(true, Ordering::SeqCst);
        }
        self.pool.stop();
    }

    /// Stop enumerating and wait for the workers
    pub fn finish(&self) {
        self.stop();
        self.pool.join();

        let estimate = self.estimate();
        info!(
            objects = estimate.total_objects,
            bytes = estimate.total_bytes,
            complete = estimate.complete,
            "Estimate finished"
        );
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn list_top_level(self: &Arc<Self>) {
        match self.source.all_objects() {
            Ok(objects) => {
                for summary in objects {
                    if !self.is_running() {
                        return;
                    }
                    self.submit(summary);
                }
                self.listed.store(true, Ordering::SeqCst);
            }
            Err(e) => warn!(error = %e, "Estimate could not list the source"),
        }
    }

    fn submit(self: &Arc<Self>, summary: ObjectSummary) {
        let estimator = Arc::clone(self);
        if let Err(e) = self.pool.submit(move || estimator.count(summary)) {
            debug!(error = %e, "Estimate task not accepted");
        }
    }

    fn count(self: &Arc<Self>, summary: ObjectSummary) {
        self.objects.fetch_add(1, Ordering::SeqCst);

        if !summary.directory {
            self.bytes.fetch_add(summary.size, Ordering::SeqCst);
        } else if self.recursive {
            match self.source.children(&summary) {
                Ok(children) => children.into_iter().for_each(|child| self.submit(child)),
                Err(e) => {
                    debug!(source_id = %summary.identifier, error = %e, "Estimate could not list directory")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::TestStorage;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_complete(estimator: &Estimator) -> SyncEstimate {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let estimate = estimator.estimate();
            if estimate.complete || Instant::now() > deadline {
                return estimate;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn source() -> Arc<TestStorage> {
        let source = Arc::new(TestStorage::new());
        source.insert_file("a", vec![0; 10]);
        source.insert_file("d/b", vec![0; 20]);
        source.insert_file("d/e/c", vec![0; 5]);
        source
    }

    #[test]
    fn test_counts_whole_tree() {
        let estimator = Estimator::new(source(), 2, Arc::new(AtomicBool::new(true)), true).unwrap();
        estimator.begin();

        let estimate = wait_complete(&estimator);
        assert!(estimate.complete);
        // Three files plus directories d and d/e
        assert_eq!(estimate.total_objects, 5);
        assert_eq!(estimate.total_bytes, 35);
        estimator.finish();
    }

    #[test]
    fn test_top_level_only() {
        let estimator = Estimator::new(source(), 2, Arc::new(AtomicBool::new(true)), false).unwrap();
        estimator.begin();

        let estimate = wait_complete(&estimator);
        assert_eq!(estimate.total_objects, 2);
        assert_eq!(estimate.total_bytes, 10);
        estimator.finish();
    }

    #[test]
    fn test_stopped_run_counts_nothing() {
        let estimator = Estimator::new(source(), 1, Arc::new(AtomicBool::new(false)), true).unwrap();
        estimator.begin();
        estimator.finish();

        let estimate = estimator.estimate();
        assert_eq!(estimate.total_objects, 0);
        assert!(!estimate.complete);
    }
}

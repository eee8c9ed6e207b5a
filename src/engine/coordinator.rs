//! Sync engine - orchestrates a migration run
//!
//! The engine is responsible for:
//! - Validating the configured plugins and building the filter chain
//! - Starting the query, sync and retry pools (and the estimate pool)
//! - Seeding the sync pool from the source's top-level objects
//! - Resizing the pools while the run is under way
//! - Detecting completion (or termination) and tearing the pools down
//! - Cleaning up every plugin exactly once

use crate::config::{validate_threads, SyncOptions};
use crate::db::StatusStore;
use crate::engine::estimate::{Estimator, SyncEstimate};
use crate::engine::pool::WorkerPool;
use crate::engine::stats::{FailedObject, SyncCounts, SyncStats};
use crate::engine::task::{submit_summary, EngineShared};
use crate::engine::throttle::Throttle;
use crate::error::{Result, SyncError};
use crate::plugin::{FilterChain, Md5Verifier, SyncFilter, SyncStorage, Verifier};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consecutive idle checks required before the run counts as complete
const STABLE_CHECKS_REQUIRED: u32 = 2;

/// Result of a finished run
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub counts: SyncCounts,

    /// Failed objects, when the engine was told to remember them
    pub failed_objects: Vec<FailedObject>,

    pub duration: Duration,

    /// Whether the run was cut short by `terminate()`
    pub terminated: bool,

    /// Source totals, when estimation was enabled
    pub estimate: Option<SyncEstimate>,
}

impl SyncSummary {
    pub fn objects_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            (self.counts.objects_complete + self.counts.objects_skipped) as f64 / secs
        } else {
            0.0
        }
    }
}

/// Snapshot of a running engine, for progress display
#[derive(Debug, Clone, Default)]
pub struct EngineProgress {
    pub counts: SyncCounts,
    pub sync_remaining: u64,
    pub query_remaining: u64,
    pub retry_remaining: u64,
    /// Objects waiting out a failure before their next attempt
    pub awaiting_retry: u64,
    pub query_threads: usize,
    pub sync_threads: usize,
    pub estimate: Option<SyncEstimate>,
    pub elapsed: Duration,
}

/// The pools of one run
#[derive(Clone)]
struct EnginePools {
    query: Arc<WorkerPool>,
    sync: Arc<WorkerPool>,
    retry: Arc<WorkerPool>,
    /// Not part of completion: the run never waits for an estimate
    estimate: Option<Arc<Estimator>>,
}

impl EnginePools {
    fn start(query_threads: usize, sync_threads: usize, queue_capacity: usize) -> Result<Self> {
        Ok(Self {
            query: Arc::new(WorkerPool::new("query", query_threads, None)?),
            sync: Arc::new(WorkerPool::new("sync", sync_threads, Some(queue_capacity))?),
            retry: Arc::new(WorkerPool::new("retry", 1, None)?),
            estimate: None,
        })
    }

    fn all(&self) -> [&Arc<WorkerPool>; 3] {
        [&self.query, &self.retry, &self.sync]
    }

    fn pause(&self) {
        self.all().iter().for_each(|p| p.pause());
        if let Some(estimator) = &self.estimate {
            estimator.pool().pause();
        }
    }

    fn resume(&self) {
        self.all().iter().for_each(|p| p.resume());
        if let Some(estimator) = &self.estimate {
            estimator.pool().resume();
        }
    }

    fn resize(&self, query_threads: usize, sync_threads: usize) -> Result<()> {
        self.query.resize(query_threads)?;
        self.sync.resize(sync_threads)?;
        if let Some(estimator) = &self.estimate {
            estimator.pool().resize(query_threads)?;
        }
        Ok(())
    }

    /// True when no pool has work and nothing was submitted while looking
    fn is_idle(&self) -> bool {
        let before: u64 = self.all().iter().map(|p| p.submitted()).sum();
        if self.all().iter().any(|p| p.remaining() > 0) {
            return false;
        }
        let after: u64 = self.all().iter().map(|p| p.submitted()).sum();
        before == after
    }

    fn stop(&self) {
        for pool in self.all() {
            pool.stop();
        }
        if let Some(estimator) = &self.estimate {
            estimator.stop();
        }
    }

    /// Graceful shutdown; producers first so nothing submits into a closed pool
    fn shutdown_and_join(&self) {
        for pool in self.all() {
            pool.shutdown();
        }
        for pool in self.all() {
            pool.join();
        }
        if let Some(estimator) = &self.estimate {
            estimator.finish();
        }
    }
}

/// Cloneable handle that stops a running engine from another thread
#[derive(Clone)]
pub struct TerminateHandle {
    running: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    pools: Arc<Mutex<Option<EnginePools>>>,
}

impl TerminateHandle {
    /// Stop the run: no new submissions, queued tasks discarded
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if let Some(pools) = self.pools.lock().as_ref() {
            pools.stop();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Migrates objects from a source to a target, tracking status in a store
pub struct SyncEngine {
    options: SyncOptions,
    source: Option<Arc<dyn SyncStorage>>,
    target: Option<Arc<dyn SyncStorage>>,
    filters: Vec<Arc<dyn SyncFilter>>,
    /// Filled with the default verifier at run time if none was given
    verifier: Mutex<Option<Arc<dyn Verifier>>>,
    store: Option<Arc<StatusStore>>,
    stats: Arc<SyncStats>,
    /// Query and sync thread counts; the live pools follow changes
    thread_counts: Mutex<(usize, usize)>,
    awaiting_retry: Arc<AtomicU64>,

    running: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    started: AtomicBool,
    cleaned_up: AtomicBool,
    pools: Arc<Mutex<Option<EnginePools>>>,
}

impl SyncEngine {
    pub fn new(options: SyncOptions) -> Self {
        let stats = Arc::new(SyncStats::new(options.remember_failed));
        let thread_counts = (options.query_threads, options.sync_threads);
        Self {
            options,
            source: None,
            target: None,
            filters: Vec::new(),
            verifier: Mutex::new(None),
            store: None,
            stats,
            thread_counts: Mutex::new(thread_counts),
            awaiting_retry: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            terminated: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
            pools: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn SyncStorage>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_target(mut self, target: Arc<dyn SyncStorage>) -> Self {
        self.target = Some(target);
        self
    }

    /// Append a filter; filters run in the order they are added
    pub fn with_filter(mut self, filter: Arc<dyn SyncFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Replace the default MD5 verifier
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        *self.verifier.get_mut() = Some(verifier);
        self
    }

    /// Status store; the caller keeps ownership and closes it
    pub fn with_store(mut self, store: Arc<StatusStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn stats(&self) -> Arc<SyncStats> {
        Arc::clone(&self.stats)
    }

    /// The verifier in use; the default one appears once a run starts
    pub fn verifier(&self) -> Option<Arc<dyn Verifier>> {
        self.verifier.lock().clone()
    }

    /// Current query and sync thread counts
    pub fn thread_counts(&self) -> (usize, usize) {
        *self.thread_counts.lock()
    }

    /// Change the query and sync thread counts
    ///
    /// Before a run this replaces the configured counts; during one the
    /// pools grow at once and shrink as busy workers finish. The sync queue
    /// keeps the capacity it started with.
    pub fn set_thread_counts(&self, query_threads: usize, sync_threads: usize) -> Result<()> {
        validate_threads("query", query_threads)?;
        validate_threads("sync", sync_threads)?;

        let pools = self.pools.lock();
        *self.thread_counts.lock() = (query_threads, sync_threads);
        if let Some(pools) = pools.as_ref().filter(|_| self.is_running()) {
            pools.resize(query_threads, sync_threads)?;
        }
        info!(query_threads, sync_threads, "Thread counts updated");
        Ok(())
    }

    /// Objects that failed and are queued for another attempt
    pub fn objects_awaiting_retry(&self) -> u64 {
        self.awaiting_retry.load(Ordering::SeqCst)
    }

    /// Source totals counted so far, when estimation is enabled
    pub fn estimate(&self) -> Option<SyncEstimate> {
        self.pools
            .lock()
            .as_ref()
            .and_then(|pools| pools.estimate.as_ref())
            .map(|estimator| estimator.estimate())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn terminate_handle(&self) -> TerminateHandle {
        TerminateHandle {
            running: Arc::clone(&self.running),
            terminated: Arc::clone(&self.terminated),
            pools: Arc::clone(&self.pools),
        }
    }

    pub fn terminate(&self) {
        self.terminate_handle().terminate();
    }

    /// Stop workers from taking new tasks until `resume()`
    pub fn pause(&self) {
        if let Some(pools) = self.pools.lock().as_ref() {
            pools.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(pools) = self.pools.lock().as_ref() {
            pools.resume();
        }
    }

    /// Current counters and pool backlogs
    pub fn progress(&self) -> EngineProgress {
        let mut progress = EngineProgress {
            counts: self.stats.counts(),
            awaiting_retry: self.objects_awaiting_retry(),
            elapsed: self.stats.elapsed(),
            ..EngineProgress::default()
        };
        (progress.query_threads, progress.sync_threads) = self.thread_counts();
        if let Some(pools) = self.pools.lock().as_ref() {
            progress.sync_remaining = pools.sync.remaining();
            progress.query_remaining = pools.query.remaining();
            progress.retry_remaining = pools.retry.remaining();
            progress.estimate = pools.estimate.as_ref().map(|e| e.estimate());
        }
        progress
    }

    /// Run the migration to completion or termination
    pub fn run(&self) -> Result<SyncSummary> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyStarted);
        }

        let result = self.run_inner();
        self.cleanup_plugins();
        result
    }

    fn run_inner(&self) -> Result<SyncSummary> {
        let source = self.source.clone().ok_or(SyncError::MissingPlugin("source"))?;
        let target = self.target.clone().ok_or(SyncError::MissingPlugin("target"))?;
        let store = self.store.clone().ok_or(SyncError::MissingPlugin("status store"))?;
        self.options.validate()?;

        // Stored so cleanup sees the default verifier as well
        let verifier = Arc::clone(self.verifier.lock().get_or_insert_with(|| {
            Arc::new(Md5Verifier::new(self.options.use_metadata_checksum)) as Arc<dyn Verifier>
        }));
        let chain = FilterChain::new(self.filters.clone(), target, store.is_extended());

        let pools = {
            let mut slot = self.pools.lock();
            let (query_threads, sync_threads) = self.thread_counts();
            let mut pools =
                EnginePools::start(query_threads, sync_threads, self.options.queue_capacity())?;
            if self.options.estimate {
                pools.estimate = Some(Estimator::new(
                    Arc::clone(&source),
                    query_threads,
                    Arc::clone(&self.running),
                    self.options.recursive,
                )?);
            }
            *slot = Some(pools.clone());

            // A terminate() that raced ahead of run() still wins
            self.running
                .store(!self.terminated.load(Ordering::SeqCst), Ordering::SeqCst);
            pools
        };
        self.stats.start();

        let (query_threads, sync_threads) = self.thread_counts();
        info!(
            source = source.name(),
            target = chain.target().name(),
            filters = chain.filters().len(),
            verifier = verifier.name(),
            query_threads,
            sync_threads,
            queue_capacity = self.options.queue_capacity(),
            throughput_limit = ?self.options.throughput_limit,
            bandwidth_limit = ?self.options.bandwidth_limit,
            "Starting sync"
        );

        let shared = Arc::new(EngineShared {
            options: self.options.clone(),
            source: Arc::clone(&source),
            chain,
            verifier,
            store,
            stats: Arc::clone(&self.stats),
            running: Arc::clone(&self.running),
            query_pool: Arc::clone(&pools.query),
            sync_pool: Arc::clone(&pools.sync),
            retry_pool: Arc::clone(&pools.retry),
            awaiting_retry: Arc::clone(&self.awaiting_retry),
            throughput: self
                .options
                .throughput_limit
                .map(|limit| Throttle::new("objects", limit)),
            bandwidth: self
                .options
                .bandwidth_limit
                .map(|limit| Throttle::new("bytes", limit as f64)),
        });

        if let Some(estimator) = &pools.estimate {
            estimator.begin();
        }
        let seeded = self.seed(&shared);
        let completed = seeded.is_ok() && self.wait_for_completion(&pools);

        if !self.is_running() {
            warn!("Sync terminated early");
        }
        self.running.store(false, Ordering::SeqCst);
        pools.shutdown_and_join();
        self.stats.stop();
        seeded?;

        let summary = SyncSummary {
            counts: self.stats.counts(),
            failed_objects: self.stats.failed_objects(),
            duration: self.stats.elapsed(),
            terminated: !completed,
            estimate: pools.estimate.as_ref().map(|e| e.estimate()),
        };

        info!(
            complete = summary.counts.objects_complete,
            skipped = summary.counts.objects_skipped,
            failed = summary.counts.objects_failed,
            bytes = summary.counts.bytes_complete,
            duration_secs = summary.duration.as_secs(),
            "Sync finished"
        );
        Ok(summary)
    }

    /// Submit the source's top-level objects for sync
    fn seed(&self, shared: &Arc<EngineShared>) -> Result<()> {
        let mut count = 0u64;
        for summary in shared.source.all_objects()? {
            if !self.is_running() {
                break;
            }
            submit_summary(shared, summary);
            count += 1;
        }
        debug!(count, "Top-level objects submitted");
        Ok(())
    }

    /// Wait for every pool to drain, or for termination
    fn wait_for_completion(&self, pools: &EnginePools) -> bool {
        let mut stable_count = 0;

        loop {
            if !self.is_running() {
                return false;
            }

            if pools.is_idle() {
                stable_count += 1;
                if stable_count >= STABLE_CHECKS_REQUIRED {
                    info!("All tasks complete");
                    return true;
                }
            } else {
                stable_count = 0;
            }

            thread::sleep(self.options.poll_interval);
        }
    }

    /// Call `cleanup()` once on every distinct plugin instance
    fn cleanup_plugins(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut seen: HashSet<*const ()> = HashSet::new();
        let mut first_time = |ptr: *const ()| seen.insert(ptr);

        for storage in [&self.source, &self.target].into_iter().flatten() {
            if first_time(Arc::as_ptr(storage) as *const ()) {
                debug!(plugin = storage.name(), "Cleaning up storage");
                storage.cleanup();
            }
        }
        for filter in &self.filters {
            if first_time(Arc::as_ptr(filter) as *const ()) {
                debug!(plugin = filter.name(), "Cleaning up filter");
                filter.cleanup();
            }
        }
        if let Some(verifier) = self.verifier.lock().as_ref() {
            if first_time(Arc::as_ptr(verifier) as *const ()) {
                debug!(plugin = verifier.name(), "Cleaning up verifier");
                verifier.cleanup();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoreConfig;
    use crate::error::{ConfigError, ObjectError, ObjectResult};
    use crate::object::{ObjectContext, SyncObject};
    use crate::plugin::TestStorage;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Arc<StatusStore> {
        Arc::new(StatusStore::new(StoreConfig::new(dir.path().join("status.db"))))
    }

    fn options() -> SyncOptions {
        SyncOptions {
            query_threads: 2,
            sync_threads: 2,
            poll_interval: Duration::from_millis(10),
            ..SyncOptions::default()
        }
    }

    /// Filter that counts cleanups
    #[derive(Default)]
    struct CountingFilter {
        cleanups: AtomicUsize,
    }

    impl SyncFilter for CountingFilter {
        fn name(&self) -> &str {
            "counting"
        }

        fn filter(&self, _ctx: &mut ObjectContext, object: SyncObject) -> ObjectResult<SyncObject> {
            Ok(object)
        }

        fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Verifier that accepts everything and counts cleanups
    #[derive(Default)]
    struct CountingVerifier {
        cleanups: AtomicUsize,
    }

    impl Verifier for CountingVerifier {
        fn name(&self) -> &str {
            "counting"
        }

        fn verify(&self, _source: &SyncObject, _target: &SyncObject) -> ObjectResult<()> {
            Ok(())
        }

        fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_missing_plugins() {
        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::new(options()).with_store(store(&dir));
        assert!(matches!(engine.run(), Err(SyncError::MissingPlugin("source"))));

        let engine = SyncEngine::new(options())
            .with_source(Arc::new(TestStorage::new()))
            .with_store(store(&dir));
        assert!(matches!(engine.run(), Err(SyncError::MissingPlugin("target"))));
    }

    #[test]
    fn test_run_only_once() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(TestStorage::new());
        source.insert_file("a", b"abc".to_vec());

        let engine = SyncEngine::new(options())
            .with_source(source)
            .with_target(Arc::new(TestStorage::new()))
            .with_store(store(&dir));

        let summary = engine.run().unwrap();
        assert_eq!(summary.counts.objects_complete, 1);
        assert!(!summary.terminated);
        assert!(matches!(engine.run(), Err(SyncError::AlreadyStarted)));
    }

    #[test]
    fn test_cleanup_once_per_plugin() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(TestStorage::new());
        storage.insert_file("a", b"abc".to_vec());
        let filter = Arc::new(CountingFilter::default());

        // Same instance twice in the chain, and source == target
        let engine = SyncEngine::new(options())
            .with_source(storage.clone())
            .with_target(storage)
            .with_filter(filter.clone())
            .with_filter(filter.clone())
            .with_store(store(&dir));

        engine.run().unwrap();
        assert_eq!(filter.cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_verifier_is_kept() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(TestStorage::new());
        source.insert_file("a", b"abc".to_vec());

        let engine = SyncEngine::new(SyncOptions {
            verify: true,
            ..options()
        })
        .with_source(source)
        .with_target(Arc::new(TestStorage::new()))
        .with_store(store(&dir));
        assert!(engine.verifier().is_none());

        engine.run().unwrap();
        let verifier = engine.verifier().expect("default verifier stored");
        assert_eq!(verifier.name(), "md5");
    }

    #[test]
    fn test_custom_verifier_cleaned_once() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(TestStorage::new());
        source.insert_file("a", b"abc".to_vec());
        let verifier = Arc::new(CountingVerifier::default());

        let engine = SyncEngine::new(SyncOptions {
            verify: true,
            ..options()
        })
        .with_source(source)
        .with_target(Arc::new(TestStorage::new()))
        .with_verifier(verifier.clone())
        .with_store(store(&dir));

        let summary = engine.run().unwrap();
        assert_eq!(summary.counts.objects_complete, 1);
        assert_eq!(engine.verifier().unwrap().name(), "counting");
        assert_eq!(verifier.cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_thread_counts_before_run() {
        let engine = SyncEngine::new(options());
        assert_eq!(engine.thread_counts(), (2, 2));

        engine.set_thread_counts(3, 5).unwrap();
        assert_eq!(engine.thread_counts(), (3, 5));
        assert_eq!(engine.progress().sync_threads, 5);

        assert!(matches!(
            engine.set_thread_counts(0, 5),
            Err(SyncError::Config(ConfigError::InvalidThreadCount { pool: "query", .. }))
        ));
        assert_eq!(engine.thread_counts(), (3, 5));
    }

    #[test]
    fn test_cleanup_on_error_path() {
        let dir = TempDir::new().unwrap();
        let filter = Arc::new(CountingFilter::default());
        let engine = SyncEngine::new(options())
            .with_filter(filter.clone())
            .with_store(store(&dir));

        assert!(engine.run().is_err());
        assert_eq!(filter.cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_listing_does_not_stop_run() {
        struct BrokenChildren(TestStorage);

        impl SyncStorage for BrokenChildren {
            fn name(&self) -> &str {
                "broken"
            }
            fn identifier(&self, relative_path: &str, directory: bool) -> String {
                self.0.identifier(relative_path, directory)
            }
            fn relative_path(&self, identifier: &str) -> String {
                self.0.relative_path(identifier)
            }
            fn all_objects(
                &self,
            ) -> ObjectResult<Box<dyn Iterator<Item = crate::object::ObjectSummary> + Send + '_>> {
                self.0.all_objects()
            }
            fn children(
                &self,
                parent: &crate::object::ObjectSummary,
            ) -> ObjectResult<Vec<crate::object::ObjectSummary>> {
                Err(ObjectError::Transfer {
                    identifier: parent.identifier.clone(),
                    reason: "listing refused".into(),
                })
            }
            fn load_object(&self, identifier: &str) -> ObjectResult<SyncObject> {
                self.0.load_object(identifier)
            }
            fn update_object(&self, identifier: &str, object: &SyncObject) -> ObjectResult<()> {
                self.0.update_object(identifier, object)
            }
            fn delete(&self, identifier: &str) -> ObjectResult<()> {
                self.0.delete(identifier)
            }
        }

        let inner = TestStorage::new();
        inner.insert_file("a", b"1".to_vec());
        inner.insert_file("d/b", b"2".to_vec());

        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::new(SyncOptions {
            remember_failed: true,
            ..options()
        })
        .with_source(Arc::new(BrokenChildren(inner)))
        .with_target(Arc::new(TestStorage::new()))
        .with_store(store(&dir));

        let summary = engine.run().unwrap();
        // "a" and directory "d" sync; listing "d" fails
        assert_eq!(summary.counts.objects_complete, 2);
        assert_eq!(summary.counts.objects_failed, 1);
        assert_eq!(summary.failed_objects[0].identifier, "/root/d");
    }

    #[test]
    fn test_terminate_before_run() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(TestStorage::new());
        source.insert_file("a", b"abc".to_vec());

        let engine = SyncEngine::new(options())
            .with_source(source)
            .with_target(Arc::new(TestStorage::new()))
            .with_store(store(&dir));
        let handle = engine.terminate_handle();
        handle.terminate();

        let summary = engine.run().unwrap();
        assert!(summary.terminated);
        assert!(handle.is_terminated());
        assert_eq!(summary.counts.objects_complete, 0);
    }
}

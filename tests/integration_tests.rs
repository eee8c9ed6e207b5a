//! Integration tests for objsync
//!
//! Everything runs against the in-memory test storage and a SQLite status
//! database in a temporary directory.

use chrono::Utc;
use objsync::config::SyncOptions;
use objsync::db::{schema, StatusStore, StoreConfig, SyncRecord};
use objsync::engine::{SyncEngine, WorkerPool};
use objsync::error::{ObjectError, ObjectResult};
use objsync::object::{ObjectContext, ObjectStatus, ObjectSummary, SyncObject};
use objsync::plugin::{DelayFilter, SyncStorage, TestStorage};
use rusqlite::Connection;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

fn store_at(dir: &TempDir, extended: bool) -> StatusStore {
    StatusStore::new(StoreConfig::new(dir.path().join("status.db")).with_extended(extended))
}

fn test_options() -> SyncOptions {
    SyncOptions {
        query_threads: 2,
        sync_threads: 2,
        poll_interval: Duration::from_millis(10),
        ..SyncOptions::default()
    }
}

fn all_records(store: &StatusStore) -> Vec<SyncRecord> {
    store
        .all_records()
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

/// Test storage whose writes of one identifier always fail
struct FailingTarget {
    inner: TestStorage,
    fail_id: String,
    attempts: AtomicUsize,
}

impl SyncStorage for FailingTarget {
    fn name(&self) -> &str {
        "failing"
    }

    fn identifier(&self, relative_path: &str, directory: bool) -> String {
        self.inner.identifier(relative_path, directory)
    }

    fn relative_path(&self, identifier: &str) -> String {
        self.inner.relative_path(identifier)
    }

    fn all_objects(&self) -> ObjectResult<Box<dyn Iterator<Item = ObjectSummary> + Send + '_>> {
        self.inner.all_objects()
    }

    fn children(&self, parent: &ObjectSummary) -> ObjectResult<Vec<ObjectSummary>> {
        self.inner.children(parent)
    }

    fn load_object(&self, identifier: &str) -> ObjectResult<SyncObject> {
        self.inner.load_object(identifier)
    }

    fn update_object(&self, identifier: &str, object: &SyncObject) -> ObjectResult<()> {
        if identifier == self.fail_id {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            return Err(ObjectError::Transfer {
                identifier: identifier.to_string(),
                reason: format!("injected failure {}", attempt),
            });
        }
        self.inner.update_object(identifier, object)
    }

    fn delete(&self, identifier: &str) -> ObjectResult<()> {
        self.inner.delete(identifier)
    }
}

#[test]
fn test_upsert_round_trip() {
    let dir = tempdir().unwrap();
    let store = StatusStore::new(StoreConfig::new(dir.path().join("status.db")));

    let ctx = ObjectContext::new(ObjectSummary::file("/root/a", 10)).with_status(ObjectStatus::InTransfer);
    store.set_status(&ctx, None, true).unwrap();

    let record = store.get_record("/root/a").unwrap().unwrap();
    assert_eq!(record.status, Some(ObjectStatus::InTransfer));
    assert_eq!(record.size, 10);
    assert!(!record.directory);

    let started = record.transfer_start.expect("transfer_start set");
    assert!((Utc::now() - started).num_milliseconds().abs() < 1000);

    assert_eq!(record.target_id, None);
    assert_eq!(record.transfer_complete, None);
    assert_eq!(record.verify_start, None);
    assert_eq!(record.verify_complete, None);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.error_message, None);
    assert!(!record.source_deleted);

    assert!(store.get_record("/root/missing").unwrap().is_none());
    store.close();
}

#[test]
fn test_sticky_first_error() {
    let dir = tempdir().unwrap();
    let store = store_at(&dir, true);

    let ctx = ObjectContext::new(ObjectSummary::file("/root/e", 1)).with_status(ObjectStatus::RetryQueue);
    store.set_status(&ctx, Some("a"), true).unwrap();

    let ctx = ctx.with_status(ObjectStatus::Error);
    store.set_status(&ctx, Some("b"), false).unwrap();

    let record = store.get_record("/root/e").unwrap().unwrap();
    assert_eq!(record.error_message.as_deref(), Some("b"));
    assert_eq!(record.first_error_message.as_deref(), Some("a"));

    // A quote in a later error must not break the spliced COALESCE
    store.set_status(&ctx, Some("it's c"), false).unwrap();
    let record = store.get_record("/root/e").unwrap().unwrap();
    assert_eq!(record.error_message.as_deref(), Some("it's c"));
    assert_eq!(record.first_error_message.as_deref(), Some("a"));
    store.close();
}

#[test]
fn test_schema_migration_is_additive_and_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("status.db");
    let ctx = ObjectContext::new(ObjectSummary::file("/root/m", 1)).with_status(ObjectStatus::InTransfer);

    let columns = || {
        let conn = Connection::open(&path).unwrap();
        schema::existing_columns(&conn, schema::DEFAULT_TABLE_NAME).unwrap()
    };

    let base = store_at(&dir, false);
    base.set_status(&ctx, None, true).unwrap();
    base.close();
    let base_columns = columns();
    assert!(!base_columns.contains("first_error_message"));

    let extended = store_at(&dir, true);
    extended.get_record("/root/m").unwrap();
    extended.close();
    let extended_columns = columns();
    assert_eq!(extended_columns.len(), base_columns.len() + schema::EXTENDED_FIELDS.len());
    for field in schema::EXTENDED_FIELDS.iter() {
        assert!(extended_columns.contains(field.name));
    }

    // Second extended open is a no-op; the old row is still readable
    let again = store_at(&dir, true);
    let record = again.get_record("/root/m").unwrap().unwrap();
    assert_eq!(record.first_error_message, None);
    again.close();
    assert_eq!(columns(), extended_columns);
}

#[test]
fn test_sync_scenario_all_verified() {
    let dir = tempdir().unwrap();
    let store = Arc::new(store_at(&dir, false));

    let source = Arc::new(TestStorage::new());
    source.insert_file("a", vec![b'a'; 10]);
    source.insert_file("b/c", vec![b'c'; 5]);
    let target = Arc::new(TestStorage::new());

    let engine = SyncEngine::new(SyncOptions {
        verify: true,
        ..test_options()
    })
    .with_source(source)
    .with_target(target.clone())
    .with_store(Arc::clone(&store));

    let summary = engine.run().unwrap();
    assert!(!summary.terminated);
    assert_eq!(summary.counts.objects_complete, 3);
    assert_eq!(summary.counts.objects_failed, 0);
    assert_eq!(summary.counts.bytes_complete, 15);

    let records = all_records(&store);
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|r| r.status == Some(ObjectStatus::Verified)));

    let mut ids: Vec<_> = records.iter().map(|r| r.source_id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["/root/a", "/root/b", "/root/b/c"]);

    assert!(target.contains("/root/b/c"));
    let dir_record = records.iter().find(|r| r.source_id == "/root/b").unwrap();
    assert!(dir_record.directory);
    store.close();
}

#[test]
fn test_resumed_run_skips_synced_objects() {
    let dir = tempdir().unwrap();
    let store = Arc::new(store_at(&dir, false));

    let source = Arc::new(TestStorage::new());
    source.insert_file("a", b"one".to_vec());
    source.insert_file("d/b", b"two".to_vec());
    let target = Arc::new(TestStorage::new());

    let options = SyncOptions {
        verify: true,
        ..test_options()
    };
    let first = SyncEngine::new(options.clone())
        .with_source(source.clone())
        .with_target(target.clone())
        .with_store(Arc::clone(&store))
        .run()
        .unwrap();
    assert_eq!(first.counts.objects_complete, 3);

    let second = SyncEngine::new(options)
        .with_source(source)
        .with_target(target)
        .with_store(Arc::clone(&store))
        .run()
        .unwrap();
    assert_eq!(second.counts.objects_complete, 0);
    assert_eq!(second.counts.objects_skipped, 3);
    assert_eq!(second.counts.objects_copy_skipped, 3);
    store.close();
}

#[test]
fn test_retry_budget_exhausted() {
    let dir = tempdir().unwrap();
    let store = Arc::new(store_at(&dir, true));

    let source = Arc::new(TestStorage::new());
    source.insert_file("x", b"doomed".to_vec());
    source.insert_file("ok", b"fine".to_vec());

    let target = Arc::new(FailingTarget {
        inner: TestStorage::new(),
        fail_id: "/root/x".into(),
        attempts: AtomicUsize::new(0),
    });

    let engine = SyncEngine::new(SyncOptions {
        retry_attempts: 2,
        remember_failed: true,
        ..test_options()
    })
    .with_source(source)
    .with_target(target.clone())
    .with_store(Arc::clone(&store));

    let summary = engine.run().unwrap();
    assert_eq!(summary.counts.objects_complete, 1);
    assert_eq!(summary.counts.objects_failed, 1);
    assert_eq!(summary.failed_objects.len(), 1);
    assert_eq!(summary.failed_objects[0].identifier, "/root/x");

    // Initial attempt plus two retries
    assert_eq!(target.attempts.load(Ordering::SeqCst), 3);

    let record = store.get_record("/root/x").unwrap().unwrap();
    assert_eq!(record.status, Some(ObjectStatus::Error));
    assert_eq!(record.retry_count, 2);
    assert!(record
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("injected failure 3")));
    assert!(record
        .first_error_message
        .as_deref()
        .is_some_and(|m| m.contains("injected failure 1")));

    let errors: Vec<String> = store
        .error_records()
        .unwrap()
        .map(|r| r.unwrap().source_id)
        .collect();
    assert_eq!(errors, vec!["/root/x".to_string()]);
    assert_eq!(store.retry_queue_records().unwrap().count(), 0);
    store.close();
}

fn failing_target(fail_id: &str) -> Arc<FailingTarget> {
    Arc::new(FailingTarget {
        inner: TestStorage::new(),
        fail_id: fail_id.into(),
        attempts: AtomicUsize::new(0),
    })
}

#[test]
fn test_error_record_survives_rerun() {
    let dir = tempdir().unwrap();
    let store = Arc::new(store_at(&dir, false));

    let source = Arc::new(TestStorage::new());
    source.insert_file("x", b"doomed".to_vec());
    source.insert_file("ok", b"fine".to_vec());
    let target = failing_target("/root/x");

    let options = SyncOptions {
        retry_attempts: 2,
        ..test_options()
    };
    let run = |options: SyncOptions, target: Arc<dyn SyncStorage>| {
        SyncEngine::new(options)
            .with_source(source.clone())
            .with_target(target)
            .with_store(Arc::clone(&store))
            .run()
            .unwrap()
    };

    let first = run(options.clone(), target.clone());
    assert_eq!(first.counts.objects_failed, 1);
    assert_eq!(target.attempts.load(Ordering::SeqCst), 3);

    // Same failing target again: the object is left alone
    let second = run(options.clone(), target.clone());
    assert_eq!(target.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(second.counts.objects_failed, 0);
    assert_eq!(second.counts.objects_complete, 0);
    assert_eq!(second.counts.objects_skipped, 2);

    let record = store.get_record("/root/x").unwrap().unwrap();
    assert_eq!(record.status, Some(ObjectStatus::Error));
    assert_eq!(record.retry_count, 2);
    assert!(record
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("injected failure 3")));

    // Forcing the sync starts the object over with a full budget
    let healthy = Arc::new(TestStorage::new());
    let forced = run(
        SyncOptions {
            force_sync: true,
            ..options
        },
        healthy.clone(),
    );
    assert_eq!(forced.counts.objects_failed, 0);
    assert_eq!(forced.counts.objects_complete, 2);
    assert!(healthy.contains("/root/x"));

    let record = store.get_record("/root/x").unwrap().unwrap();
    assert_eq!(record.status, Some(ObjectStatus::Transferred));
    assert_eq!(record.retry_count, 0);
    store.close();
}

#[test]
fn test_resumed_object_keeps_retry_count() {
    let dir = tempdir().unwrap();
    let store = Arc::new(store_at(&dir, false));

    let source = Arc::new(TestStorage::new());
    source.insert_file("x", b"doomed".to_vec());

    // Left in the retry queue by an interrupted run
    let mut ctx =
        ObjectContext::new(ObjectSummary::file("/root/x", 6)).with_status(ObjectStatus::RetryQueue);
    ctx.set_failures(1);
    store.set_status(&ctx, Some("injected failure 0"), true).unwrap();

    let target = failing_target("/root/x");
    let summary = SyncEngine::new(SyncOptions {
        retry_attempts: 2,
        ..test_options()
    })
    .with_source(source)
    .with_target(target.clone())
    .with_store(Arc::clone(&store))
    .run()
    .unwrap();

    // One retry was already spent
    assert_eq!(target.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(summary.counts.objects_failed, 1);

    let record = store.get_record("/root/x").unwrap().unwrap();
    assert_eq!(record.status, Some(ObjectStatus::Error));
    assert_eq!(record.retry_count, 2);
    store.close();
}

#[test]
fn test_awaiting_retry_gauge() {
    let dir = tempdir().unwrap();
    let store = Arc::new(store_at(&dir, false));

    // Listed in sorted order: "a" syncs first and its retry queues behind
    // the slow objects
    let source = Arc::new(TestStorage::new());
    source.insert_file("a", b"doomed".to_vec());
    for i in 0..10 {
        source.insert_file(&format!("f{}", i), vec![0u8; 4]);
    }

    let engine = Arc::new(
        SyncEngine::new(SyncOptions {
            sync_threads: 1,
            retry_attempts: 1,
            ..test_options()
        })
        .with_source(source)
        .with_target(failing_target("/root/a"))
        .with_filter(Arc::new(DelayFilter::new(Duration::from_millis(20))))
        .with_store(Arc::clone(&store)),
    );

    let finished = Arc::new(AtomicBool::new(false));
    let sampler = {
        let engine = Arc::clone(&engine);
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            let mut peak = 0;
            while !finished.load(Ordering::SeqCst) {
                peak = peak.max(engine.objects_awaiting_retry());
                thread::sleep(Duration::from_millis(1));
            }
            peak
        })
    };

    let summary = engine.run().unwrap();
    finished.store(true, Ordering::SeqCst);
    let peak = sampler.join().unwrap();

    assert_eq!(peak, 1);
    assert_eq!(engine.objects_awaiting_retry(), 0);
    assert_eq!(summary.counts.objects_complete, 10);
    assert_eq!(summary.counts.objects_failed, 1);
    store.close();
}

#[test]
fn test_throughput_limit_paces_run() {
    let dir = tempdir().unwrap();
    let store = Arc::new(store_at(&dir, false));

    let source = Arc::new(TestStorage::new());
    for i in 0..6 {
        source.insert_file(&format!("f{}", i), vec![0u8; 4]);
    }

    let start = Instant::now();
    let summary = SyncEngine::new(SyncOptions {
        throughput_limit: Some(20.0),
        ..test_options()
    })
    .with_source(source)
    .with_target(Arc::new(TestStorage::new()))
    .with_store(Arc::clone(&store))
    .run()
    .unwrap();

    assert_eq!(summary.counts.objects_complete, 6);
    // Five 50ms gaps after the first object
    assert!(start.elapsed() >= Duration::from_millis(230));
    store.close();
}

#[test]
fn test_bandwidth_limit_paces_transfers() {
    let dir = tempdir().unwrap();
    let store = Arc::new(store_at(&dir, false));

    let source = Arc::new(TestStorage::new());
    for i in 0..3 {
        source.insert_file(&format!("f{}", i), vec![0u8; 100]);
    }

    let start = Instant::now();
    let summary = SyncEngine::new(SyncOptions {
        bandwidth_limit: Some(1000),
        ..test_options()
    })
    .with_source(source)
    .with_target(Arc::new(TestStorage::new()))
    .with_store(Arc::clone(&store))
    .run()
    .unwrap();

    assert_eq!(summary.counts.bytes_complete, 300);
    // 100 bytes at 1000 B/s is 100ms for each transfer after the first
    assert!(start.elapsed() >= Duration::from_millis(180));
    store.close();
}

#[test]
fn test_resize_during_run() {
    let dir = tempdir().unwrap();
    let store = Arc::new(store_at(&dir, false));

    let source = Arc::new(TestStorage::new());
    for i in 0..40 {
        source.insert_file(&format!("f{}", i), vec![0u8; 8]);
    }

    let engine = Arc::new(
        SyncEngine::new(SyncOptions {
            query_threads: 1,
            sync_threads: 1,
            ..test_options()
        })
        .with_source(source)
        .with_target(Arc::new(TestStorage::new()))
        .with_filter(Arc::new(DelayFilter::new(Duration::from_millis(10))))
        .with_store(Arc::clone(&store)),
    );

    let resizer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            while !engine.is_running() {
                thread::sleep(Duration::from_millis(1));
            }
            engine.set_thread_counts(2, 4).unwrap();
            assert!(engine.set_thread_counts(2, 0).is_err());
            engine.progress().sync_threads
        })
    };

    let summary = engine.run().unwrap();
    let sync_threads = resizer.join().unwrap();

    assert!(!summary.terminated);
    assert_eq!(summary.counts.objects_complete, 40);
    assert_eq!(engine.thread_counts(), (2, 4));
    assert_eq!(sync_threads, 4);
    store.close();
}

#[test]
fn test_estimate_counts_source() {
    let dir = tempdir().unwrap();
    let store = Arc::new(store_at(&dir, false));

    let source = Arc::new(TestStorage::new());
    source.insert_file("a", vec![0u8; 10]);
    source.insert_file("d/b", vec![0u8; 20]);
    source.insert_file("d/e/c", vec![0u8; 5]);

    let engine = SyncEngine::new(SyncOptions {
        sync_threads: 1,
        estimate: true,
        ..test_options()
    })
    .with_source(source.clone())
    .with_target(Arc::new(TestStorage::new()))
    .with_filter(Arc::new(DelayFilter::new(Duration::from_millis(30))))
    .with_store(Arc::clone(&store));
    assert!(engine.estimate().is_none());

    let summary = engine.run().unwrap();
    let estimate = summary.estimate.expect("estimate enabled");
    assert!(estimate.complete);
    assert_eq!(estimate.total_objects, 5);
    assert_eq!(estimate.total_bytes, 35);
    assert_eq!(summary.counts.objects_complete, 5);
    assert_eq!(engine.estimate(), Some(estimate));

    let plain = SyncEngine::new(test_options())
        .with_source(source)
        .with_target(Arc::new(TestStorage::new()))
        .with_store(Arc::clone(&store))
        .run()
        .unwrap();
    assert!(plain.estimate.is_none());
    store.close();
}

#[test]
fn test_delete_source_after_sync() {
    let dir = tempdir().unwrap();
    let store = Arc::new(store_at(&dir, false));

    let source = Arc::new(TestStorage::new());
    source.insert_file("a", b"move me".to_vec());

    let summary = SyncEngine::new(SyncOptions {
        delete_source: true,
        ..test_options()
    })
    .with_source(source.clone())
    .with_target(Arc::new(TestStorage::new()))
    .with_store(Arc::clone(&store))
    .run()
    .unwrap();

    assert_eq!(summary.counts.objects_complete, 1);
    assert!(!source.contains("/root/a"));
    let record = store.get_record("/root/a").unwrap().unwrap();
    assert!(record.source_deleted);
    assert_eq!(record.status, Some(ObjectStatus::Transferred));
    store.close();
}

#[test]
fn test_verify_only_reports_missing_target() {
    let dir = tempdir().unwrap();
    let store = Arc::new(store_at(&dir, false));

    let source = Arc::new(TestStorage::new());
    source.insert_file("present", b"same".to_vec());
    source.insert_file("absent", b"gone".to_vec());

    let target = Arc::new(TestStorage::new());
    target.insert_file("present", b"same".to_vec());

    let summary = SyncEngine::new(SyncOptions {
        verify_only: true,
        ..test_options()
    })
    .with_source(source)
    .with_target(target.clone())
    .with_store(Arc::clone(&store))
    .run()
    .unwrap();

    assert_eq!(summary.counts.objects_complete, 1);
    assert_eq!(summary.counts.objects_failed, 1);
    assert!(!target.contains("/root/absent"));

    let absent = store.get_record("/root/absent").unwrap().unwrap();
    assert_eq!(absent.status, Some(ObjectStatus::Error));
    assert_eq!(absent.retry_count, 0);
    store.close();
}

#[test]
fn test_backpressure_bounds_queue() {
    let pool = WorkerPool::new("bp", 1, Some(2)).unwrap();
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

    pool.submit(move || {
        let _ = release_rx.recv();
    })
    .unwrap();
    while pool.active() == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    // Fill the queue
    pool.submit(|| {}).unwrap();
    pool.submit(|| {}).unwrap();
    assert_eq!(pool.queued(), 2);

    let pool = Arc::new(pool);
    let accepted = Arc::new(AtomicBool::new(false));
    let submitter = {
        let pool = Arc::clone(&pool);
        let accepted = Arc::clone(&accepted);
        thread::spawn(move || {
            pool.submit(|| {}).unwrap();
            accepted.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!accepted.load(Ordering::SeqCst));
    assert!(pool.queued() <= 2);

    release_tx.send(()).unwrap();
    submitter.join().unwrap();
    assert!(accepted.load(Ordering::SeqCst));

    pool.join();
    assert_eq!(pool.remaining(), 0);
    assert_eq!(pool.completed(), 4);
}

#[test]
fn test_completion_detection_across_pools() {
    let query = Arc::new(WorkerPool::new("q", 2, None).unwrap());
    let sync = Arc::new(WorkerPool::new("s", 3, Some(4)).unwrap());
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let sync = Arc::clone(&sync);
        let done = Arc::clone(&done);
        query
            .submit(move || {
                for _ in 0..10 {
                    let done = Arc::clone(&done);
                    sync.submit(move || {
                        thread::sleep(Duration::from_millis(1));
                        done.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                }
            })
            .unwrap();
    }

    while query.remaining() > 0 || sync.remaining() > 0 {
        thread::sleep(Duration::from_millis(5));
    }
    // Once both read zero, every child has finished
    assert_eq!(done.load(Ordering::SeqCst), 100);
    assert_eq!(query.completed(), 10);
    assert_eq!(sync.completed(), 100);

    query.join();
    sync.join();
}

#[test]
fn test_terminate_stops_run() {
    let dir = tempdir().unwrap();
    let store = Arc::new(store_at(&dir, false));

    let source = Arc::new(TestStorage::new());
    for i in 0..200 {
        source.insert_file(&format!("f{}", i), vec![0u8; 16]);
    }

    let engine = Arc::new(
        SyncEngine::new(SyncOptions {
            sync_threads: 2,
            sync_queue_capacity: Some(4),
            ..test_options()
        })
        .with_source(source)
        .with_target(Arc::new(TestStorage::new()))
        .with_filter(Arc::new(DelayFilter::new(Duration::from_millis(20))))
        .with_store(Arc::clone(&store)),
    );

    let handle = engine.terminate_handle();
    let terminator = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        handle.terminate();
    });

    let summary = engine.run().unwrap();
    terminator.join().unwrap();

    assert!(summary.terminated);
    assert!(summary.counts.objects_complete < 200);
    assert!(!engine.is_running());
    store.close();
}

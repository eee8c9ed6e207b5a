//! Backpressured worker pool
//!
//! A set of named threads pulls boxed jobs from a crossbeam channel.
//! With a capacity the channel is bounded and [`WorkerPool::submit`] blocks
//! while the queue is full; this is the only thing keeping a wide directory
//! from enqueueing its whole listing at once.
//!
//! The worker count can change while the pool runs: growing spawns new
//! workers, shrinking retires idle ones as they come back for work.
//!
//! `remaining` counts jobs submitted but not yet finished. It is incremented
//! before the job is queued and decremented only after the job (including
//! anything it submits elsewhere) returns, so a job that fans out to another
//! pool is never observed as done before its children are counted.

use crate::error::{WorkerError, WorkerResult};
use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// How often an idle worker checks whether it should retire
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// A unit of work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// State shared between the pool handle and its workers
struct PoolShared {
    name: String,
    remaining: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    active: AtomicUsize,
    /// Worker threads currently alive
    live: AtomicUsize,
    /// Workers still to retire after a shrink
    retire: AtomicUsize,
    stopped: AtomicBool,
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl PoolShared {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Claim one pending retirement, if any
    fn take_retirement(&self) -> bool {
        self.retire
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn wait_while_paused(&self) {
        let mut paused = self.paused.lock();
        while *paused && !self.is_stopped() {
            self.resumed.wait_for(&mut paused, Duration::from_millis(100));
        }
    }
}

/// RAII guard that retires one job from the remaining count
struct TaskGuard<'a> {
    shared: &'a PoolShared,
}

impl<'a> TaskGuard<'a> {
    fn new(shared: &'a PoolShared) -> Self {
        Self { shared }
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.shared.remaining.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resizable thread pool fed by an optionally bounded queue
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    /// `None` once the pool is shut down
    sender: Mutex<Option<Sender<Job>>>,
    /// Kept for draining queued jobs on a forced stop
    receiver: Receiver<Job>,
    /// Dropped on a forced stop to wake blocked submitters
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Configured worker count
    threads: AtomicUsize,
    /// Last worker id handed out
    next_id: AtomicUsize,
    capacity: Option<usize>,
}

impl WorkerPool {
    /// Start `threads` workers named `<name>-t-<n>`
    ///
    /// `capacity` bounds the queue of jobs waiting for a worker; `None`
    /// makes the queue unbounded.
    pub fn new(name: &str, threads: usize, capacity: Option<usize>) -> WorkerResult<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = match capacity {
            Some(cap) => bounded(cap.max(1)),
            None => unbounded(),
        };
        let (stop_tx, stop_rx) = bounded(0);

        let shared = Arc::new(PoolShared {
            name: name.to_string(),
            remaining: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            retire: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for id in 1..=threads {
            workers.push(spawn_worker(&shared, &receiver, id)?);
        }

        info!(pool = %name, threads, capacity = ?capacity, "Worker pool started");

        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            receiver,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            workers: Mutex::new(workers),
            threads: AtomicUsize::new(threads),
            next_id: AtomicUsize::new(threads),
            capacity,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Configured worker count; retiring workers may still be finishing
    pub fn threads(&self) -> usize {
        self.threads.load(Ordering::SeqCst)
    }

    /// Worker threads currently alive
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Submit a job, blocking while the queue is full
    ///
    /// Fails with [`WorkerError::Rejected`] after shutdown and with
    /// [`WorkerError::Stopped`] if a forced stop interrupts the wait.
    pub fn submit<F>(&self, job: F) -> WorkerResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = match self.sender.lock().as_ref() {
            Some(sender) => sender.clone(),
            None => {
                return Err(WorkerError::Rejected {
                    pool: self.shared.name.clone(),
                })
            }
        };

        self.shared.remaining.fetch_add(1, Ordering::SeqCst);
        self.shared.submitted.fetch_add(1, Ordering::SeqCst);

        let job: Job = Box::new(job);
        let result = select! {
            send(sender, job) -> res => res.map_err(|_| WorkerError::Rejected {
                pool: self.shared.name.clone(),
            }),
            recv(self.stop_rx) -> _ => Err(WorkerError::Stopped {
                pool: self.shared.name.clone(),
            }),
        };

        match result {
            // Raced a forced stop; the worker discards the job and retires it
            Ok(()) if self.shared.is_stopped() => Err(WorkerError::Stopped {
                pool: self.shared.name.clone(),
            }),
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.remaining.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Change the worker count of a running pool
    ///
    /// New workers start immediately. Surplus workers retire once their
    /// current job is done. The queue capacity is unchanged.
    pub fn resize(&self, threads: usize) -> WorkerResult<()> {
        let threads = threads.max(1);
        if self.is_shutdown() {
            return Err(WorkerError::Rejected {
                pool: self.shared.name.clone(),
            });
        }

        let mut workers = self.workers.lock();
        let current = self.threads.load(Ordering::SeqCst);
        match threads.cmp(&current) {
            CmpOrdering::Equal => return Ok(()),
            CmpOrdering::Less => {
                self.shared.retire.fetch_add(current - threads, Ordering::SeqCst);
            }
            CmpOrdering::Greater => {
                let mut running = current;
                // Workers not yet retired can simply stay
                while running < threads && self.shared.take_retirement() {
                    running += 1;
                }
                while running < threads {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                    match spawn_worker(&self.shared, &self.receiver, id) {
                        Ok(handle) => workers.push(handle),
                        Err(e) => {
                            self.threads.store(running, Ordering::SeqCst);
                            return Err(e);
                        }
                    }
                    running += 1;
                }
            }
        }

        self.threads.store(threads, Ordering::SeqCst);
        info!(pool = %self.shared.name, from = current, to = threads, "Worker pool resized");
        Ok(())
    }

    /// Jobs submitted and not yet finished
    pub fn remaining(&self) -> u64 {
        self.shared.remaining.load(Ordering::SeqCst)
    }

    /// Total accepted submissions, monotonic
    pub fn submitted(&self) -> u64 {
        self.shared.submitted.load(Ordering::SeqCst)
    }

    /// Jobs that ran to completion
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    /// Jobs that panicked
    pub fn panicked(&self) -> u64 {
        self.shared.panicked.load(Ordering::SeqCst)
    }

    /// Workers currently running a job
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Hold queued jobs until [`WorkerPool::resume`]; running jobs finish
    pub fn pause(&self) {
        *self.shared.paused.lock() = true;
        debug!(pool = %self.shared.name, "Worker pool paused");
    }

    pub fn resume(&self) {
        *self.shared.paused.lock() = false;
        self.shared.resumed.notify_all();
        debug!(pool = %self.shared.name, "Worker pool resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.lock()
    }

    /// Graceful shutdown: reject new jobs, let queued and running ones
    /// finish. Idempotent.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            debug!(pool = %self.shared.name, remaining = self.remaining(), "Worker pool shutting down");
        }
    }

    /// Forced stop: reject new jobs, discard queued ones and release blocked
    /// submitters. Running jobs are not interrupted; they are expected to
    /// check their own cancellation flag. Returns the number of jobs
    /// discarded. Idempotent.
    pub fn stop(&self) -> usize {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.sender.lock().take();
        self.stop_tx.lock().take();
        self.shared.resumed.notify_all();

        let mut discarded = 0;
        while let Ok(job) = self.receiver.try_recv() {
            drop(job);
            self.shared.remaining.fetch_sub(1, Ordering::SeqCst);
            discarded += 1;
        }

        info!(pool = %self.shared.name, discarded, "Worker pool stopped");
        discarded
    }

    /// Shut down (if not already) and wait for every worker to exit
    pub fn join(&self) {
        self.shutdown();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                warn!(pool = %self.shared.name, "Worker thread failed to join cleanly");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit once every sender is gone; do not wait for them here
        self.shutdown();
    }
}

fn spawn_worker(
    shared: &Arc<PoolShared>,
    receiver: &Receiver<Job>,
    id: usize,
) -> WorkerResult<JoinHandle<()>> {
    let worker_shared = Arc::clone(shared);
    let receiver = receiver.clone();
    shared.live.fetch_add(1, Ordering::SeqCst);

    thread::Builder::new()
        .name(format!("{}-t-{}", shared.name, id))
        .spawn(move || worker_loop(worker_shared, receiver))
        .map_err(|e| {
            shared.live.fetch_sub(1, Ordering::SeqCst);
            WorkerError::InitFailed {
                pool: shared.name.clone(),
                id,
                reason: e.to_string(),
            }
        })
}

/// Main worker loop
fn worker_loop(shared: Arc<PoolShared>, receiver: Receiver<Job>) {
    trace!(pool = %shared.name, "Worker starting");

    loop {
        if shared.take_retirement() {
            debug!(pool = %shared.name, "Worker retired");
            break;
        }

        let job = match receiver.recv_timeout(IDLE_CHECK_INTERVAL) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let _guard = TaskGuard::new(&shared);

        shared.wait_while_paused();
        if shared.is_stopped() {
            continue;
        }

        shared.active.fetch_add(1, Ordering::SeqCst);
        let outcome = panic::catch_unwind(AssertUnwindSafe(job));
        shared.active.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                shared.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                shared.panicked.fetch_add(1, Ordering::Relaxed);
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(pool = %shared.name, message = %message, "Task panicked");
            }
        }
    }

    shared.live.fetch_sub(1, Ordering::SeqCst);
    trace!(pool = %shared.name, "Worker exiting");
}

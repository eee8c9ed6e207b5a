//! Per-object sync tasks and per-directory query tasks
//!
//! A sync task moves one object through transfer, verification and source
//! deletion, writing each status change to the store. A query task lists
//! a directory's children and submits each of them for sync.
//!
//! Failures never escape a task: they are retried through the retry pool
//! while budget remains, and otherwise recorded as `Error`. The retry budget
//! spans runs: a resumed object starts from its stored `retry_count`, and an
//! object left in `Error` stays there unless the run forces a sync.

use crate::config::SyncOptions;
use crate::db::{StatusStore, SyncRecord};
use crate::engine::pool::WorkerPool;
use crate::engine::stats::SyncStats;
use crate::engine::throttle::Throttle;
use crate::error::{ObjectError, ObjectResult, WorkerError};
use crate::object::{ObjectContext, ObjectStatus, ObjectSummary};
use crate::plugin::{FilterChain, SyncStorage, Verifier};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Everything a running task needs, shared by all worker threads
pub(crate) struct EngineShared {
    pub options: SyncOptions,
    pub source: Arc<dyn SyncStorage>,
    pub chain: FilterChain,
    pub verifier: Arc<dyn Verifier>,
    pub store: Arc<StatusStore>,
    pub stats: Arc<SyncStats>,
    pub running: Arc<AtomicBool>,
    pub query_pool: Arc<WorkerPool>,
    pub sync_pool: Arc<WorkerPool>,
    pub retry_pool: Arc<WorkerPool>,
    /// Objects between a failed attempt and the start of the next one
    pub awaiting_retry: Arc<AtomicU64>,
    /// Objects per second submitted for sync
    pub throughput: Option<Throttle>,
    /// Bytes per second transferred
    pub bandwidth: Option<Throttle>,
}

impl EngineShared {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Counts one object as awaiting retry for as long as it lives
struct RetryTicket {
    awaiting: Arc<AtomicU64>,
}

impl RetryTicket {
    fn issue(awaiting: &Arc<AtomicU64>) -> Self {
        awaiting.fetch_add(1, Ordering::SeqCst);
        Self {
            awaiting: Arc::clone(awaiting),
        }
    }
}

impl Drop for RetryTicket {
    fn drop(&mut self) {
        self.awaiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Queue a fresh object for sync
pub(crate) fn submit_summary(shared: &Arc<EngineShared>, summary: ObjectSummary) {
    submit_for_sync(shared, ObjectContext::new(summary), None);
}

/// Queue a context on the sync pool; blocks while the pool is full or the
/// throughput throttle is holding submissions back
fn submit_for_sync(
    shared: &Arc<EngineShared>,
    ctx: ObjectContext,
    retry_ticket: Option<RetryTicket>,
) {
    if !shared.is_running() {
        debug!(source_id = %ctx.source_id(), "Not submitting for sync; engine terminated");
        return;
    }
    if let Some(throttle) = &shared.throughput {
        if !throttle.acquire_while(1, || shared.is_running()) {
            debug!(source_id = %ctx.source_id(), "Throttled submission abandoned; engine terminated");
            return;
        }
    }

    let task = SyncTask {
        shared: Arc::clone(shared),
        ctx,
        retry_ticket,
    };
    let source_id = task.ctx.source_id().to_string();
    if let Err(e) = shared.sync_pool.submit(move || task.run()) {
        log_rejected(&source_id, &e);
    }
}

/// Queue a directory for listing
pub(crate) fn submit_for_query(shared: &Arc<EngineShared>, parent: ObjectSummary) {
    if !shared.is_running() {
        debug!(source_id = %parent.identifier, "Not submitting for query; engine terminated");
        return;
    }

    let source_id = parent.identifier.clone();
    let task = QueryTask {
        shared: Arc::clone(shared),
        parent,
    };
    if let Err(e) = shared.query_pool.submit(move || task.run()) {
        log_rejected(&source_id, &e);
    }
}

fn log_rejected(source_id: &str, e: &WorkerError) {
    // Only happens once the pools are being torn down
    debug!(source_id, error = %e, "Task not accepted");
}

/// Set `ctx.status`, logging moves the lifecycle does not allow
///
/// Returns false for such a move; the status is set either way so the
/// store always reflects what the task is doing.
fn advance(ctx: &mut ObjectContext, next: ObjectStatus) -> bool {
    let allowed = ctx.status.map_or(true, |current| current.can_transition_to(next));
    if !allowed {
        warn!(
            source_id = %ctx.source_id(),
            from = ?ctx.status,
            to = %next,
            "Unexpected status transition"
        );
    }
    ctx.status = Some(next);
    allowed
}

/// Retry `ctx` if budget remains, otherwise hand the error back
fn submit_for_retry(shared: &Arc<EngineShared>, mut ctx: ObjectContext, err: ObjectError) -> ObjectResult<()> {
    if ctx.object.is_none() || ctx.failures() + 1 > shared.options.retry_attempts {
        return Err(err);
    }
    let failures = ctx.inc_failures();

    info!(
        source_id = %ctx.source_id(),
        failures,
        error = %err,
        "Object failed; queuing for retry"
    );
    advance(&mut ctx, ObjectStatus::RetryQueue);
    shared.store.set_status(&ctx, Some(&err.to_string()), false)?;

    let source_id = ctx.source_id().to_string();
    let ticket = RetryTicket::issue(&shared.awaiting_retry);
    let retry = Arc::clone(shared);
    if let Err(e) = shared
        .retry_pool
        .submit(move || submit_for_sync(&retry, ctx, Some(ticket)))
    {
        log_rejected(&source_id, &e);
    }
    Ok(())
}

/// What a sync attempt ended with
enum Outcome {
    /// All phases ran (or were skipped as up to date)
    Done { copy_skipped: bool, verify_skipped: bool },
    /// Handed to the retry pool
    Retrying,
    /// Left in `Error` by an earlier run
    PreviouslyFailed,
    /// Engine terminated mid-task
    Aborted,
}

/// Sync of one object
pub(crate) struct SyncTask {
    shared: Arc<EngineShared>,
    ctx: ObjectContext,
    /// Held from the retry queue until this attempt starts
    retry_ticket: Option<RetryTicket>,
}

impl SyncTask {
    pub fn run(mut self) {
        self.retry_ticket.take();
        if !self.shared.is_running() {
            debug!(source_id = %self.ctx.source_id(), "Aborting sync task; engine terminated");
            return;
        }

        let mut record_exists = false;
        let result = self.sync(&mut record_exists);
        let shared = Arc::clone(&self.shared);

        match result {
            Ok(Outcome::Retrying) | Ok(Outcome::Aborted) => {}
            Ok(Outcome::PreviouslyFailed) => {
                shared.stats.record_done(self.ctx.summary.size, false, true);
            }
            Ok(Outcome::Done {
                copy_skipped,
                verify_skipped,
            }) => {
                self.record_done(copy_skipped, verify_skipped);

                if shared.options.recursive && self.ctx.summary.directory {
                    debug!(source_id = %self.ctx.source_id(), "Directory synced; submitting for query");
                    submit_for_query(&shared, self.ctx.summary.clone());
                }
            }
            Err(e) => self.record_failure(e, record_exists),
        }
    }

    fn sync(&mut self, record_exists: &mut bool) -> ObjectResult<Outcome> {
        let shared = Arc::clone(&self.shared);
        let options = &shared.options;
        let source_id = self.ctx.source_id().to_string();

        // Held until the first status write for this identifier
        let mut first_write = Some(shared.store.lock(&source_id));

        let record = shared.store.get_record(&source_id)?;
        *record_exists = record.is_some();
        if let Some(r) = &record {
            if r.status == Some(ObjectStatus::Error) && !options.force_sync {
                info!(
                    source_id = %source_id,
                    retry_count = r.retry_count,
                    "Object failed in an earlier run; skipping (use --force-sync to retry)"
                );
                return Ok(Outcome::PreviouslyFailed);
            }
            self.resume_from(r);
        }

        let object = shared.source.load_object(&source_id)?;
        self.ctx.object = Some(object.clone());
        if self.ctx.target_id.is_none() {
            self.ctx.target_id = record.as_ref().and_then(|r| r.target_id.clone());
        }

        let source_newer = match (&record, self.ctx.source_mtime()) {
            (Some(r), Some(source_mtime)) => match r.mtime {
                Some(recorded) => source_mtime.timestamp_millis() > recorded.timestamp_millis(),
                None => true,
            },
            _ => false,
        };
        let stale = record.is_none() || options.force_sync || source_newer;

        let mut copy_skipped = false;
        if !options.verify_only {
            let needs_copy = stale || !record.as_ref().is_some_and(|r| r.is_success());
            if needs_copy {
                if let Some(throttle) = &shared.bandwidth {
                    if !object.is_directory()
                        && !throttle.acquire_while(self.ctx.summary.size, || shared.is_running())
                    {
                        debug!(source_id = %source_id, "Abandoning throttled transfer; engine terminated");
                        return Ok(Outcome::Aborted);
                    }
                }
                self.write_status(ObjectStatus::InTransfer, record_exists)?;
                first_write.take();

                match shared.chain.transfer(&mut self.ctx, object.clone()) {
                    Ok(()) => {
                        self.write_status(ObjectStatus::Transferred, record_exists)?;
                    }
                    Err(e) if e.is_skip() => {
                        debug!(source_id = %source_id, reason = %e, "Transfer skipped by filter");
                        copy_skipped = true;
                    }
                    Err(e) if e.is_recoverable() => {
                        submit_for_retry(&shared, self.ctx.clone(), e)?;
                        return Ok(Outcome::Retrying);
                    }
                    Err(e) => return Err(e),
                }
            } else {
                info!(source_id = %source_id, "Target is up to date; skipping copy");
                copy_skipped = true;
            }
        }

        let mut verify_skipped = false;
        if options.verify || options.verify_only {
            let verified = record
                .as_ref()
                .is_some_and(|r| r.status == Some(ObjectStatus::Verified));
            if stale || !verified {
                self.write_status(ObjectStatus::InVerification, record_exists)?;
                first_write.take();

                let checked = shared
                    .chain
                    .read_back(&mut self.ctx)
                    .and_then(|target| shared.verifier.verify(&object, &target));

                match checked {
                    Ok(()) => self.write_status(ObjectStatus::Verified, record_exists)?,
                    Err(e) if e.is_recoverable() && !options.verify_only => {
                        submit_for_retry(&shared, self.ctx.clone(), e)?;
                        return Ok(Outcome::Retrying);
                    }
                    Err(e) => {
                        return Err(ObjectError::NonRetriable {
                            identifier: source_id,
                            reason: e.to_string(),
                        })
                    }
                }
            } else {
                debug!(source_id = %source_id, "Already verified; skipping verification");
                verify_skipped = true;
            }
        }
        drop(first_write);

        if options.delete_source {
            match shared.source.delete(&source_id) {
                Ok(()) => {
                    info!(source_id = %source_id, "Deleted from source");
                    if let Err(e) = shared.store.set_deleted(&self.ctx, !*record_exists) {
                        warn!(source_id = %source_id, error = %e, "Could not record source deletion");
                    } else {
                        *record_exists = true;
                    }
                }
                Err(e) => {
                    warn!(source_id = %source_id, error = %e, "Could not delete from source");
                }
            }
        }

        Ok(Outcome::Done {
            copy_skipped,
            verify_skipped,
        })
    }

    /// Pick up where the stored record left off
    ///
    /// Only a context fresh from the source is touched; one coming back from
    /// the retry pool already carries its count. A forced sync of an `Error`
    /// record starts over with the whole budget.
    fn resume_from(&mut self, record: &SyncRecord) {
        if self.ctx.status != Some(ObjectStatus::Queue) || self.ctx.failures() > 0 {
            return;
        }
        match record.status {
            Some(ObjectStatus::Error) | None => {}
            Some(status) => {
                self.ctx.status = Some(status);
                if !status.is_success() {
                    self.ctx.set_failures(record.retry_count);
                }
            }
        }
    }

    /// Persist a new status; the first write inserts the row
    fn write_status(&mut self, status: ObjectStatus, record_exists: &mut bool) -> ObjectResult<()> {
        let previous = self.ctx.status;
        advance(&mut self.ctx, status);
        if let Err(e) = self.shared.store.set_status(&self.ctx, None, !*record_exists) {
            self.ctx.status = previous;
            return Err(e.into());
        }
        *record_exists = true;
        Ok(())
    }

    fn record_done(&self, copy_skipped: bool, verify_skipped: bool) {
        let options = &self.shared.options;

        let verifying = options.verify || options.verify_only;
        let skipped = (verify_skipped && copy_skipped)
            || (verify_skipped && options.verify_only)
            || (copy_skipped && !verifying);
        self.shared
            .stats
            .record_done(self.ctx.summary.size, copy_skipped, skipped);
    }

    fn record_failure(&mut self, err: ObjectError, record_exists: bool) {
        let source_id = self.ctx.source_id().to_string();
        let message = err.to_string();

        advance(&mut self.ctx, ObjectStatus::Error);
        if let Err(e) = self.shared.store.set_status(&self.ctx, Some(&message), !record_exists) {
            error!(source_id = %source_id, error = %e, "Failed to record error status");
        }

        warn!(source_id = %source_id, error = %message, "Object failed");
        self.shared.stats.add_failed(&source_id, message);
    }
}

/// Listing of one directory's children
pub(crate) struct QueryTask {
    shared: Arc<EngineShared>,
    parent: ObjectSummary,
}

impl QueryTask {
    pub fn run(self) {
        if !self.shared.is_running() {
            debug!(source_id = %self.parent.identifier, "Aborting query task; engine terminated");
            return;
        }
        if !self.parent.directory {
            return;
        }

        debug!(source_id = %self.parent.identifier, "Querying children");
        match self.shared.source.children(&self.parent) {
            Ok(children) => {
                let count = children.len();
                for child in children {
                    submit_summary(&self.shared, child);
                }
                debug!(source_id = %self.parent.identifier, count, "Finished querying children");
            }
            Err(e) => {
                warn!(source_id = %self.parent.identifier, error = %e, "Querying children failed");
                self.shared
                    .stats
                    .add_failed(&self.parent.identifier, e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_flags_illegal_moves() {
        let mut ctx = ObjectContext::new(ObjectSummary::file("/root/a", 1));
        assert!(advance(&mut ctx, ObjectStatus::InTransfer));
        assert!(advance(&mut ctx, ObjectStatus::Transferred));
        assert!(advance(&mut ctx, ObjectStatus::InVerification));
        assert!(advance(&mut ctx, ObjectStatus::Verified));

        let mut failed =
            ObjectContext::new(ObjectSummary::file("/root/b", 1)).with_status(ObjectStatus::Error);
        assert!(!advance(&mut failed, ObjectStatus::InTransfer));
        // Still applied so the store sees the real status
        assert_eq!(failed.status, Some(ObjectStatus::InTransfer));
    }

    #[test]
    fn test_retry_ticket_counts_while_alive() {
        let awaiting = Arc::new(AtomicU64::new(0));
        let first = RetryTicket::issue(&awaiting);
        let second = RetryTicket::issue(&awaiting);
        assert_eq!(awaiting.load(Ordering::SeqCst), 2);

        drop(first);
        assert_eq!(awaiting.load(Ordering::SeqCst), 1);
        drop(second);
        assert_eq!(awaiting.load(Ordering::SeqCst), 0);
    }
}

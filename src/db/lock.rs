//! Per-identifier mutual exclusion
//!
//! A single mutex guards the set of held identifiers; releases broadcast on
//! one condition variable and waiters re-check their own key.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

/// Set of currently locked identifiers
#[derive(Debug, Default)]
pub struct IdLock {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl IdLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `id` is free, then hold it until the guard drops
    pub fn lock(&self, id: &str) -> IdLockGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(id) {
            self.released.wait(&mut held);
        }
        held.insert(id.to_string());

        IdLockGuard {
            lock: self,
            id: Some(id.to_string()),
        }
    }

    fn release(&self, id: &str) {
        let mut held = self.held.lock();
        held.remove(id);
        drop(held);
        self.released.notify_all();
    }
}

/// Holds one identifier; releases it on drop or [`IdLockGuard::unlock`]
#[derive(Debug)]
pub struct IdLockGuard<'a> {
    lock: &'a IdLock,
    id: Option<String>,
}

impl IdLockGuard<'_> {
    /// Release explicitly
    pub fn unlock(mut self) {
        if let Some(id) = self.id.take() {
            self.lock.release(&id);
        }
    }
}

impl Drop for IdLockGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.lock.release(&id);
        }
    }
}

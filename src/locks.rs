//! Per-handle mutual exclusion for volume mutations

use log::trace;
use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

/// Grants exclusive leases on volume handles
pub trait LockManager: Send + Sync {
    /// Block until `handle` is exclusively held by the caller
    fn lock(&self, handle: &str);

    /// Release a lease taken with [`LockManager::lock`]
    fn unlock(&self, handle: &str);
}

/// Hold the lease on `handle` until the guard is dropped
pub fn lock_handle<'a>(locks: &'a dyn LockManager, handle: &str) -> HandleGuard<'a> {
    locks.lock(handle);
    HandleGuard {
        locks,
        handle: handle.to_string(),
    }
}

/// Releases its handle's lease on drop
pub struct HandleGuard<'a> {
    locks: &'a dyn LockManager,
    handle: String,
}

impl HandleGuard<'_> {
    pub fn handle(&self) -> &str {
        &self.handle
    }
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        self.locks.unlock(&self.handle);
    }
}

/// Real per-handle locking: a held set guarded by one mutex, with waiters
/// parked on a condition variable and woken on every release.
#[derive(Default)]
pub struct HandleLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl HandleLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether some caller currently holds `handle`
    pub fn is_locked(&self, handle: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .contains(handle)
    }
}

impl LockManager for HandleLocks {
    fn lock(&self, handle: &str) {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        while held.contains(handle) {
            trace!("waiting for lock on {}", handle);
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|poison| poison.into_inner());
        }
        held.insert(handle.to_string());
    }

    fn unlock(&self, handle: &str) {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        held.remove(handle);
        // Waiters on other handles share the condvar, so wake everyone.
        self.released.notify_all();
    }
}

/// Grants every lease immediately. Only for tests and single-threaded tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLockManager;

impl LockManager for NoopLockManager {
    fn lock(&self, _handle: &str) {}

    fn unlock(&self, _handle: &str) {}
}

//! In-process named lock table

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::StorageError;

#[derive(Debug, Default)]
struct Inner {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl Inner {
    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        // A panicking holder still releases through Drop; keep the set usable.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Set of currently held lock names shared by every clone
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    inner: Arc<Inner>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `name` is free, then hold it until the guard drops
    pub fn acquire(&self, name: &str, timeout: Duration) -> Result<LockTableGuard, StorageError> {
        let deadline = Instant::now() + timeout;
        let mut held = self.inner.held();
        while held.contains(name) {
            let now = Instant::now();
            if now >= deadline {
                return Err(StorageError::LockConflict(format!(
                    "timed out after {:?} waiting for lock {}",
                    timeout, name
                )));
            }
            held = self
                .inner
                .released
                .wait_timeout(held, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        held.insert(name.to_string());
        Ok(LockTableGuard {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
        })
    }

    /// Whether `name` is currently held
    pub fn is_held(&self, name: &str) -> bool {
        self.inner.held().contains(name)
    }
}

/// Releases its lock name on drop
#[derive(Debug)]
pub struct LockTableGuard {
    inner: Arc<Inner>,
    name: String,
}

impl Drop for LockTableGuard {
    fn drop(&mut self) {
        self.inner.held().remove(&self.name);
        self.inner.released.notify_all();
    }
}

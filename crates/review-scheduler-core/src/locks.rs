use std::collections::HashSet;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::{PairKey, StoreError};

/// Per-pair exclusion for read-modify-write sequences.
///
/// Only callers on the same [`PairKey`] wait on each other; the set of busy
/// keys is held under one short-lived mutex.
#[derive(Debug, Default)]
pub struct KeyLocks {
    busy: Mutex<HashSet<PairKey>>,
    released: Condvar,
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: PairKey,
}

impl KeyLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `key` is free or `timeout` elapses.
    ///
    /// # Errors
    /// Returns [`StoreError::Timeout`] when the key stays busy past
    /// `timeout`, and [`StoreError::Unavailable`] if the lock table is poisoned.
    pub fn acquire(&self, key: PairKey, timeout: Duration) -> Result<KeyGuard<'_>, StoreError> {
        let deadline = Instant::now() + timeout;
        let mut busy = self
            .busy
            .lock()
            .map_err(|_| StoreError::Unavailable("key lock table poisoned".to_string()))?;

        while busy.contains(&key) {
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::Timeout(format!(
                    "waited {} ms for in-flight review of {key}",
                    timeout.as_millis()
                )));
            }

            let (guard, _) = self
                .released
                .wait_timeout(busy, deadline - now)
                .map_err(|_| StoreError::Unavailable("key lock table poisoned".to_string()))?;
            busy = guard;
        }

        busy.insert(key);
        Ok(KeyGuard { locks: self, key })
    }

    #[must_use]
    pub fn held(&self) -> usize {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl KeyGuard<'_> {
    #[must_use]
    pub fn key(&self) -> PairKey {
        self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        self.locks.released.notify_all();
    }
}

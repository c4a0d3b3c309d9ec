//! Per-key critical sections.

use crate::types::EntryKey;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutex per key, created on demand and dropped when unused.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<EntryKey, Arc<Mutex<()>>>,
}

/// Held critical section of one key.
pub struct KeyGuard<'a> {
    owner: &'a KeyLocks,
    key: EntryKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the critical section of `key`.
    pub async fn lock(&self, key: &EntryKey) -> KeyGuard<'_> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            owner: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys with a live mutex.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key has a live mutex.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table still references the mutex: nobody holds or awaits it.
        self.owner
            .locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

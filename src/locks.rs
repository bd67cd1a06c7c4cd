//! Per-resource mutual exclusion
//!
//! At most one fetch/merge/write cycle runs per routing resource inside
//! this process. Waiters are served in FIFO order, so operations on one
//! resource commit in the order they queued for its lock.

use crate::codec::ResourceKey;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Held while a resource is being reconciled; releases on drop
pub struct ResourceGuard {
    key: ResourceKey,
    _guard: OwnedMutexGuard<()>,
}

impl ResourceGuard {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        trace!(resource = %self.key, "Resource lock released");
    }
}

/// Lazily created lock per resource key
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<ResourceKey, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    ///
    /// Dropping the returned future before it completes gives up the place
    /// in the queue without ever holding the lock.
    pub async fn acquire(&self, key: &ResourceKey) -> ResourceGuard {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let guard = lock.lock_owned().await;
        trace!(resource = %key, "Resource lock acquired");
        ResourceGuard {
            key: key.clone(),
            _guard: guard,
        }
    }

    /// True while some operation holds the lock for `key`
    pub fn is_locked(&self, key: &ResourceKey) -> bool {
        self.locks
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Forget locks nobody holds or waits for
    pub fn prune(&self) {
        // the map's own reference is the only one left for idle locks
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

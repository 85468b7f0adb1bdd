//! Per-source lock registry
//!
//! One `tokio::sync::Mutex<()>` per source id, created on first use. Passes
//! take the lock with `try_lock_owned` and fail fast when it is held;
//! source removal waits for it.

use std::sync::Arc;

use calsync_core::domain::SourceId;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held for the duration of a pass; dropping it releases the source
pub type SourceGuard = OwnedMutexGuard<()>;

/// Lock registry keyed by source id
#[derive(Default)]
pub struct SourceLocks {
    locks: DashMap<SourceId, Arc<Mutex<()>>>,
}

impl SourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, source_id: &SourceId) -> Arc<Mutex<()>> {
        // Clone out so the shard lock is not held across an await
        self.locks
            .entry(source_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Takes the lock if it is free; `None` means a pass is in flight
    pub fn try_acquire(&self, source_id: &SourceId) -> Option<SourceGuard> {
        self.lock_for(source_id).try_lock_owned().ok()
    }

    /// Waits for the lock
    pub async fn acquire(&self, source_id: &SourceId) -> SourceGuard {
        self.lock_for(source_id).lock_owned().await
    }

    /// Returns true if a pass currently holds the lock
    pub fn is_held(&self, source_id: &SourceId) -> bool {
        self.locks
            .get(source_id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Drops the registry entry of a removed source
    ///
    /// Call while holding the source's guard.
    pub fn forget(&self, source_id: &SourceId) {
        self.locks.remove(source_id);
    }
}

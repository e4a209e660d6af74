//! In-process keyed locks.
//!
//! Two flavors, both org-scoped by convention of the key format:
//!
//! - `entity:<org>:<id>` -- awaited locks serializing correctness-critical
//!   entity updates (task transitions, worker promotion).
//! - `spawn:task:<task_id>` -- non-blocking locks for spawn contention;
//!   losers reject rather than queue.
//!
//! Guards release their key on drop. The manager prunes entries whose
//! semaphore is no longer held so the map does not grow without bound.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// Keyed async lock manager.
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    locks: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

/// A held lock. Dropping it releases the key.
#[derive(Debug)]
pub struct LockGuard {
    _permit: OwnedSemaphorePermit,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn semaphore_for(&self, key: &str) -> Arc<Semaphore> {
        let mut locks = self.locks.lock().await;
        // Opportunistic prune: drop fully-released entries.
        locks.retain(|_, sem| sem.available_permits() == 0 || Arc::strong_count(sem) > 1);
        Arc::clone(
            locks
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }

    /// Acquire the lock for `key`, waiting until it is free.
    pub async fn lock(&self, key: &str) -> LockGuard {
        let sem = self.semaphore_for(key).await;
        let permit = sem
            .acquire_owned()
            .await
            .expect("lock semaphore never closed");
        LockGuard { _permit: permit }
    }

    /// Try to acquire the lock for `key` without waiting.
    ///
    /// Returns `None` when another holder has it -- the caller is expected
    /// to reject its operation, not retry.
    pub async fn try_lock(&self, key: &str) -> Option<LockGuard> {
        let sem = self.semaphore_for(key).await;
        sem.try_acquire_owned()
            .ok()
            .map(|permit| LockGuard { _permit: permit })
    }
}

/// Key for the per-entity update lock.
pub fn entity_key(org_id: &str, entity_id: &str) -> String {
    format!("entity:{org_id}:{entity_id}")
}

/// Key for the per-task spawn lock.
pub fn spawn_key(task_id: &str) -> String {
    format!("spawn:task:{task_id}")
}

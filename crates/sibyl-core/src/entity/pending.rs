//! Pending-state tracking for the asynchronous creation pipeline.
//!
//! `create_async` registers an id here before the creation job runs.
//! Until the job completes, callers may stash operations against the id;
//! the job drains them after the node lands. An entity is "created" when
//! its id leaves the pending set, signalled through a watch channel.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Map, Value};
use tokio::sync::watch;

/// State of a pending async creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
    Pending,
    Completed,
    Failed(String),
}

/// An operation stashed against a pending id.
#[derive(Debug, Clone)]
pub enum QueuedOp {
    /// Merge these keys into the entity once it exists.
    Update(Map<String, Value>),
    /// Create an edge from the entity once it exists.
    Link {
        target_id: String,
        edge_type: String,
    },
}

struct PendingEntry {
    tx: watch::Sender<PendingState>,
    queued_ops: Vec<QueuedOp>,
}

/// Registry of in-flight async creations.
#[derive(Default)]
pub struct PendingRegistry {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an id as pending. Returns a receiver that resolves when
    /// the creation completes or fails.
    pub fn register(&self, id: &str) -> watch::Receiver<PendingState> {
        let mut entries = self.entries.lock().expect("pending lock poisoned");
        let (tx, rx) = watch::channel(PendingState::Pending);
        entries.insert(
            id.to_owned(),
            PendingEntry {
                tx,
                queued_ops: Vec::new(),
            },
        );
        rx
    }

    /// Whether an id is still pending.
    pub fn is_pending(&self, id: &str) -> bool {
        let entries = self.entries.lock().expect("pending lock poisoned");
        entries.contains_key(id)
    }

    /// Stash an operation against a pending id. Returns `false` when the
    /// id is not pending (the caller should apply the op directly).
    pub fn queue_op(&self, id: &str, op: QueuedOp) -> bool {
        let mut entries = self.entries.lock().expect("pending lock poisoned");
        match entries.get_mut(id) {
            Some(entry) => {
                entry.queued_ops.push(op);
                true
            }
            None => false,
        }
    }

    /// Take the stashed ops for an id, leaving it registered.
    pub fn take_ops(&self, id: &str) -> Vec<QueuedOp> {
        let mut entries = self.entries.lock().expect("pending lock poisoned");
        entries
            .get_mut(id)
            .map(|entry| std::mem::take(&mut entry.queued_ops))
            .unwrap_or_default()
    }

    /// Mark a creation complete: the id leaves the pending set and waiters
    /// wake.
    pub fn complete(&self, id: &str) {
        let mut entries = self.entries.lock().expect("pending lock poisoned");
        if let Some(entry) = entries.remove(id) {
            let _ = entry.tx.send(PendingState::Completed);
        }
    }

    /// Mark a creation failed. The id leaves the pending set; waiters see
    /// the error. Failed entries are not retried.
    pub fn fail(&self, id: &str, error: impl Into<String>) {
        let mut entries = self.entries.lock().expect("pending lock poisoned");
        if let Some(entry) = entries.remove(id) {
            let _ = entry.tx.send(PendingState::Failed(error.into()));
        }
    }
}

/// Await a pending receiver until it leaves `Pending`.
pub async fn wait_settled(mut rx: watch::Receiver<PendingState>) -> PendingState {
    loop {
        let state = rx.borrow().clone();
        if state != PendingState::Pending {
            return state;
        }
        if rx.changed().await.is_err() {
            // Sender dropped without settling; report the current value.
            return rx.borrow().clone();
        }
    }
}

//! Error taxonomy for the orchestration engine.
//!
//! Service internals use `anyhow::Result` with context, like the rest of
//! the workspace. `SibylError` exists for the cases callers dispatch on:
//! missing entities, lock contention, budget exhaustion, approval
//! timeouts. Everything else flows through as an opaque `Other`.

use thiserror::Error;

/// Errors the engine's callers are expected to dispatch on.
#[derive(Debug, Error)]
pub enum SibylError {
    /// A referenced entity does not exist in the caller's organization.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Lock contention or a state conflict: spawn race, duplicate task
    /// assignment, resume of a non-paused orchestrator.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A transient store failure that was retried and still failed.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Budget or capacity exhaustion.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An approval wait hit its deadline.
    #[error("approval {0} timed out")]
    ApprovalTimeout(String),

    /// Validation failure or missing required dependency; never retried.
    #[error("{0}")]
    Permanent(String),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SibylError {
    /// Shorthand for a not-found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_kind_and_id() {
        let err = SibylError::not_found("task", "task_123");
        assert_eq!(err.to_string(), "task not found: task_123");
    }

    #[test]
    fn anyhow_converts_to_other() {
        let err: SibylError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, SibylError::Other(_)));
    }
}

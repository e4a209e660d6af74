//! Best-effort LLM decoration.
//!
//! Tag derivation and status hints are decorative: they run off the
//! critical path and their failures never propagate. The provider trait
//! exists so deployments can plug a real model in; the default is a no-op
//! that triggers every caller's fallback path.

use anyhow::Result;
use async_trait::async_trait;

/// Provider of short decorative strings derived from agent activity.
#[async_trait]
pub trait HintProvider: Send + Sync {
    /// Derive up to `limit` short tags for an agent from its name and task
    /// context. Implementations should return lowercase single words.
    async fn derive_tags(&self, name: &str, task_context: &str, limit: usize)
    -> Result<Vec<String>>;

    /// Produce a one-line status hint for recent agent output.
    async fn status_hint(&self, recent_output: &str) -> Result<String>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn HintProvider) {}
};

/// A provider that always fails, forcing callers onto their fallbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHintProvider;

#[async_trait]
impl HintProvider for NoopHintProvider {
    async fn derive_tags(
        &self,
        _name: &str,
        _task_context: &str,
        _limit: usize,
    ) -> Result<Vec<String>> {
        anyhow::bail!("no hint provider configured")
    }

    async fn status_hint(&self, _recent_output: &str) -> Result<String> {
        anyhow::bail!("no hint provider configured")
    }
}

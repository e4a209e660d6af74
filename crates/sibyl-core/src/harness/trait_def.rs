//! The `AgentHarness` trait -- the adapter interface for agent runtimes.
//!
//! Each concrete harness (Claude Code today; other agent CLIs tomorrow)
//! implements this trait. The trait is intentionally object-safe so it can
//! be stored as `Arc<dyn AgentHarness>` in the [`super::HarnessRegistry`].

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;

use super::types::{AgentHandle, AgentMessage, SpawnOptions};

/// Adapter interface for spawning and managing LLM coding agents.
///
/// Implementors wrap a specific agent CLI and translate its I/O into the
/// common [`AgentMessage`] stream. Resume is expressed through
/// [`SpawnOptions::session_id`]: a harness given a session id re-enters
/// that session rather than starting a new one.
#[async_trait]
pub trait AgentHarness: Send + Sync {
    /// Human-readable name for this harness (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Spawn an agent process for the given options.
    ///
    /// The harness should:
    /// 1. Build the subprocess command with appropriate flags.
    /// 2. Set `options.working_dir` as the current directory.
    /// 3. Inject `options.env_vars` into the process environment.
    /// 4. Deliver `options.prompt` on stdin.
    /// 5. Return an [`AgentHandle`] with the process id.
    async fn spawn(&self, options: &SpawnOptions) -> Result<AgentHandle>;

    /// Return the ordered message stream from a running agent.
    ///
    /// The stream yields messages until the agent exits, terminating with
    /// an [`AgentMessage::Result`] (synthesized on abnormal exit).
    fn messages(&self, handle: &AgentHandle)
    -> Pin<Box<dyn Stream<Item = AgentMessage> + Send>>;

    /// Terminate the agent process.
    ///
    /// Implementations send SIGTERM first, wait briefly, then SIGKILL if
    /// the process has not exited.
    async fn kill(&self, handle: &AgentHandle) -> Result<()>;

    /// Check whether the agent process is still alive.
    async fn is_running(&self, handle: &AgentHandle) -> bool;
}

// Compile-time assertion: AgentHarness must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentHarness) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    /// A trivial harness proving the trait is implementable and usable as
    /// `dyn AgentHarness`.
    struct NoopHarness;

    #[async_trait]
    impl AgentHarness for NoopHarness {
        fn name(&self) -> &str {
            "noop"
        }

        async fn spawn(&self, _options: &SpawnOptions) -> Result<AgentHandle> {
            Ok(AgentHandle {
                pid: 0,
                stdin: None,
                harness_name: "noop".to_owned(),
            })
        }

        fn messages(
            &self,
            _handle: &AgentHandle,
        ) -> Pin<Box<dyn Stream<Item = AgentMessage> + Send>> {
            Box::pin(futures::stream::empty())
        }

        async fn kill(&self, _handle: &AgentHandle) -> Result<()> {
            Ok(())
        }

        async fn is_running(&self, _handle: &AgentHandle) -> bool {
            false
        }
    }

    #[test]
    fn harness_is_object_safe() {
        let harness: Box<dyn AgentHarness> = Box::new(NoopHarness);
        assert_eq!(harness.name(), "noop");
    }

    #[tokio::test]
    async fn noop_harness_spawn_and_query() {
        use futures::StreamExt;

        let harness: Box<dyn AgentHarness> = Box::new(NoopHarness);
        let options = SpawnOptions::new("do nothing", "/tmp");

        let handle = harness.spawn(&options).await.unwrap();
        assert_eq!(handle.pid, 0);
        assert!(!harness.is_running(&handle).await);

        let messages: Vec<AgentMessage> = harness.messages(&handle).collect().await;
        assert!(messages.is_empty());

        harness.kill(&handle).await.unwrap();
    }
}

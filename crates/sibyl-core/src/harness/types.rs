//! Common types shared by all agent harnesses.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::ChildStdin;

/// Token usage reported by the agent runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A typed message from the agent subprocess stream.
///
/// Streams are finite and ordered; a well-behaved harness terminates each
/// stream with a [`AgentMessage::Result`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentMessage {
    /// Echo of user input injected into the session.
    User { content: String },
    /// Assistant text output.
    Assistant {
        content: String,
        model: Option<String>,
    },
    /// The agent invoked a tool.
    ToolUse { tool: String, input: Value },
    /// A tool returned a value.
    ToolResult { tool: String, output: Value },
    /// Terminal message carrying cost, usage, and the resume key.
    Result {
        subtype: String,
        duration_ms: Option<u64>,
        total_cost_usd: Option<f64>,
        session_id: Option<String>,
        usage: TokenUsage,
    },
    /// Low-level stream event passed through for the UI.
    StreamEvent { payload: Value },
}

impl AgentMessage {
    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

/// Everything a harness needs to spawn (or resume) one agent session.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// The user prompt delivered on stdin.
    pub prompt: String,
    /// Layered system prompt appended to the harness defaults.
    pub system_prompt: String,
    /// Working directory for the subprocess (the agent's worktree).
    pub working_dir: PathBuf,
    /// Resume key; when present the subprocess re-enters the session and
    /// reconstructs its own conversation history.
    pub session_id: Option<String>,
    /// Extra environment for the subprocess.
    pub env_vars: HashMap<String, String>,
    /// Tool allowlist passed to the harness.
    pub allowed_tools: Vec<String>,
}

impl SpawnOptions {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: String::new(),
            working_dir: working_dir.into(),
            session_id: None,
            env_vars: HashMap::new(),
            allowed_tools: vec![
                "Bash".to_owned(),
                "Read".to_owned(),
                "Edit".to_owned(),
                "Write".to_owned(),
                "Glob".to_owned(),
                "Grep".to_owned(),
            ],
        }
    }
}

/// Handle to a spawned agent process.
#[derive(Debug)]
pub struct AgentHandle {
    /// OS process id.
    pub pid: u32,
    /// Piped stdin; `Option` so callers can `.take()` it once.
    pub stdin: Option<ChildStdin>,
    /// Name of the harness that spawned this process.
    pub harness_name: String,
}

//! Claude Code harness adapter.
//!
//! Spawns `claude -p --output-format stream-json` as a subprocess and
//! parses its JSONL output into [`AgentMessage`] variants. Resume is
//! `--resume <session_id>`; the subprocess reconstructs its own
//! conversation history from the session.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::trait_def::AgentHarness;
use super::types::{AgentHandle, AgentMessage, SpawnOptions, TokenUsage};

/// Internal state kept per spawned process.
struct ProcessState {
    /// The child process handle (for kill / is_running).
    child: Child,
    /// Stdout reader; `Option` so it can be `.take()`-ed once for streaming.
    stdout: Option<ChildStdout>,
}

/// Harness adapter for the Claude Code CLI.
#[derive(Clone)]
pub struct ClaudeCodeHarness {
    /// Path to the `claude` binary. Defaults to `"claude"` (found via `$PATH`).
    binary_path: String,
    /// Per-process bookkeeping, keyed by OS pid.
    processes: Arc<Mutex<HashMap<u32, ProcessState>>>,
}

impl std::fmt::Debug for ClaudeCodeHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeCodeHarness")
            .field("binary_path", &self.binary_path)
            .finish()
    }
}

impl ClaudeCodeHarness {
    /// Create a harness that looks for `claude` on `$PATH`.
    pub fn new() -> Self {
        Self {
            binary_path: "claude".to_owned(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a harness with a custom binary path.
    ///
    /// Useful for testing or non-standard installs.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for ClaudeCodeHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// JSONL parsing
// ---------------------------------------------------------------------------

fn parse_usage(value: Option<&serde_json::Value>) -> TokenUsage {
    let Some(usage) = value else {
        return TokenUsage::default();
    };
    TokenUsage {
        input_tokens: usage
            .get("input_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0),
        output_tokens: usage
            .get("output_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0),
    }
}

/// Parse a single JSONL line from stream-json output into zero or more
/// [`AgentMessage`] values.
///
/// Returns `Err` only for lines that are not valid JSON; callers treat
/// that as a warning and keep reading.
fn parse_stream_json_line(line: &str) -> Result<Vec<AgentMessage>> {
    let v: serde_json::Value =
        serde_json::from_str(line).context("malformed JSON in stream output")?;

    let mut messages = Vec::new();
    let message_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match message_type {
        // ----------------------------------------------------------------
        // user -- echo of injected input
        // ----------------------------------------------------------------
        "user" => {
            let content = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
                .or_else(|| v.get("content").and_then(|c| c.as_str()))
                .unwrap_or("")
                .to_owned();
            messages.push(AgentMessage::User { content });
        }

        // ----------------------------------------------------------------
        // assistant -- text and tool_use content blocks
        // ----------------------------------------------------------------
        "assistant" => {
            if let Some(message) = v.get("message") {
                let model = message
                    .get("model")
                    .and_then(|m| m.as_str())
                    .map(str::to_owned);
                if let Some(blocks) = message.get("content").and_then(|c| c.as_array()) {
                    for block in blocks {
                        let block_type = block.get("type").and_then(|t| t.as_str()).unwrap_or("");
                        match block_type {
                            "text" => {
                                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                    messages.push(AgentMessage::Assistant {
                                        content: text.to_owned(),
                                        model: model.clone(),
                                    });
                                }
                            }
                            "tool_use" => {
                                let tool = block
                                    .get("name")
                                    .and_then(|n| n.as_str())
                                    .unwrap_or("unknown")
                                    .to_owned();
                                let input = block
                                    .get("input")
                                    .cloned()
                                    .unwrap_or(serde_json::Value::Null);
                                messages.push(AgentMessage::ToolUse { tool, input });
                            }
                            _ => {
                                // Unknown content block; skip.
                            }
                        }
                    }
                }
            }
        }

        // ----------------------------------------------------------------
        // tool_result -- a tool returned a value
        // ----------------------------------------------------------------
        "tool_result" => {
            let tool = v
                .get("name")
                .or_else(|| v.get("tool"))
                .and_then(|n| n.as_str())
                .unwrap_or("unknown")
                .to_owned();
            let output = v
                .get("output")
                .or_else(|| v.get("content"))
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            messages.push(AgentMessage::ToolResult { tool, output });
        }

        // ----------------------------------------------------------------
        // result -- terminal message with cost, usage, and session id
        // ----------------------------------------------------------------
        "result" => {
            messages.push(AgentMessage::Result {
                subtype: v
                    .get("subtype")
                    .and_then(|s| s.as_str())
                    .unwrap_or("success")
                    .to_owned(),
                duration_ms: v.get("duration_ms").and_then(serde_json::Value::as_u64),
                total_cost_usd: v
                    .get("total_cost_usd")
                    .and_then(serde_json::Value::as_f64),
                session_id: v
                    .get("session_id")
                    .and_then(|s| s.as_str())
                    .map(str::to_owned),
                usage: parse_usage(v.get("usage")),
            });
        }

        // ----------------------------------------------------------------
        // stream_event / system -- passed through for the UI
        // ----------------------------------------------------------------
        "stream_event" | "system" => {
            messages.push(AgentMessage::StreamEvent { payload: v });
        }

        other => {
            debug!(message_type = other, "ignoring unrecognised stream-json message type");
        }
    }

    Ok(messages)
}

// ---------------------------------------------------------------------------
// AgentHarness implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl AgentHarness for ClaudeCodeHarness {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn spawn(&self, options: &SpawnOptions) -> Result<AgentHandle> {
        let mut cmd = Command::new(&self.binary_path);

        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");

        if !options.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(options.allowed_tools.join(","));
        }
        if !options.system_prompt.is_empty() {
            cmd.arg("--append-system-prompt").arg(&options.system_prompt);
        }
        if let Some(session_id) = &options.session_id {
            cmd.arg("--resume").arg(session_id);
        }

        cmd.current_dir(&options.working_dir);
        for (key, value) in &options.env_vars {
            cmd.env(key, value);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn claude binary at '{}' -- is it installed and on PATH?",
                self.binary_path
            )
        })?;

        let pid = child.id().context("child process has no pid")?;

        // Deliver the prompt on stdin and close it so the agent starts.
        let mut stdin = child.stdin.take();
        if let Some(stdin) = stdin.as_mut() {
            if let Err(e) = stdin.write_all(options.prompt.as_bytes()).await {
                warn!(pid, error = %e, "failed to write prompt to agent stdin");
            }
        }
        drop(stdin);

        let stdout = child.stdout.take();
        {
            let mut processes = self.processes.lock().await;
            processes.insert(pid, ProcessState { child, stdout });
        }

        Ok(AgentHandle {
            pid,
            stdin: None,
            harness_name: self.name().to_owned(),
        })
    }

    fn messages(
        &self,
        handle: &AgentHandle,
    ) -> Pin<Box<dyn Stream<Item = AgentMessage> + Send>> {
        let pid = handle.pid;
        let processes = Arc::clone(&self.processes);

        let stream = async_stream::stream! {
            let stdout = {
                let mut procs = processes.lock().await;
                procs.get_mut(&pid).and_then(|state| state.stdout.take())
            };

            let Some(stdout) = stdout else {
                warn!(pid, "no stdout available -- messages already consumed or process missing");
                yield AgentMessage::Result {
                    subtype: "error_no_stream".to_owned(),
                    duration_ms: None,
                    total_cost_usd: None,
                    session_id: None,
                    usage: TokenUsage::default(),
                };
                return;
            };

            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            let mut saw_result = false;

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match parse_stream_json_line(trimmed) {
                            Ok(messages) => {
                                for message in messages {
                                    if message.is_result() {
                                        saw_result = true;
                                    }
                                    yield message;
                                }
                            }
                            Err(e) => {
                                warn!(line = trimmed, error = %e, "skipping malformed JSONL line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(pid, error = %e, "error reading agent stdout");
                        break;
                    }
                }
            }

            // The stream contract is "finite, ends with a result". A crash
            // before the result line gets a synthesized one.
            if !saw_result {
                yield AgentMessage::Result {
                    subtype: "error_stream_ended".to_owned(),
                    duration_ms: None,
                    total_cost_usd: None,
                    session_id: None,
                    usage: TokenUsage::default(),
                };
            }
        };

        Box::pin(stream)
    }

    async fn kill(&self, handle: &AgentHandle) -> Result<()> {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        if let Some(state) = processes.get_mut(&pid) {
            // SIGTERM first for a graceful shutdown.
            #[cfg(unix)]
            {
                // SAFETY: pid is a valid u32 from a child we spawned.
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
                }
            }

            let exited = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                state.child.wait(),
            )
            .await;

            match exited {
                Ok(Ok(_status)) => {
                    debug!(pid, "process exited after SIGTERM");
                }
                _ => {
                    debug!(pid, "process did not exit after SIGTERM, sending SIGKILL");
                    let _ = state.child.kill().await;
                }
            }

            processes.remove(&pid);
        } else {
            debug!(pid, "kill called but process not in map (already exited?)");
        }

        Ok(())
    }

    async fn is_running(&self, handle: &AgentHandle) -> bool {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        if let Some(state) = processes.get_mut(&pid) {
            match state.child.try_wait() {
                Ok(Some(_status)) => {
                    processes.remove(&pid);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(pid, error = %e, "error checking process status");
                    false
                }
            }
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    // -- JSONL parsing tests -----------------------------------------------

    #[test]
    fn parse_assistant_text_block() {
        let line = r#"{"type":"assistant","message":{"model":"claude-sonnet","content":[{"type":"text","text":"Hello, world!"}]}}"#;
        let messages = parse_stream_json_line(line).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            AgentMessage::Assistant {
                content: "Hello, world!".to_owned(),
                model: Some("claude-sonnet".to_owned()),
            }
        );
    }

    #[test]
    fn parse_assistant_tool_use_block() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"ls -la"}}]}}"#;
        let messages = parse_stream_json_line(line).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            AgentMessage::ToolUse {
                tool: "Bash".to_owned(),
                input: serde_json::json!({"command": "ls -la"}),
            }
        );
    }

    #[test]
    fn parse_tool_result() {
        let line = r#"{"type":"tool_result","name":"Bash","output":"file.rs\nlib.rs\n"}"#;
        let messages = parse_stream_json_line(line).unwrap();
        assert_eq!(
            messages[0],
            AgentMessage::ToolResult {
                tool: "Bash".to_owned(),
                output: serde_json::json!("file.rs\nlib.rs\n"),
            }
        );
    }

    #[test]
    fn parse_result_with_session_and_cost() {
        let line = r#"{"type":"result","subtype":"success","duration_ms":1234,"total_cost_usd":0.25,"session_id":"sess_abc","usage":{"input_tokens":500,"output_tokens":200}}"#;
        let messages = parse_stream_json_line(line).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            AgentMessage::Result {
                subtype: "success".to_owned(),
                duration_ms: Some(1234),
                total_cost_usd: Some(0.25),
                session_id: Some("sess_abc".to_owned()),
                usage: TokenUsage {
                    input_tokens: 500,
                    output_tokens: 200,
                },
            }
        );
    }

    #[test]
    fn parse_user_message() {
        let line = r#"{"type":"user","message":{"content":"please continue"}}"#;
        let messages = parse_stream_json_line(line).unwrap();
        assert_eq!(
            messages[0],
            AgentMessage::User {
                content: "please continue".to_owned(),
            }
        );
    }

    #[test]
    fn parse_system_becomes_stream_event() {
        let line = r#"{"type":"system","data":"warmup"}"#;
        let messages = parse_stream_json_line(line).unwrap();
        assert!(matches!(messages[0], AgentMessage::StreamEvent { .. }));
    }

    #[test]
    fn parse_unknown_type_returns_empty() {
        let line = r#"{"type":"telemetry","data":1}"#;
        let messages = parse_stream_json_line(line).unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn parse_malformed_json_returns_error() {
        assert!(parse_stream_json_line("this is not json").is_err());
    }

    // -- Integration tests with fake subprocesses --------------------------

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn spawn_fake_agent_and_stream_messages() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "fake_claude.sh",
            "#!/bin/sh\n\
             cat > /dev/null\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"working\"}]}}'\n\
             echo '{\"type\":\"tool_use\",\"name\":\"Bash\",\"input\":{}}'\n\
             echo '{\"type\":\"result\",\"subtype\":\"success\",\"session_id\":\"sess_1\",\"total_cost_usd\":0.01,\"usage\":{\"input_tokens\":10,\"output_tokens\":5}}'\n",
        );

        let harness = ClaudeCodeHarness::with_binary(script.to_str().unwrap());
        let options = SpawnOptions::new("do the thing", tmp.path());

        let handle = harness.spawn(&options).await.unwrap();
        assert!(handle.pid > 0);
        assert_eq!(handle.harness_name, "claude-code");

        let messages: Vec<AgentMessage> = harness.messages(&handle).collect().await;
        assert!(
            matches!(messages.first(), Some(AgentMessage::Assistant { content, .. }) if content == "working")
        );
        let last = messages.last().unwrap();
        match last {
            AgentMessage::Result {
                session_id,
                total_cost_usd,
                ..
            } => {
                assert_eq!(session_id.as_deref(), Some("sess_1"));
                assert_eq!(*total_cost_usd, Some(0.01));
            }
            other => panic!("expected terminal Result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "bad_claude.sh",
            "#!/bin/sh\n\
             cat > /dev/null\n\
             echo 'not json'\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"ok\"}]}}'\n",
        );

        let harness = ClaudeCodeHarness::with_binary(script.to_str().unwrap());
        let handle = harness
            .spawn(&SpawnOptions::new("x", tmp.path()))
            .await
            .unwrap();
        let messages: Vec<AgentMessage> = harness.messages(&handle).collect().await;

        assert!(messages.iter().any(
            |m| matches!(m, AgentMessage::Assistant { content, .. } if content == "ok")
        ));
        // EOF without a result line synthesizes one.
        assert!(matches!(
            messages.last(),
            Some(AgentMessage::Result { subtype, .. }) if subtype == "error_stream_ended"
        ));
    }

    #[tokio::test]
    async fn spawn_binary_not_found_returns_error() {
        let harness = ClaudeCodeHarness::with_binary("/nonexistent/path/to/claude");
        let result = harness
            .spawn(&SpawnOptions::new("x", "/tmp"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn kill_terminates_subprocess() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "sleepy.sh", "#!/bin/sh\nsleep 3600\n");

        let harness = ClaudeCodeHarness::with_binary(script.to_str().unwrap());
        let handle = harness
            .spawn(&SpawnOptions::new("x", tmp.path()))
            .await
            .unwrap();
        assert!(harness.is_running(&handle).await);

        harness.kill(&handle).await.unwrap();
        assert!(!harness.is_running(&handle).await);
    }

    #[tokio::test]
    async fn resume_passes_session_flag() {
        let tmp = tempfile::tempdir().unwrap();
        // Echo back the arguments so the test can see --resume.
        let script = write_script(
            tmp.path(),
            "args.sh",
            "#!/bin/sh\n\
             cat > /dev/null\n\
             printf '{\"type\":\"result\",\"subtype\":\"success\",\"session_id\":\"%s\"}\\n' \"$*\" | tr -d '\\\\'\n",
        );

        let harness = ClaudeCodeHarness::with_binary(script.to_str().unwrap());
        let mut options = SpawnOptions::new("continue", tmp.path());
        options.session_id = Some("sess_42".to_owned());

        let handle = harness.spawn(&options).await.unwrap();
        let messages: Vec<AgentMessage> = harness.messages(&handle).collect().await;
        let result = messages.last().unwrap();
        if let AgentMessage::Result { session_id, .. } = result {
            let echoed = session_id.clone().unwrap_or_default();
            assert!(echoed.contains("--resume"), "args were: {echoed}");
            assert!(echoed.contains("sess_42"), "args were: {echoed}");
        } else {
            panic!("expected a Result message");
        }
    }
}

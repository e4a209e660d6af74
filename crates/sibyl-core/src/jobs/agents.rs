//! Agent execution jobs: the supervised, message-by-message driver of an
//! agent session.
//!
//! The worker persists UI-consumable summaries (never raw tool payloads)
//! to the SQL message log with monotonic `message_num`, broadcasts every
//! event, honors the stop watcher (owned by the instance stream), nudges
//! the agent once after substantive work, and checkpoints on exit.

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::{Value, json};
use tracing::{info, warn};

use sibyl_db::models::{AgentMessageKind, AgentMessageRole};
use sibyl_db::queries::agent_log::{self, NewAgentMessage};

use crate::entity::records::{AgentStatus, AgentType, SpawnSource, Task};
use crate::harness::AgentMessage;
use crate::runner::SpawnRequest;

use super::{JobContext, safe_broadcast};

/// How many substantive messages before the one-shot completion reminder
/// becomes eligible.
const REMINDER_THRESHOLD: usize = 5;

/// Tracks whether the session did real work and whether the one follow-up
/// reminder has been spent.
#[derive(Debug, Default)]
pub struct WorkflowTracker {
    substantive_messages: usize,
    reminded: bool,
}

impl WorkflowTracker {
    pub fn observe(&mut self, message: &AgentMessage) {
        if matches!(
            message,
            AgentMessage::Assistant { .. } | AgentMessage::ToolUse { .. }
        ) {
            self.substantive_messages += 1;
        }
    }

    /// One reminder per session, only after substantive work.
    pub fn should_remind(&self) -> bool {
        !self.reminded && self.substantive_messages >= REMINDER_THRESHOLD
    }

    pub fn mark_reminded(&mut self) {
        self.reminded = true;
    }
}

/// Shape a stream message into `(role, kind, content, extra)` for the UI
/// log, or `None` for messages that are broadcast but not persisted.
///
/// Tool outputs are summarized, not stored: the log is for humans, the
/// worktree holds the real artifacts.
fn format_ui_message(
    message: &AgentMessage,
) -> Option<(AgentMessageRole, AgentMessageKind, String, Value)> {
    match message {
        AgentMessage::User { content } => Some((
            AgentMessageRole::User,
            AgentMessageKind::Text,
            content.clone(),
            json!({}),
        )),
        AgentMessage::Assistant { content, model } => Some((
            AgentMessageRole::Assistant,
            AgentMessageKind::Text,
            content.clone(),
            json!({"model": model}),
        )),
        AgentMessage::ToolUse { tool, input } => {
            let summary = serde_json::to_string(input).unwrap_or_default();
            let truncated: String = summary.chars().take(200).collect();
            Some((
                AgentMessageRole::Assistant,
                AgentMessageKind::ToolUse,
                format!("Using {tool}"),
                json!({"tool": tool, "input_preview": truncated}),
            ))
        }
        AgentMessage::ToolResult { tool, .. } => Some((
            AgentMessageRole::System,
            AgentMessageKind::ToolResult,
            format!("{tool} finished"),
            json!({"tool": tool}),
        )),
        AgentMessage::Result {
            subtype,
            duration_ms,
            total_cost_usd,
            ..
        } => Some((
            AgentMessageRole::System,
            AgentMessageKind::Text,
            format!("Session finished: {subtype}"),
            json!({"duration_ms": duration_ms, "total_cost_usd": total_cost_usd}),
        )),
        // Low-level stream events are broadcast-only.
        AgentMessage::StreamEvent { .. } => None,
    }
}

/// Drive one message stream to completion: persist, broadcast, track.
async fn drive_stream(
    ctx: &JobContext,
    agent_id: &str,
    org_uuid: uuid::Uuid,
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = AgentMessage> + Send>>,
    tracker: &mut WorkflowTracker,
) -> Result<()> {
    while let Some(message) = stream.next().await {
        tracker.observe(&message);

        if let Some((role, kind, content, extra)) = format_ui_message(&message) {
            let row = NewAgentMessage {
                organization_id: org_uuid,
                agent_id: agent_id.to_owned(),
                role,
                kind,
                content,
                extra,
            };
            match agent_log::append_message(&ctx.pool, &row).await {
                Ok(stored) => {
                    safe_broadcast(
                        ctx.bus.as_ref(),
                        "agent_message",
                        &json!({
                            "agent_id": agent_id,
                            "org_id": org_uuid.to_string(),
                            "message_num": stored.message_num,
                            "role": stored.role.to_string(),
                            "kind": stored.kind.to_string(),
                            "content": stored.content,
                            "extra": stored.extra,
                        }),
                    )
                    .await;
                }
                Err(e) => {
                    warn!(agent_id, error = %e, "failed to persist agent message");
                }
            }
        } else {
            // Stream events are forwarded raw.
            safe_broadcast(
                ctx.bus.as_ref(),
                "agent_stream_event",
                &json!({"agent_id": agent_id, "org_id": org_uuid.to_string()}),
            )
            .await;
        }
    }
    Ok(())
}

/// Run one agent session to completion under worker supervision.
///
/// On failure the agent record is marked failed and the error re-raised so
/// the queue records the failure.
pub async fn run_agent_execution(ctx: &JobContext, agent_id: &str, prompt: &str) -> Result<()> {
    let org_uuid: uuid::Uuid = ctx
        .store
        .org_id()
        .parse()
        .context("org id is not a UUID")?;

    let instance = ctx
        .runner
        .get_agent(agent_id)
        .with_context(|| format!("agent {agent_id} is not registered in this worker"))?;

    safe_broadcast(
        ctx.bus.as_ref(),
        "agent_status",
        &json!({"agent_id": agent_id, "org_id": org_uuid.to_string(), "status": "working"}),
    )
    .await;

    let result = async {
        let stream = instance.execute(prompt).await?;
        let mut tracker = WorkflowTracker::default();
        drive_stream(ctx, agent_id, org_uuid, stream, &mut tracker).await?;

        // One follow-up after substantive work, never more.
        if tracker.should_remind() {
            tracker.mark_reminded();
            info!(agent_id, "sending workflow completion reminder");
            let reminder = "Before finishing: summarize what you changed, note any \
                            follow-ups, and confirm the task state.";
            let stream = instance.send_message(reminder).await?;
            drive_stream(ctx, agent_id, org_uuid, stream, &mut tracker).await?;
        }

        anyhow::Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            instance.checkpoint(None).await?;
            instance.finalize(AgentStatus::Completed).await?;
            ctx.runner.unregister(agent_id);
            safe_broadcast(
                ctx.bus.as_ref(),
                "agent_status",
                &json!({"agent_id": agent_id, "org_id": org_uuid.to_string(), "status": "completed"}),
            )
            .await;
            Ok(())
        }
        Err(e) => {
            warn!(agent_id, error = format!("{e:#}"), "agent execution failed");
            let _ = instance.checkpoint(Some("execution_failed")).await;
            let _ = instance.finalize(AgentStatus::Failed).await;
            ctx.runner.unregister(agent_id);
            safe_broadcast(
                ctx.bus.as_ref(),
                "agent_status",
                &json!({"agent_id": agent_id, "org_id": org_uuid.to_string(), "status": "failed"}),
            )
            .await;
            Err(e)
        }
    }
}

/// Resume (or restart) an agent session after a worker restart.
///
/// The instance is re-registered from its persisted record; `message_num`
/// continues from the current max because allocation lives in the insert.
pub async fn resume_agent_execution(ctx: &JobContext, agent_id: &str) -> Result<()> {
    let org_uuid: uuid::Uuid = ctx
        .store
        .org_id()
        .parse()
        .context("org id is not a UUID")?;

    let instance = match ctx.runner.get_agent(agent_id) {
        Some(instance) => instance,
        None => {
            // Re-register from the persisted record; spawn merges into it.
            let entity = ctx
                .store
                .get(agent_id)
                .await
                .map_err(anyhow::Error::from)?;
            let record = crate::entity::records::AgentRecord::from_entity(&entity)?;

            let task = match &record.task_id {
                Some(task_id) => {
                    let task_entity = ctx
                        .store
                        .get(task_id)
                        .await
                        .map_err(anyhow::Error::from)?;
                    Some(Task::from_entity(&task_entity)?)
                }
                None => None,
            };

            let mut req = SpawnRequest::new(
                task.as_ref().map(|t| t.project_id.clone()).unwrap_or_default(),
                AgentType::Implementer,
            );
            req.agent_id = Some(agent_id.to_owned());
            req.agent_type = record.agent_type;
            req.spawn_source = SpawnSource::Orchestrator;
            req.task = task;
            req.enable_approvals = true;
            ctx.runner.spawn(req).await.map_err(|e| anyhow::anyhow!(e))?
        }
    };

    let resumed_with_session = instance.session_id().is_some();
    info!(agent_id, resumed_with_session, "resuming agent execution");

    let stream = instance.resume().await?;
    let mut tracker = WorkflowTracker::default();
    let result = drive_stream(ctx, agent_id, org_uuid, stream, &mut tracker).await;

    match result {
        Ok(()) => {
            instance.checkpoint(None).await?;
            instance.finalize(AgentStatus::Completed).await?;
            ctx.runner.unregister(agent_id);
            Ok(())
        }
        Err(e) => {
            let _ = instance.checkpoint(Some("resume_failed")).await;
            let _ = instance.finalize(AgentStatus::Failed).await;
            ctx.runner.unregister(agent_id);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::TokenUsage;

    fn assistant(content: &str) -> AgentMessage {
        AgentMessage::Assistant {
            content: content.to_owned(),
            model: None,
        }
    }

    #[test]
    fn tracker_reminds_once_after_threshold() {
        let mut tracker = WorkflowTracker::default();
        assert!(!tracker.should_remind());

        for i in 0..REMINDER_THRESHOLD {
            assert!(!tracker.should_remind(), "too eager at message {i}");
            tracker.observe(&assistant("working"));
        }
        assert!(tracker.should_remind());

        tracker.mark_reminded();
        assert!(!tracker.should_remind());
    }

    #[test]
    fn tracker_ignores_stream_events() {
        let mut tracker = WorkflowTracker::default();
        for _ in 0..20 {
            tracker.observe(&AgentMessage::StreamEvent { payload: json!({}) });
        }
        assert!(!tracker.should_remind());
    }

    #[test]
    fn tool_results_persist_summaries_not_payloads() {
        let message = AgentMessage::ToolResult {
            tool: "Bash".to_owned(),
            output: json!("gigantic tool output that should never hit the log"),
        };
        let (role, kind, content, extra) = format_ui_message(&message).unwrap();
        assert_eq!(role, AgentMessageRole::System);
        assert_eq!(kind, AgentMessageKind::ToolResult);
        assert_eq!(content, "Bash finished");
        assert!(extra.get("output").is_none());
    }

    #[test]
    fn tool_use_input_is_previewed() {
        let message = AgentMessage::ToolUse {
            tool: "Write".to_owned(),
            input: json!({"path": "a.rs", "content": "x".repeat(1000)}),
        };
        let (_, _, content, extra) = format_ui_message(&message).unwrap();
        assert_eq!(content, "Using Write");
        let preview = extra
            .get("input_preview")
            .and_then(Value::as_str)
            .unwrap();
        assert!(preview.len() <= 200);
    }

    #[test]
    fn stream_events_are_not_persisted() {
        let message = AgentMessage::StreamEvent { payload: json!({"x": 1}) };
        assert!(format_ui_message(&message).is_none());
    }

    #[test]
    fn result_message_persists_summary() {
        let message = AgentMessage::Result {
            subtype: "success".to_owned(),
            duration_ms: Some(1500),
            total_cost_usd: Some(0.12),
            session_id: Some("sess".to_owned()),
            usage: TokenUsage::default(),
        };
        let (_, _, content, extra) = format_ui_message(&message).unwrap();
        assert_eq!(content, "Session finished: success");
        assert_eq!(extra.get("duration_ms").and_then(Value::as_u64), Some(1500));
    }
}

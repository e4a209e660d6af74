//! Inter-agent message bus: transport and audit in one.
//!
//! Every send is persisted to the `inter_agent_message` table and then
//! published as a pub/sub event; the row is the source of truth, the event
//! is only an optimization. Blocking queries poll the SQL store rather
//! than subscribing, so responses outlast subscribers across restarts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use sibyl_db::models::{InterAgentMessage, InterAgentMessageType};
use sibyl_db::queries::messages::{self, NewInterAgentMessage};

use crate::bus::KvBus;
use crate::error::SibylError;

/// Default deadline for blocking queries.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);
/// How often a blocking query polls for its response row.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Pub/sub channel for message fan-out; the payload is org-scoped.
pub const MESSAGE_CHANNEL: &str = "inter_agent_message";

/// Optional parameters for [`MessageBus::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub to_agent_id: Option<String>,
    pub requires_response: bool,
    pub priority: i32,
    pub context: Option<Value>,
}

/// Inter-agent message bus scoped to one organization.
pub struct MessageBus {
    pool: PgPool,
    bus: Arc<dyn KvBus>,
    organization_id: Uuid,
}

impl MessageBus {
    pub fn new(pool: PgPool, bus: Arc<dyn KvBus>, organization_id: Uuid) -> Self {
        Self {
            pool,
            bus,
            organization_id,
        }
    }

    // -----------------------------------------------------------------
    // Core send / respond
    // -----------------------------------------------------------------

    /// Persist a message and publish the fan-out event.
    pub async fn send(
        &self,
        from_agent_id: &str,
        message_type: InterAgentMessageType,
        subject: &str,
        content: &str,
        options: SendOptions,
    ) -> Result<InterAgentMessage> {
        let message = messages::insert_message(
            &self.pool,
            &NewInterAgentMessage {
                organization_id: self.organization_id,
                from_agent_id: from_agent_id.to_owned(),
                to_agent_id: options.to_agent_id.clone(),
                message_type,
                subject: subject.to_owned(),
                content: content.to_owned(),
                priority: options.priority,
                requires_response: options.requires_response,
                response_to_id: None,
                context: options.context.unwrap_or_else(|| serde_json::json!({})),
            },
        )
        .await?;

        self.publish_event(&message).await;

        info!(
            message_id = %message.id,
            from_agent = from_agent_id,
            to_agent = ?options.to_agent_id,
            message_type = %message_type,
            "message sent"
        );
        Ok(message)
    }

    /// Respond to a message: a linked row referencing the original, with
    /// `responded_at` stamped on it.
    pub async fn respond(
        &self,
        original_message_id: Uuid,
        from_agent_id: &str,
        content: &str,
        context: Option<Value>,
    ) -> Result<InterAgentMessage> {
        let original = messages::get_message(&self.pool, original_message_id, self.organization_id)
            .await?
            .ok_or_else(|| -> anyhow::Error {
                SibylError::not_found("message", original_message_id.to_string()).into()
            })?;

        let response = messages::insert_message(
            &self.pool,
            &NewInterAgentMessage {
                organization_id: self.organization_id,
                from_agent_id: from_agent_id.to_owned(),
                // Back to the original sender.
                to_agent_id: Some(original.from_agent_id.clone()),
                message_type: InterAgentMessageType::Response,
                subject: format!("Re: {}", original.subject),
                content: content.to_owned(),
                priority: original.priority,
                requires_response: false,
                response_to_id: Some(original_message_id),
                context: context.unwrap_or_else(|| serde_json::json!({})),
            },
        )
        .await?;

        messages::mark_responded(&self.pool, original_message_id).await?;
        self.publish_event(&response).await;

        info!(
            response_id = %response.id,
            original_id = %original_message_id,
            from_agent = from_agent_id,
            "message responded"
        );
        Ok(response)
    }

    // -----------------------------------------------------------------
    // Convenience senders
    // -----------------------------------------------------------------

    /// Progress update; `None` target broadcasts to the orchestrator.
    pub async fn send_progress(
        &self,
        from_agent_id: &str,
        content: &str,
        progress_pct: Option<u8>,
        to_agent_id: Option<String>,
    ) -> Result<InterAgentMessage> {
        let subject = match progress_pct {
            Some(pct) => format!("Progress: {pct}%"),
            None => "Progress update".to_owned(),
        };
        let context = progress_pct.map(|pct| serde_json::json!({"progress_percent": pct}));
        self.send(
            from_agent_id,
            InterAgentMessageType::Progress,
            &subject,
            content,
            SendOptions {
                to_agent_id,
                context,
                ..Default::default()
            },
        )
        .await
    }

    /// Report a blocker. Blockers are high priority.
    pub async fn send_blocker(
        &self,
        from_agent_id: &str,
        subject: &str,
        content: &str,
        blocking_resource: Option<&str>,
    ) -> Result<InterAgentMessage> {
        let context =
            blocking_resource.map(|resource| serde_json::json!({"blocking_resource": resource}));
        self.send(
            from_agent_id,
            InterAgentMessageType::Blocker,
            subject,
            content,
            SendOptions {
                priority: 7,
                context,
                ..Default::default()
            },
        )
        .await
    }

    /// Delegate work to another agent.
    pub async fn delegate(
        &self,
        from_agent_id: &str,
        to_agent_id: &str,
        subject: &str,
        content: &str,
        task_id: Option<&str>,
    ) -> Result<InterAgentMessage> {
        let context = task_id.map(|id| serde_json::json!({"task_id": id}));
        self.send(
            from_agent_id,
            InterAgentMessageType::Delegation,
            subject,
            content,
            SendOptions {
                to_agent_id: Some(to_agent_id.to_owned()),
                priority: 5,
                context,
                ..Default::default()
            },
        )
        .await
    }

    /// Request a code review from another agent.
    pub async fn request_review(
        &self,
        from_agent_id: &str,
        to_agent_id: &str,
        subject: &str,
        content: &str,
        files: Option<Vec<String>>,
    ) -> Result<InterAgentMessage> {
        let context = files.map(|files| serde_json::json!({"files": files}));
        self.send(
            from_agent_id,
            InterAgentMessageType::ReviewRequest,
            subject,
            content,
            SendOptions {
                to_agent_id: Some(to_agent_id.to_owned()),
                requires_response: true,
                priority: 5,
                context,
                ..Default::default()
            },
        )
        .await
    }

    // -----------------------------------------------------------------
    // Blocking query
    // -----------------------------------------------------------------

    /// Send a query and block until the response row appears or the
    /// deadline passes. Returns `None` on timeout.
    pub async fn query(
        &self,
        from_agent_id: &str,
        to_agent_id: &str,
        subject: &str,
        content: &str,
        timeout: Duration,
    ) -> Result<Option<InterAgentMessage>> {
        let query_message = self
            .send(
                from_agent_id,
                InterAgentMessageType::Query,
                subject,
                content,
                SendOptions {
                    to_agent_id: Some(to_agent_id.to_owned()),
                    requires_response: true,
                    priority: 5,
                    ..Default::default()
                },
            )
            .await?;

        self.wait_for_response(query_message.id, timeout).await
    }

    /// Poll the SQL store for a response to `message_id`. Polling (rather
    /// than pub/sub) keeps after-restart semantics trivial: responses
    /// outlast subscribers.
    pub async fn wait_for_response(
        &self,
        message_id: Uuid,
        timeout: Duration,
    ) -> Result<Option<InterAgentMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(response) = messages::find_response(&self.pool, message_id).await? {
                return Ok(Some(response));
            }
            if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    // -----------------------------------------------------------------
    // Read paths
    // -----------------------------------------------------------------

    /// Unread messages addressed to an agent, highest priority first.
    pub async fn get_pending(&self, agent_id: &str) -> Result<Vec<InterAgentMessage>> {
        messages::get_pending_for_agent(&self.pool, self.organization_id, agent_id).await
    }

    /// Mark a message read (first read wins).
    pub async fn mark_read(&self, message_id: Uuid) -> Result<bool> {
        let rows = messages::mark_read(&self.pool, message_id, self.organization_id).await?;
        Ok(rows > 0)
    }

    /// Conversation between two agents, oldest first.
    pub async fn get_conversation(
        &self,
        agent_a: &str,
        agent_b: &str,
        limit: i64,
    ) -> Result<Vec<InterAgentMessage>> {
        messages::get_conversation(&self.pool, self.organization_id, agent_a, agent_b, limit).await
    }

    /// Fire-and-forget fan-out; pub/sub failure never undoes the insert.
    async fn publish_event(&self, message: &InterAgentMessage) {
        let payload = serde_json::json!({
            "id": message.id.to_string(),
            "org_id": self.organization_id.to_string(),
            "from_agent_id": message.from_agent_id,
            "to_agent_id": message.to_agent_id,
            "message_type": message.message_type.to_string(),
            "subject": message.subject,
            "content": message.content,
            "priority": message.priority,
            "requires_response": message.requires_response,
            "response_to_id": message.response_to_id.map(|id| id.to_string()),
            "context": message.context,
            "created_at": message.created_at.to_rfc3339(),
        });
        if let Err(e) = self.bus.publish(MESSAGE_CHANNEL, &payload.to_string()).await {
            warn!(message_id = %message.id, error = %e, "failed to publish message event");
        }
    }
}

/// Convenience wrapper retaining the default timeout.
impl MessageBus {
    pub async fn query_default(
        &self,
        from_agent_id: &str,
        to_agent_id: &str,
        subject: &str,
        content: &str,
    ) -> Result<Option<InterAgentMessage>> {
        self.query(from_agent_id, to_agent_id, subject, content, DEFAULT_QUERY_TIMEOUT)
            .await
    }
}

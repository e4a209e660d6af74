//! Database query functions for the `inter_agent_message` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{InterAgentMessage, InterAgentMessageType};

/// Parameters for inserting a new inter-agent message row.
#[derive(Debug, Clone)]
pub struct NewInterAgentMessage {
    pub organization_id: Uuid,
    pub from_agent_id: String,
    pub to_agent_id: Option<String>,
    pub message_type: InterAgentMessageType,
    pub subject: String,
    pub content: String,
    pub priority: i32,
    pub requires_response: bool,
    pub response_to_id: Option<Uuid>,
    pub context: serde_json::Value,
}

/// Insert a new message row. Returns the inserted row with server-generated
/// defaults (id, created_at).
pub async fn insert_message(
    pool: &PgPool,
    new: &NewInterAgentMessage,
) -> Result<InterAgentMessage> {
    let message = sqlx::query_as::<_, InterAgentMessage>(
        "INSERT INTO inter_agent_message \
             (organization_id, from_agent_id, to_agent_id, message_type, subject, \
              content, priority, requires_response, response_to_id, context) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING *",
    )
    .bind(new.organization_id)
    .bind(&new.from_agent_id)
    .bind(new.to_agent_id.as_deref())
    .bind(new.message_type)
    .bind(&new.subject)
    .bind(&new.content)
    .bind(new.priority)
    .bind(new.requires_response)
    .bind(new.response_to_id)
    .bind(&new.context)
    .fetch_one(pool)
    .await
    .context("failed to insert inter-agent message")?;

    Ok(message)
}

/// Fetch a single message by ID, scoped to an organization.
pub async fn get_message(
    pool: &PgPool,
    id: Uuid,
    organization_id: Uuid,
) -> Result<Option<InterAgentMessage>> {
    let message = sqlx::query_as::<_, InterAgentMessage>(
        "SELECT * FROM inter_agent_message WHERE id = $1 AND organization_id = $2",
    )
    .bind(id)
    .bind(organization_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch inter-agent message")?;

    Ok(message)
}

/// Stamp `responded_at` on a message.
pub async fn mark_responded(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE inter_agent_message SET responded_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark message responded")?;

    Ok(())
}

/// Stamp `read_at` on a message (idempotent; first read wins).
pub async fn mark_read(pool: &PgPool, id: Uuid, organization_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE inter_agent_message \
         SET read_at = NOW() \
         WHERE id = $1 AND organization_id = $2 AND read_at IS NULL",
    )
    .bind(id)
    .bind(organization_id)
    .execute(pool)
    .await
    .context("failed to mark message read")?;

    Ok(result.rows_affected())
}

/// Find the response to a given message, if any.
pub async fn find_response(
    pool: &PgPool,
    original_id: Uuid,
) -> Result<Option<InterAgentMessage>> {
    let message = sqlx::query_as::<_, InterAgentMessage>(
        "SELECT * FROM inter_agent_message \
         WHERE response_to_id = $1 \
         ORDER BY created_at ASC \
         LIMIT 1",
    )
    .bind(original_id)
    .fetch_optional(pool)
    .await
    .context("failed to find response message")?;

    Ok(message)
}

/// Unread messages addressed to an agent, highest priority first.
pub async fn get_pending_for_agent(
    pool: &PgPool,
    organization_id: Uuid,
    agent_id: &str,
) -> Result<Vec<InterAgentMessage>> {
    let messages = sqlx::query_as::<_, InterAgentMessage>(
        "SELECT * FROM inter_agent_message \
         WHERE organization_id = $1 AND to_agent_id = $2 AND read_at IS NULL \
         ORDER BY priority DESC, created_at ASC",
    )
    .bind(organization_id)
    .bind(agent_id)
    .fetch_all(pool)
    .await
    .context("failed to list pending messages")?;

    Ok(messages)
}

/// Full conversation between two agents in either direction, oldest first.
pub async fn get_conversation(
    pool: &PgPool,
    organization_id: Uuid,
    agent_a: &str,
    agent_b: &str,
    limit: i64,
) -> Result<Vec<InterAgentMessage>> {
    let messages = sqlx::query_as::<_, InterAgentMessage>(
        "SELECT * FROM inter_agent_message \
         WHERE organization_id = $1 \
           AND ((from_agent_id = $2 AND to_agent_id = $3) \
             OR (from_agent_id = $3 AND to_agent_id = $2)) \
         ORDER BY created_at ASC \
         LIMIT $4",
    )
    .bind(organization_id)
    .bind(agent_a)
    .bind(agent_b)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch conversation")?;

    Ok(messages)
}

//! Database query functions for the `agent_message` table -- the per-agent
//! message log.
//!
//! `message_num` is strictly monotonic per agent across resumes. Allocation
//! happens inside the INSERT itself (`COALESCE(MAX(message_num), 0) + 1`)
//! so a crashed writer never leaves gaps and a resumed session continues
//! from the current max.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AgentMessage, AgentMessageKind, AgentMessageRole};

/// Parameters for appending to the agent message log.
#[derive(Debug, Clone)]
pub struct NewAgentMessage {
    pub organization_id: Uuid,
    pub agent_id: String,
    pub role: AgentMessageRole,
    pub kind: AgentMessageKind,
    pub content: String,
    pub extra: serde_json::Value,
}

/// Append a message, allocating the next `message_num` for the agent.
pub async fn append_message(pool: &PgPool, new: &NewAgentMessage) -> Result<AgentMessage> {
    let message = sqlx::query_as::<_, AgentMessage>(
        "INSERT INTO agent_message \
             (organization_id, agent_id, message_num, role, kind, content, extra) \
         SELECT $1, $2, COALESCE(MAX(message_num), 0) + 1, $3, $4, $5, $6 \
         FROM agent_message WHERE agent_id = $2 \
         RETURNING *",
    )
    .bind(new.organization_id)
    .bind(&new.agent_id)
    .bind(new.role)
    .bind(new.kind)
    .bind(&new.content)
    .bind(&new.extra)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to append message for agent {}", new.agent_id))?;

    Ok(message)
}

/// Current maximum `message_num` for an agent (0 when the log is empty).
pub async fn max_message_num(pool: &PgPool, agent_id: &str) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(
        "SELECT COALESCE(MAX(message_num), 0) FROM agent_message WHERE agent_id = $1",
    )
    .bind(agent_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to get max message_num for agent {agent_id}"))?;

    Ok(row.0)
}

/// List messages for an agent in `message_num` order.
pub async fn list_for_agent(
    pool: &PgPool,
    organization_id: Uuid,
    agent_id: &str,
    limit: i64,
) -> Result<Vec<AgentMessage>> {
    let messages = sqlx::query_as::<_, AgentMessage>(
        "SELECT * FROM agent_message \
         WHERE organization_id = $1 AND agent_id = $2 \
         ORDER BY message_num ASC \
         LIMIT $3",
    )
    .bind(organization_id)
    .bind(agent_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list messages for agent {agent_id}"))?;

    Ok(messages)
}

//! Database query functions for the `agent_state` table -- ephemeral
//! heartbeat and usage data for running agents.
//!
//! This table exists so the heartbeat loop never touches the graph; the
//! graph is reserved for meaningful state changes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::AgentState;

/// Upsert the heartbeat row for an agent.
pub async fn upsert_heartbeat(
    pool: &PgPool,
    agent_id: &str,
    organization_id: Uuid,
    status: &str,
    tokens_used: i64,
    cost_usd: f64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO agent_state \
             (agent_id, organization_id, status, tokens_used, cost_usd, last_heartbeat, updated_at) \
         VALUES ($1, $2, $3, $4, $5, NOW(), NOW()) \
         ON CONFLICT (agent_id) DO UPDATE \
         SET status = EXCLUDED.status, \
             tokens_used = EXCLUDED.tokens_used, \
             cost_usd = EXCLUDED.cost_usd, \
             last_heartbeat = NOW(), \
             updated_at = NOW()",
    )
    .bind(agent_id)
    .bind(organization_id)
    .bind(status)
    .bind(tokens_used)
    .bind(cost_usd)
    .execute(pool)
    .await
    .with_context(|| format!("failed to upsert heartbeat for agent {agent_id}"))?;

    Ok(())
}

/// Fetch the operational state for an agent.
pub async fn get_state(pool: &PgPool, agent_id: &str) -> Result<Option<AgentState>> {
    let state = sqlx::query_as::<_, AgentState>("SELECT * FROM agent_state WHERE agent_id = $1")
        .bind(agent_id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch state for agent {agent_id}"))?;

    Ok(state)
}

/// Agents whose last heartbeat predates the cutoff and whose status still
/// reads as live. Used by the health loop.
pub async fn list_stale(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<AgentState>> {
    let stale = sqlx::query_as::<_, AgentState>(
        "SELECT * FROM agent_state \
         WHERE last_heartbeat IS NOT NULL \
           AND last_heartbeat < $1 \
           AND status NOT IN ('completed', 'failed', 'terminated')",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list stale agent states")?;

    Ok(stale)
}

/// Overwrite the status column (used when the health loop marks an agent
/// failed).
pub async fn set_status(pool: &PgPool, agent_id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE agent_state SET status = $1, updated_at = NOW() WHERE agent_id = $2")
        .bind(status)
        .bind(agent_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to set status for agent {agent_id}"))?;

    Ok(())
}

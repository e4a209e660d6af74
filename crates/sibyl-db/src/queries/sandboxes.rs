//! Database query functions for the `sandbox` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Sandbox, SandboxStatus};

/// Insert a new sandbox row. Returns the inserted row with server-generated
/// defaults (id, status, timestamps).
pub async fn insert_sandbox(
    pool: &PgPool,
    organization_id: Uuid,
    user_id: Uuid,
    context: &serde_json::Value,
) -> Result<Sandbox> {
    let sandbox = sqlx::query_as::<_, Sandbox>(
        "INSERT INTO sandbox (organization_id, user_id, context) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(organization_id)
    .bind(user_id)
    .bind(context)
    .fetch_one(pool)
    .await
    .context("failed to insert sandbox")?;

    Ok(sandbox)
}

/// Fetch a single sandbox by ID, scoped to an organization.
pub async fn get_sandbox(
    pool: &PgPool,
    id: Uuid,
    organization_id: Uuid,
) -> Result<Option<Sandbox>> {
    let sandbox = sqlx::query_as::<_, Sandbox>(
        "SELECT * FROM sandbox WHERE id = $1 AND organization_id = $2",
    )
    .bind(id)
    .bind(organization_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch sandbox")?;

    Ok(sandbox)
}

/// List all sandboxes for an (org, user) pair, most recently updated first.
pub async fn list_for_user(
    pool: &PgPool,
    organization_id: Uuid,
    user_id: Uuid,
) -> Result<Vec<Sandbox>> {
    let sandboxes = sqlx::query_as::<_, Sandbox>(
        "SELECT * FROM sandbox \
         WHERE organization_id = $1 AND user_id = $2 \
         ORDER BY updated_at DESC",
    )
    .bind(organization_id)
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list sandboxes for user")?;

    Ok(sandboxes)
}

/// List sandboxes in active or error states across all tenants, for the
/// reconcile loop.
pub async fn list_reconcilable(pool: &PgPool) -> Result<Vec<Sandbox>> {
    let sandboxes = sqlx::query_as::<_, Sandbox>(
        "SELECT * FROM sandbox \
         WHERE status IN ('creating', 'resuming', 'running', 'ready', 'error') \
         ORDER BY updated_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list reconcilable sandboxes")?;

    Ok(sandboxes)
}

/// Update a sandbox status, bumping `updated_at`.
pub async fn update_status(
    pool: &PgPool,
    id: Uuid,
    status: SandboxStatus,
    last_error: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sandbox \
         SET status = $1, last_error = $2, updated_at = NOW() \
         WHERE id = $3 AND status != 'destroyed'",
    )
    .bind(status)
    .bind(last_error)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update sandbox status")?;

    Ok(result.rows_affected())
}

/// Record the pod name provisioned for a sandbox.
pub async fn set_pod_name(pool: &PgPool, id: Uuid, pod_name: &str) -> Result<()> {
    sqlx::query("UPDATE sandbox SET pod_name = $1, updated_at = NOW() WHERE id = $2")
        .bind(pod_name)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set sandbox pod name")?;

    Ok(())
}

/// Record the runner connection for a sandbox.
pub async fn set_runner(pool: &PgPool, id: Uuid, runner_id: Option<Uuid>) -> Result<()> {
    sqlx::query("UPDATE sandbox SET runner_id = $1, updated_at = NOW() WHERE id = $2")
        .bind(runner_id)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set sandbox runner")?;

    Ok(())
}

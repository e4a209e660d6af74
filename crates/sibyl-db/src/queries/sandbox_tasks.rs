//! Database query functions for the `sandbox_task` table -- the durable
//! dispatch queue.
//!
//! Dispatch and reaping run inside a caller-held transaction with
//! `FOR UPDATE SKIP LOCKED` so concurrent dispatchers never hand the same
//! row to two runners. Terminal transitions (`completed`, `failed`,
//! `canceled`) are one-shot: every terminal UPDATE carries a
//! `status NOT IN (...)` guard, so a terminal row can never revert.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::{SandboxTask, SandboxTaskStatus};

/// Parameters for inserting a new sandbox task row.
#[derive(Debug, Clone)]
pub struct NewSandboxTask {
    pub organization_id: Uuid,
    pub sandbox_id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub idempotency_key: Option<String>,
}

/// Insert a new sandbox task row in `queued` status.
pub async fn insert_task(conn: &mut PgConnection, new: &NewSandboxTask) -> Result<SandboxTask> {
    let task = sqlx::query_as::<_, SandboxTask>(
        "INSERT INTO sandbox_task \
             (organization_id, sandbox_id, task_type, payload, max_attempts, idempotency_key) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.organization_id)
    .bind(new.sandbox_id)
    .bind(&new.task_type)
    .bind(&new.payload)
    .bind(new.max_attempts)
    .bind(new.idempotency_key.as_deref())
    .fetch_one(conn)
    .await
    .context("failed to insert sandbox task")?;

    Ok(task)
}

/// Find a live (queued/retry/dispatched/acked) task with the same
/// idempotency key for the same org + sandbox.
pub async fn find_live_by_idempotency_key(
    conn: &mut PgConnection,
    organization_id: Uuid,
    sandbox_id: Uuid,
    idempotency_key: &str,
) -> Result<Option<SandboxTask>> {
    let task = sqlx::query_as::<_, SandboxTask>(
        "SELECT * FROM sandbox_task \
         WHERE organization_id = $1 \
           AND sandbox_id = $2 \
           AND idempotency_key = $3 \
           AND status IN ('queued', 'retry', 'dispatched', 'acked') \
         LIMIT 1",
    )
    .bind(organization_id)
    .bind(sandbox_id)
    .bind(idempotency_key)
    .fetch_optional(conn)
    .await
    .context("failed to look up sandbox task by idempotency key")?;

    Ok(task)
}

/// Fetch a single task by ID, scoped to an organization.
pub async fn get_task(
    pool: &PgPool,
    id: Uuid,
    organization_id: Uuid,
) -> Result<Option<SandboxTask>> {
    let task = sqlx::query_as::<_, SandboxTask>(
        "SELECT * FROM sandbox_task WHERE id = $1 AND organization_id = $2",
    )
    .bind(id)
    .bind(organization_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch sandbox task")?;

    Ok(task)
}

/// Lock up to `limit` pending (queued/retry) tasks for a sandbox, oldest
/// first, skipping rows already locked by a concurrent dispatcher.
///
/// Must run inside a transaction; the locks are released at commit.
pub async fn lock_pending_for_sandbox(
    conn: &mut PgConnection,
    sandbox_id: Uuid,
    limit: i64,
) -> Result<Vec<SandboxTask>> {
    let tasks = sqlx::query_as::<_, SandboxTask>(
        "SELECT * FROM sandbox_task \
         WHERE sandbox_id = $1 AND status IN ('queued', 'retry') \
         ORDER BY created_at ASC \
         LIMIT $2 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(sandbox_id)
    .bind(limit)
    .fetch_all(conn)
    .await
    .context("failed to lock pending sandbox tasks")?;

    Ok(tasks)
}

/// Mark a locked task dispatched: bump the attempt counter, stamp
/// `last_dispatch_at`, and record the runner.
///
/// The attempt counter increments here and nowhere else.
pub async fn mark_dispatched(
    conn: &mut PgConnection,
    id: Uuid,
    runner_id: Option<Uuid>,
) -> Result<SandboxTask> {
    let task = sqlx::query_as::<_, SandboxTask>(
        "UPDATE sandbox_task \
         SET status = 'dispatched', \
             attempt_count = attempt_count + 1, \
             last_dispatch_at = NOW(), \
             runner_id = COALESCE($2, runner_id), \
             error_message = NULL \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .bind(runner_id)
    .fetch_one(conn)
    .await
    .context("failed to mark sandbox task dispatched")?;

    Ok(task)
}

/// Record a failed send attempt on a locked task. Still counts the attempt
/// and stamps `last_dispatch_at`; the row goes to `retry` or terminally to
/// `failed` depending on the attempt budget.
pub async fn mark_send_failed(
    conn: &mut PgConnection,
    id: Uuid,
    terminal: bool,
) -> Result<SandboxTask> {
    let (status, error) = if terminal {
        ("failed", "dispatch_failed_max_attempts")
    } else {
        ("retry", "dispatch_failed_retrying")
    };

    let task = sqlx::query_as::<_, SandboxTask>(
        "UPDATE sandbox_task \
         SET status = $2, \
             attempt_count = attempt_count + 1, \
             last_dispatch_at = NOW(), \
             error_message = $3, \
             failed_at = CASE WHEN $2 = 'failed' THEN NOW() ELSE failed_at END \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .bind(status)
    .bind(error)
    .fetch_one(conn)
    .await
    .context("failed to mark sandbox task send failure")?;

    Ok(task)
}

/// Fail a locked task that has already exhausted its attempt budget before
/// any send was attempted.
pub async fn mark_exhausted(conn: &mut PgConnection, id: Uuid) -> Result<SandboxTask> {
    let task = sqlx::query_as::<_, SandboxTask>(
        "UPDATE sandbox_task \
         SET status = 'failed', \
             error_message = 'max_attempts_exceeded', \
             failed_at = NOW() \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .fetch_one(conn)
    .await
    .context("failed to mark sandbox task exhausted")?;

    Ok(task)
}

/// Acknowledge a dispatched task. Optimistic on the `dispatched` status.
pub async fn ack_task(
    pool: &PgPool,
    id: Uuid,
    organization_id: Uuid,
    runner_id: Option<Uuid>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sandbox_task \
         SET status = 'acked', \
             acked_at = NOW(), \
             runner_id = COALESCE($3, runner_id) \
         WHERE id = $1 AND organization_id = $2 AND status = 'dispatched'",
    )
    .bind(id)
    .bind(organization_id)
    .bind(runner_id)
    .execute(pool)
    .await
    .context("failed to ack sandbox task")?;

    Ok(result.rows_affected())
}

/// Terminal completion outcome for [`complete_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Completed,
    Retry,
    Failed,
    Canceled,
}

/// Complete a task with the given outcome. The guard excludes already
/// terminal rows, so completed/failed/canceled never revert.
pub async fn complete_task(
    pool: &PgPool,
    id: Uuid,
    organization_id: Uuid,
    outcome: CompletionOutcome,
    result_payload: Option<&serde_json::Value>,
    error: Option<&str>,
) -> Result<Option<SandboxTask>> {
    let status = match outcome {
        CompletionOutcome::Completed => SandboxTaskStatus::Completed,
        CompletionOutcome::Retry => SandboxTaskStatus::Retry,
        CompletionOutcome::Failed => SandboxTaskStatus::Failed,
        CompletionOutcome::Canceled => SandboxTaskStatus::Canceled,
    };

    let task = sqlx::query_as::<_, SandboxTask>(
        "UPDATE sandbox_task \
         SET status = $3, \
             result = COALESCE($4, result), \
             error_message = $5, \
             completed_at = CASE WHEN $3 IN ('completed', 'canceled') THEN NOW() ELSE completed_at END, \
             failed_at = CASE WHEN $3 = 'failed' THEN NOW() ELSE failed_at END \
         WHERE id = $1 AND organization_id = $2 \
           AND status NOT IN ('completed', 'failed', 'canceled') \
         RETURNING *",
    )
    .bind(id)
    .bind(organization_id)
    .bind(status)
    .bind(result_payload)
    .bind(error)
    .fetch_optional(pool)
    .await
    .context("failed to complete sandbox task")?;

    Ok(task)
}

/// Lock stale rows for the reaper: `dispatched` past the dispatch cutoff,
/// or `acked` past the (much longer) ack cutoff.
pub async fn lock_stale(
    conn: &mut PgConnection,
    dispatch_cutoff: DateTime<Utc>,
    ack_cutoff: DateTime<Utc>,
) -> Result<Vec<SandboxTask>> {
    let tasks = sqlx::query_as::<_, SandboxTask>(
        "SELECT * FROM sandbox_task \
         WHERE (status = 'dispatched' AND last_dispatch_at < $1) \
            OR (status = 'acked' AND last_dispatch_at < $2) \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(dispatch_cutoff)
    .bind(ack_cutoff)
    .fetch_all(conn)
    .await
    .context("failed to lock stale sandbox tasks")?;

    Ok(tasks)
}

/// Requeue or terminally fail a locked stale task per its attempt budget.
pub async fn reap_task(conn: &mut PgConnection, id: Uuid, terminal: bool) -> Result<SandboxTask> {
    let (status, error) = if terminal {
        ("failed", "lease_expired_max_attempts")
    } else {
        ("retry", "lease_expired_requeued")
    };

    let task = sqlx::query_as::<_, SandboxTask>(
        "UPDATE sandbox_task \
         SET status = $2, \
             error_message = $3, \
             failed_at = CASE WHEN $2 = 'failed' THEN NOW() ELSE failed_at END \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .bind(status)
    .bind(error)
    .fetch_one(conn)
    .await
    .context("failed to reap sandbox task")?;

    Ok(task)
}

/// Fail every live task for a tenant. Used for tenant rollback.
pub async fn fail_all_pending(pool: &PgPool, organization_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sandbox_task \
         SET status = 'failed', \
             error_message = 'admin_rollback', \
             failed_at = NOW() \
         WHERE organization_id = $1 \
           AND status IN ('queued', 'retry', 'dispatched', 'acked')",
    )
    .bind(organization_id)
    .execute(pool)
    .await
    .context("failed to drain pending sandbox tasks")?;

    Ok(result.rows_affected())
}

/// List tasks for a sandbox, oldest first.
pub async fn list_for_sandbox(
    pool: &PgPool,
    sandbox_id: Uuid,
    organization_id: Uuid,
) -> Result<Vec<SandboxTask>> {
    let tasks = sqlx::query_as::<_, SandboxTask>(
        "SELECT * FROM sandbox_task \
         WHERE sandbox_id = $1 AND organization_id = $2 \
         ORDER BY created_at ASC",
    )
    .bind(sandbox_id)
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to list sandbox tasks")?;

    Ok(tasks)
}

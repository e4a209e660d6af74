//! Durable sandbox task dispatcher.
//!
//! Queue state machine over the `sandbox_task` table:
//!
//! ```text
//! enqueue → queued ──dispatch──▶ dispatched ──ack──▶ acked
//!                     │                                 │
//!                     └─send-failed──▶ retry            ├─complete(success)──▶ completed
//!                                        │              ├─complete(fail,retryable,r<max) ─▶ retry
//!                                        │              ├─complete(fail,else)──▶ failed
//!                     reap stale────────▶ retry|failed  └─complete(canceled)──▶ canceled
//! ```
//!
//! Dispatch is a transactional skip-locked select ordered by
//! `created_at asc`; the attempt counter increases only at dispatch time,
//! and terminal transitions are one-shot.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use sibyl_db::models::SandboxTask;
use sibyl_db::queries::sandbox_tasks::{self, CompletionOutcome, NewSandboxTask};

use crate::error::SibylError;

/// Default attempt budget per task.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
/// Lease TTL for dispatched-but-unacked tasks.
pub const DISPATCH_TTL: Duration = Duration::from_secs(300);
/// Lease TTL for acked-but-uncompleted tasks (may be legitimately running).
pub const ACK_TTL: Duration = Duration::from_secs(1800);

/// Parameters for [`SandboxDispatcher::enqueue_task`].
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub organization_id: Uuid,
    pub sandbox_id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
}

impl EnqueueRequest {
    pub fn new(organization_id: Uuid, sandbox_id: Uuid) -> Self {
        Self {
            organization_id,
            sandbox_id,
            task_type: "agent_execution".to_owned(),
            payload: serde_json::json!({}),
            idempotency_key: None,
        }
    }
}

/// Terminal report for [`SandboxDispatcher::complete_task`].
#[derive(Debug, Clone, Default)]
pub struct CompletionReport {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retryable: bool,
    pub canceled: bool,
}

/// DB-backed sandbox task queue with retry/fail semantics.
pub struct SandboxDispatcher {
    pool: PgPool,
    enabled: bool,
    max_attempts: i32,
}

impl SandboxDispatcher {
    pub fn new(pool: PgPool, enabled: bool, max_attempts: Option<i32>) -> Self {
        Self {
            pool,
            enabled,
            max_attempts: max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        }
    }

    fn require_enabled(&self) -> Result<()> {
        if !self.enabled {
            return Err(SibylError::Permanent("sandbox dispatcher is disabled".to_owned()).into());
        }
        Ok(())
    }

    /// Enqueue a durable task. Idempotent on
    /// `(org, sandbox, idempotency_key)` across live statuses.
    pub async fn enqueue_task(&self, req: EnqueueRequest) -> Result<SandboxTask> {
        self.require_enabled()?;

        let mut tx = self.pool.begin().await.context("failed to open transaction")?;

        if let Some(key) = &req.idempotency_key {
            if let Some(existing) = sandbox_tasks::find_live_by_idempotency_key(
                tx.as_mut(),
                req.organization_id,
                req.sandbox_id,
                key,
            )
            .await?
            {
                tx.commit().await?;
                return Ok(existing);
            }
        }

        let task = sandbox_tasks::insert_task(
            tx.as_mut(),
            &NewSandboxTask {
                organization_id: req.organization_id,
                sandbox_id: req.sandbox_id,
                task_type: req.task_type.clone(),
                payload: req.payload.clone(),
                max_attempts: self.max_attempts,
                idempotency_key: req.idempotency_key.clone(),
            },
        )
        .await?;
        tx.commit().await?;

        info!(
            sandbox_id = %req.sandbox_id,
            task_id = %task.id,
            task_type = %req.task_type,
            "sandbox task enqueued"
        );
        Ok(task)
    }

    /// Dispatch queued/retry tasks for a sandbox to a connected runner.
    ///
    /// `send_fn` delivers one `task_assign` message; returning `false`
    /// counts as a failed send. Returns the number dispatched.
    pub async fn dispatch_pending_for_sandbox<F, Fut>(
        &self,
        sandbox_id: Uuid,
        runner_id: Option<Uuid>,
        limit: i64,
        mut send_fn: F,
    ) -> Result<usize>
    where
        F: FnMut(serde_json::Value) -> Fut,
        Fut: Future<Output = bool>,
    {
        self.require_enabled()?;

        let mut tx = self.pool.begin().await.context("failed to open transaction")?;
        let tasks = sandbox_tasks::lock_pending_for_sandbox(tx.as_mut(), sandbox_id, limit).await?;

        let mut dispatched = 0usize;
        for task in &tasks {
            if task.attempt_count >= task.max_attempts {
                sandbox_tasks::mark_exhausted(tx.as_mut(), task.id).await?;
                continue;
            }

            let mut message = task.payload.clone();
            if let Some(object) = message.as_object_mut() {
                object.insert(
                    "type".to_owned(),
                    serde_json::Value::String("task_assign".to_owned()),
                );
                object.insert(
                    "task_id".to_owned(),
                    serde_json::Value::String(task.id.to_string()),
                );
            }

            let ok = send_fn(message).await;
            if ok {
                sandbox_tasks::mark_dispatched(tx.as_mut(), task.id, runner_id).await?;
                dispatched += 1;
            } else {
                let terminal = task.attempt_count + 1 >= task.max_attempts;
                sandbox_tasks::mark_send_failed(tx.as_mut(), task.id, terminal).await?;
            }
        }

        tx.commit().await?;

        if dispatched > 0 {
            info!(sandbox_id = %sandbox_id, count = dispatched, "sandbox tasks dispatched");
        }
        Ok(dispatched)
    }

    /// Acknowledge a dispatched task.
    pub async fn ack_task(
        &self,
        task_id: Uuid,
        organization_id: Uuid,
        runner_id: Option<Uuid>,
    ) -> Result<SandboxTask> {
        self.require_enabled()?;

        let rows =
            sandbox_tasks::ack_task(&self.pool, task_id, organization_id, runner_id).await?;
        if rows == 0 {
            // Either the task is missing or it is not in `dispatched`.
            return match sandbox_tasks::get_task(&self.pool, task_id, organization_id).await? {
                None => Err(SibylError::not_found("sandbox task", task_id.to_string()).into()),
                Some(task) => Err(SibylError::Conflict(format!(
                    "cannot ack sandbox task {task_id} in status {}",
                    task.status
                ))
                .into()),
            };
        }

        sandbox_tasks::get_task(&self.pool, task_id, organization_id)
            .await?
            .ok_or_else(|| SibylError::not_found("sandbox task", task_id.to_string()).into())
    }

    /// Report completion, with retry/fail behavior driven by the attempt
    /// budget. Terminal statuses never revert.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        organization_id: Uuid,
        report: CompletionReport,
    ) -> Result<SandboxTask> {
        self.require_enabled()?;

        let task = sandbox_tasks::get_task(&self.pool, task_id, organization_id)
            .await?
            .ok_or_else(|| -> anyhow::Error {
                SibylError::not_found("sandbox task", task_id.to_string()).into()
            })?;

        let outcome = if report.canceled {
            CompletionOutcome::Canceled
        } else if report.success {
            CompletionOutcome::Completed
        } else if report.retryable && task.attempt_count < task.max_attempts {
            CompletionOutcome::Retry
        } else {
            CompletionOutcome::Failed
        };
        let error = if report.success {
            None
        } else {
            Some(
                report
                    .error
                    .clone()
                    .unwrap_or_else(|| "sandbox_task_failed".to_owned()),
            )
        };

        let updated = sandbox_tasks::complete_task(
            &self.pool,
            task_id,
            organization_id,
            outcome,
            report.result.as_ref(),
            error.as_deref(),
        )
        .await?;

        // A `None` here means the task was already terminal; report the
        // stored row unchanged.
        let task = match updated {
            Some(task) => task,
            None => sandbox_tasks::get_task(&self.pool, task_id, organization_id)
                .await?
                .ok_or_else(|| -> anyhow::Error {
                    SibylError::not_found("sandbox task", task_id.to_string()).into()
                })?,
        };

        info!(
            task_id = %task.id,
            status = %task.status,
            success = report.success,
            retryable = report.retryable,
            canceled = report.canceled,
            attempt = task.attempt_count,
            "sandbox task completed"
        );
        Ok(task)
    }

    /// Requeue tasks stuck in `dispatched` past the dispatch TTL, and
    /// `acked` tasks past the (much longer) ack TTL. Returns the number
    /// reaped.
    pub async fn reap_stale_tasks(
        &self,
        dispatch_ttl: Duration,
        ack_ttl: Duration,
    ) -> Result<usize> {
        self.require_enabled()?;

        let now = Utc::now();
        let dispatch_cutoff = now - chrono::Duration::from_std(dispatch_ttl).unwrap_or_default();
        let ack_cutoff = now - chrono::Duration::from_std(ack_ttl).unwrap_or_default();

        let mut tx = self.pool.begin().await.context("failed to open transaction")?;
        let stale = sandbox_tasks::lock_stale(tx.as_mut(), dispatch_cutoff, ack_cutoff).await?;

        let mut reaped = 0usize;
        for task in &stale {
            let terminal = task.attempt_count >= task.max_attempts;
            sandbox_tasks::reap_task(tx.as_mut(), task.id, terminal).await?;
            reaped += 1;
        }
        tx.commit().await?;

        if reaped > 0 {
            info!(count = reaped, "stale sandbox tasks reaped");
        }
        Ok(reaped)
    }

    /// Drain every live task for a tenant (admin rollback).
    pub async fn fail_all_pending(&self, organization_id: Uuid) -> Result<u64> {
        self.require_enabled()?;
        let count = sandbox_tasks::fail_all_pending(&self.pool, organization_id).await?;
        if count > 0 {
            info!(org_id = %organization_id, count, "drained pending sandbox tasks");
        }
        Ok(count)
    }
}

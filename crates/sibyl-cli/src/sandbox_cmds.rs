//! Sandbox command handlers: lifecycle and queue operations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;

use sibyl_core::sandbox::{
    CompletionReport, EnqueueRequest, MemoryPodRuntime, SandboxConfig, SandboxController,
    SandboxDispatcher,
};

use crate::context::RuntimeContext;

fn controller(ctx: &RuntimeContext) -> SandboxController {
    let config = SandboxConfig {
        enabled: ctx.config.sandbox.enabled,
        k8s_required: ctx.config.sandbox.k8s_required,
        namespace: ctx
            .config
            .sandbox
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_owned()),
        image: ctx
            .config
            .sandbox
            .image
            .clone()
            .unwrap_or_else(|| "busybox:1.36".to_owned()),
        ..Default::default()
    };
    // The pod runtime adapter is deployment-specific; the CLI wires the
    // in-process runtime.
    SandboxController::new(
        ctx.pool.clone(),
        Some(Arc::new(MemoryPodRuntime::new())),
        config,
    )
}

fn dispatcher(ctx: &RuntimeContext) -> SandboxDispatcher {
    SandboxDispatcher::new(ctx.pool.clone(), ctx.config.sandbox.enabled, None)
}

pub async fn cmd_ensure(ctx: &RuntimeContext, org_id: Uuid, user_id: Uuid) -> Result<()> {
    let sandbox = controller(ctx).ensure(org_id, user_id, None).await?;
    println!("Sandbox {} status {}", sandbox.id, sandbox.status);
    Ok(())
}

pub async fn cmd_destroy(ctx: &RuntimeContext, org_id: Uuid, sandbox_id: Uuid) -> Result<()> {
    let sandbox = controller(ctx).destroy(sandbox_id, org_id).await?;
    println!("Sandbox {} status {}", sandbox.id, sandbox.status);
    Ok(())
}

pub async fn cmd_logs(
    ctx: &RuntimeContext,
    org_id: Uuid,
    sandbox_id: Uuid,
    tail_lines: u32,
) -> Result<()> {
    let logs = controller(ctx).get_logs(sandbox_id, org_id, tail_lines).await?;
    println!("{logs}");
    Ok(())
}

pub async fn cmd_enqueue(
    ctx: &RuntimeContext,
    org_id: Uuid,
    sandbox_id: Uuid,
    task_type: &str,
    payload: Option<&str>,
    idempotency_key: Option<&str>,
) -> Result<()> {
    let payload = match payload {
        Some(text) => serde_json::from_str(text)?,
        None => serde_json::json!({}),
    };
    let mut req = EnqueueRequest::new(org_id, sandbox_id);
    req.task_type = task_type.to_owned();
    req.payload = payload;
    req.idempotency_key = idempotency_key.map(str::to_owned);

    let task = dispatcher(ctx).enqueue_task(req).await?;
    println!("Enqueued task {} status {}", task.id, task.status);
    Ok(())
}

pub async fn cmd_reap(ctx: &RuntimeContext, dispatch_ttl: u64, ack_ttl: u64) -> Result<()> {
    let reaped = dispatcher(ctx)
        .reap_stale_tasks(Duration::from_secs(dispatch_ttl), Duration::from_secs(ack_ttl))
        .await?;
    println!("Reaped {reaped} stale task(s)");
    Ok(())
}

pub async fn cmd_drain(ctx: &RuntimeContext, org_id: Uuid) -> Result<()> {
    let drained = dispatcher(ctx).fail_all_pending(org_id).await?;
    println!("Drained {drained} pending task(s)");
    Ok(())
}

pub async fn cmd_complete(
    ctx: &RuntimeContext,
    org_id: Uuid,
    task_id: Uuid,
    success: bool,
    error: Option<&str>,
    retryable: bool,
) -> Result<()> {
    let report = CompletionReport {
        success,
        error: error.map(str::to_owned),
        retryable,
        ..Default::default()
    };
    let task = dispatcher(ctx).complete_task(task_id, org_id, report).await?;
    println!("Task {} status {}", task.id, task.status);
    Ok(())
}

//! Approval command handlers: list pending requests and respond to them.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

use sibyl_core::approval::ApprovalQueue;

use crate::context::RuntimeContext;

fn queue_for(ctx: &RuntimeContext, project_id: &str, agent_id: &str) -> ApprovalQueue {
    ApprovalQueue::new(
        ctx.store.clone(),
        Arc::clone(&ctx.bus),
        Some(ctx.pool.clone()),
        project_id,
        agent_id,
        None,
    )
}

/// List pending approvals for an agent.
pub async fn cmd_list(ctx: &RuntimeContext, project_id: &str, agent_id: &str) -> Result<()> {
    let queue = queue_for(ctx, project_id, agent_id);
    let pending = queue.list_pending().await?;

    if pending.is_empty() {
        println!("No pending approvals for {agent_id}");
        return Ok(());
    }

    for approval in &pending {
        let id = approval.get("id").and_then(Value::as_str).unwrap_or("?");
        let title = approval.get("title").and_then(Value::as_str).unwrap_or("");
        let expires = approval
            .get("expires_at")
            .and_then(Value::as_str)
            .unwrap_or("");
        println!("{id}  {title}  (expires {expires})");
    }
    Ok(())
}

/// Respond to a pending approval.
pub async fn cmd_respond(
    ctx: &RuntimeContext,
    project_id: &str,
    agent_id: &str,
    approval_id: &str,
    approve: bool,
    message: Option<&str>,
    by: &str,
) -> Result<()> {
    let queue = queue_for(ctx, project_id, agent_id);
    queue
        .respond(approval_id, approve, message.unwrap_or(""), by)
        .await?;
    println!(
        "{} approval {approval_id}",
        if approve { "Approved" } else { "Denied" }
    );
    Ok(())
}

/// Expire stale approvals for an agent.
pub async fn cmd_expire(ctx: &RuntimeContext, project_id: &str, agent_id: &str) -> Result<()> {
    let queue = queue_for(ctx, project_id, agent_id);
    let expired = queue.expire_stale().await?;
    println!("Expired {expired} stale approval(s)");
    Ok(())
}

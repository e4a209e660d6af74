//! Sprint command handlers: queue, start, pause, resume, budget, status.

use anyhow::Result;
use serde_json::Value;

use sibyl_core::entity::records::{SprintStrategy, Task, TaskPriority};
use sibyl_core::orchestrator::task::COMPLETION_CHANNEL;

use crate::context::RuntimeContext;

/// Create a task entity and print its id.
pub async fn cmd_task_create(
    ctx: &RuntimeContext,
    project_id: &str,
    name: &str,
    description: Option<&str>,
    priority: &str,
    estimated_cost: Option<f64>,
) -> Result<()> {
    let task_id = format!("task_{}", &uuid::Uuid::new_v4().simple().to_string()[..16]);
    let mut task = Task::new(&task_id, name, ctx.store.org_id(), project_id);
    task.description = description.unwrap_or_default().to_owned();
    task.priority = priority.parse().unwrap_or(TaskPriority::Medium);
    task.estimated_cost_usd = estimated_cost;

    ctx.store.create_sync(task.into_entity()).await?;
    println!("Created task {task_id}");
    Ok(())
}

/// Queue tasks onto the project's meta orchestrator.
pub async fn cmd_queue(ctx: &RuntimeContext, task_ids: &[String]) -> Result<()> {
    let meta = ctx.meta_service.get_or_create().await?;
    let updated = ctx.meta_service.queue_tasks(&meta.id, task_ids).await?;
    println!(
        "Queued {} task(s); queue size is now {}",
        task_ids.len(),
        updated.task_queue.len()
    );
    Ok(())
}

/// Start the sprint and supervise it until the queue drains.
///
/// This process drives the whole loop: it starts each spawned task
/// orchestrator, waits for completion notices on the bus, and feeds them
/// back into the meta tier.
pub async fn cmd_start(ctx: &RuntimeContext) -> Result<()> {
    let meta = ctx.meta_service.get_or_create().await?;
    let mut sub = ctx.bus.subscribe(COMPLETION_CHANNEL).await?;
    let record = ctx.meta_service.start(&meta.id, None).await?;
    println!(
        "Sprint started: {} queued, {} active, strategy {}",
        record.task_queue.len(),
        record.active_orchestrators.len(),
        record.strategy
    );

    // Start every newly spawned orchestrator, drive its worker session in
    // the background, then wait for completion notices.
    loop {
        let record = ctx.meta_service.get(&meta.id).await?;
        for orch_id in &record.active_orchestrators {
            let orch = ctx.task_service.get(orch_id).await?;
            if orch.status == sibyl_core::entity::records::OrchestratorStatus::Initializing {
                match ctx.task_service.start(orch_id).await {
                    Ok(worker) => {
                        println!("  started {} (worker {})", orch_id, worker.id());
                        let task_entity = ctx.store.get(&orch.task_id).await?;
                        let task = Task::from_entity(&task_entity)?;
                        let prompt =
                            sibyl_core::orchestrator::TaskOrchestratorService::worker_prompt(
                                &task, &orch,
                            );
                        let task_service = std::sync::Arc::clone(&ctx.task_service);
                        let orch_id = orch_id.clone();
                        tokio::spawn(async move {
                            use futures::StreamExt;
                            use sibyl_core::entity::records::OrchestratorStatus;

                            match worker.execute(&prompt).await {
                                Ok(mut stream) => {
                                    while stream.next().await.is_some() {}
                                    // Review, and keep reviewing after each
                                    // rework round-trip (the feedback send
                                    // drains the worker's rework session).
                                    loop {
                                        match task_service.on_worker_complete(&orch_id).await {
                                            Ok(record)
                                                if record.status
                                                    == OrchestratorStatus::Reworking => {}
                                            Ok(_) => break,
                                            Err(e) => {
                                                eprintln!(
                                                    "  review of {orch_id} failed: {e:#}"
                                                );
                                                break;
                                            }
                                        }
                                    }
                                }
                                Err(e) => {
                                    eprintln!("  worker for {orch_id} failed to start: {e:#}");
                                }
                            }
                        });
                    }
                    Err(e) => eprintln!("  failed to start {orch_id}: {e:#}"),
                }
            }
        }

        let record = ctx.meta_service.get(&meta.id).await?;
        if record.active_orchestrators.is_empty() && record.task_queue.is_empty() {
            println!("Sprint complete.");
            return Ok(());
        }
        if record.status == sibyl_core::entity::records::MetaStatus::Paused {
            println!("Sprint paused.");
            return Ok(());
        }

        // Block on the next completion notice.
        let Some(payload) = sub.recv().await else {
            anyhow::bail!("completion channel closed");
        };
        let notice: Value = serde_json::from_str(&payload)?;
        let orch_id = notice
            .get("task_orchestrator_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let success = notice.get("success").and_then(Value::as_bool).unwrap_or(false);
        let cost = notice.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0);
        let rework = notice
            .get("rework_cycles")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        ctx.meta_service
            .on_task_complete(&meta.id, &orch_id, success, cost, rework)
            .await?;
        println!("  {} {}", orch_id, if success { "completed" } else { "failed" });
    }
}

pub async fn cmd_pause(ctx: &RuntimeContext, reason: &str) -> Result<()> {
    let meta = ctx.meta_service.get_or_create().await?;
    ctx.meta_service.pause(&meta.id, reason).await?;
    println!("Sprint paused: {reason}");
    Ok(())
}

pub async fn cmd_resume(ctx: &RuntimeContext) -> Result<()> {
    let meta = ctx.meta_service.get_or_create().await?;
    ctx.meta_service.resume(&meta.id).await?;
    println!("Sprint resumed");
    Ok(())
}

pub async fn cmd_strategy(
    ctx: &RuntimeContext,
    strategy: &str,
    max_concurrent: Option<u32>,
) -> Result<()> {
    let strategy: SprintStrategy = strategy.parse()?;
    let meta = ctx.meta_service.get_or_create().await?;
    ctx.meta_service
        .set_strategy(&meta.id, strategy, max_concurrent)
        .await?;
    println!("Strategy set to {strategy}");
    Ok(())
}

pub async fn cmd_budget(ctx: &RuntimeContext, budget_usd: f64, alert_threshold: f64) -> Result<()> {
    let meta = ctx.meta_service.get_or_create().await?;
    ctx.meta_service
        .set_budget(&meta.id, budget_usd, alert_threshold)
        .await?;
    println!("Budget set to ${budget_usd:.2} (alert at {:.0}%)", alert_threshold * 100.0);
    Ok(())
}

pub async fn cmd_status(ctx: &RuntimeContext) -> Result<()> {
    let meta = ctx.meta_service.get_or_create().await?;
    let status = ctx.meta_service.get_status(&meta.id).await?;
    println!("Sprint {}", status.id);
    println!("  status:      {}", status.status);
    println!("  strategy:    {}", status.strategy);
    println!("  queue:       {}", status.queue_size);
    println!("  active:      {}", status.active_count);
    println!("  completed:   {}", status.tasks_completed);
    println!("  failed:      {}", status.tasks_failed);
    println!("  rework:      {}", status.total_rework_cycles);
    println!(
        "  budget:      ${:.2} spent of ${:.2} ({:.0}%)",
        status.spent_usd,
        status.budget_usd,
        status.budget_utilization * 100.0
    );
    Ok(())
}

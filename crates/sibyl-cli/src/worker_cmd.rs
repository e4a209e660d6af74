//! The worker process: job queue consumer plus the periodic loops.
//!
//! One worker runs the job loop, the sandbox task reaper, the sandbox
//! reconcile loop, and the agent health monitor, all under a single
//! cancellation token wired to ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sibyl_core::health::HealthMonitor;
use sibyl_core::jobs;
use sibyl_core::sandbox::dispatcher::{ACK_TTL, DISPATCH_TTL};
use sibyl_core::sandbox::{
    MemoryPodRuntime, SandboxConfig, SandboxController, SandboxDispatcher,
};

use crate::context::RuntimeContext;

/// How often the reaper scans for expired leases.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Run the worker until ctrl-c.
pub async fn cmd_worker(ctx: &RuntimeContext) -> Result<()> {
    let cancel = CancellationToken::new();

    // ctrl-c -> cancellation.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    let mut handles = Vec::new();

    // 1. Job loop.
    {
        let job_ctx = ctx.job_context();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            jobs::run_worker(job_ctx, cancel).await;
        }));
    }

    // 2. Sandbox lease reaper.
    if ctx.config.sandbox.enabled {
        let dispatcher = SandboxDispatcher::new(ctx.pool.clone(), true, None);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAPER_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = dispatcher.reap_stale_tasks(DISPATCH_TTL, ACK_TTL).await {
                            warn!(error = %e, "reaper pass failed");
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        }));
    }

    // 3. Sandbox reconcile loop.
    if ctx.config.sandbox.enabled {
        let controller = SandboxController::new(
            ctx.pool.clone(),
            Some(Arc::new(MemoryPodRuntime::new())),
            SandboxConfig {
                enabled: true,
                k8s_required: ctx.config.sandbox.k8s_required,
                ..Default::default()
            },
        );
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            controller.run_reconcile_loop(cancel).await;
        }));
    }

    // 4. Agent health monitor.
    {
        let monitor = HealthMonitor::new(ctx.pool.clone(), ctx.store.clone());
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            monitor.run(cancel).await;
        }));
    }

    info!("worker running; press ctrl-c to stop");
    for handle in handles {
        let _ = handle.await;
    }
    info!("worker stopped");
    Ok(())
}

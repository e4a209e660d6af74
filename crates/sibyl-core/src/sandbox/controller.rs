//! Sandbox control plane: lifecycle and reconciliation.
//!
//! The sandbox feature can be disabled entirely; the pod runtime is
//! optional and, unless `k8s_required` is set, its absence degrades to
//! `status=error` with a recorded reason instead of failing the
//! operation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use sibyl_db::models::{Sandbox, SandboxStatus};
use sibyl_db::queries::sandboxes;

use crate::error::SibylError;

use super::runtime::{PodPhase, PodRuntime, PodSpec};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Master feature gate; every mutating op fails cleanly when off.
    pub enabled: bool,
    pub namespace: String,
    pub pod_prefix: String,
    pub image: String,
    /// How often the reconcile loop scans.
    pub reconcile_interval: Duration,
    /// When set, pod-runtime unavailability is a hard error instead of a
    /// recorded `status=error`.
    pub k8s_required: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "default".to_owned(),
            pod_prefix: "sibyl-sandbox".to_owned(),
            image: "busybox:1.36".to_owned(),
            reconcile_interval: Duration::from_secs(20),
            k8s_required: false,
        }
    }
}

/// Create/suspend/resume/destroy tenant sandboxes with reconciliation.
pub struct SandboxController {
    pool: PgPool,
    runtime: Option<Arc<dyn PodRuntime>>,
    config: SandboxConfig,
}

impl SandboxController {
    pub fn new(
        pool: PgPool,
        runtime: Option<Arc<dyn PodRuntime>>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            pool,
            runtime,
            config,
        }
    }

    fn require_enabled(&self) -> Result<()> {
        if !self.config.enabled {
            return Err(SibylError::Permanent(
                "sandbox feature is disabled (set sandbox.enabled)".to_owned(),
            )
            .into());
        }
        Ok(())
    }

    fn pod_name_for(&self, sandbox_id: Uuid) -> String {
        let sid = sandbox_id.simple().to_string();
        format!("{}-{}", self.config.pod_prefix, &sid[..24]).to_lowercase()
    }

    fn pod_spec(&self, pod_name: &str, sandbox: &Sandbox) -> PodSpec {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_owned(), "sibyl-sandbox".to_owned());
        labels.insert("sandbox_id".to_owned(), sandbox.id.to_string());
        labels.insert(
            "organization_id".to_owned(),
            sandbox.organization_id.to_string(),
        );
        PodSpec {
            name: pod_name.to_owned(),
            labels,
            image: self.config.image.clone(),
            command: vec!["sh".to_owned(), "-c".to_owned(), "sleep infinity".to_owned()],
        }
    }

    /// Make sure the sandbox's pod exists. Returns `true` when a pod is
    /// confirmed present, `false` when the runtime is unavailable and
    /// `k8s_required` is off.
    async fn ensure_pod(&self, sandbox: &Sandbox) -> Result<bool> {
        let Some(runtime) = &self.runtime else {
            if self.config.k8s_required {
                return Err(SibylError::Permanent(
                    "pod runtime is unavailable and k8s_required is set".to_owned(),
                )
                .into());
            }
            return Ok(false);
        };

        let pod_name = sandbox
            .pod_name
            .clone()
            .unwrap_or_else(|| self.pod_name_for(sandbox.id));
        sandboxes::set_pod_name(&self.pool, sandbox.id, &pod_name).await?;

        if runtime
            .get_pod_phase(&self.config.namespace, &pod_name)
            .await?
            .is_some()
        {
            return Ok(true);
        }

        let spec = self.pod_spec(&pod_name, sandbox);
        match runtime.create_pod(&self.config.namespace, &spec).await {
            Ok(()) => {
                info!(sandbox_id = %sandbox.id, pod_name = %pod_name, "sandbox pod created");
                Ok(true)
            }
            Err(e) => {
                if self.config.k8s_required {
                    return Err(e.context("failed to create sandbox pod"));
                }
                warn!(pod_name = %pod_name, error = %e, "sandbox pod creation failed");
                Ok(false)
            }
        }
    }

    async fn delete_pod_if_exists(&self, pod_name: Option<&str>) -> Result<()> {
        let (Some(runtime), Some(pod_name)) = (&self.runtime, pod_name) else {
            if self.runtime.is_none() && self.config.k8s_required && pod_name.is_some() {
                return Err(SibylError::Permanent(
                    "pod runtime is unavailable and k8s_required is set".to_owned(),
                )
                .into());
            }
            return Ok(());
        };
        runtime
            .delete_pod(&self.config.namespace, pod_name)
            .await
            .with_context(|| format!("failed to delete sandbox pod {pod_name}"))
    }

    async fn get(&self, sandbox_id: Uuid, organization_id: Uuid) -> Result<Sandbox> {
        sandboxes::get_sandbox(&self.pool, sandbox_id, organization_id)
            .await?
            .ok_or_else(|| {
                SibylError::not_found("sandbox", sandbox_id.to_string()).into()
            })
    }

    // -----------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------

    /// Return the most-recently-updated non-terminal sandbox for this
    /// (org, user), resuming a suspended one, or create a fresh sandbox.
    pub async fn ensure(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        context: Option<serde_json::Value>,
    ) -> Result<Sandbox> {
        self.require_enabled()?;

        let sandboxes = sandboxes::list_for_user(&self.pool, organization_id, user_id).await?;
        let candidate = sandboxes.into_iter().find(|s| !s.status.is_terminal());

        match candidate {
            None => self.create(organization_id, user_id, context).await,
            Some(sandbox) if sandbox.status == SandboxStatus::Suspended => {
                self.resume(sandbox.id, organization_id).await
            }
            Some(sandbox) => Ok(sandbox),
        }
    }

    /// Create a sandbox: `creating → running | error`.
    pub async fn create(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        context: Option<serde_json::Value>,
    ) -> Result<Sandbox> {
        self.require_enabled()?;

        let sandbox = sandboxes::insert_sandbox(
            &self.pool,
            organization_id,
            user_id,
            &context.unwrap_or_else(|| serde_json::json!({})),
        )
        .await?;

        let status = match self.ensure_pod(&sandbox).await {
            Ok(true) => SandboxStatus::Running,
            Ok(false) => SandboxStatus::Error,
            Err(e) => {
                sandboxes::update_status(
                    &self.pool,
                    sandbox.id,
                    SandboxStatus::Error,
                    Some(&e.to_string()),
                )
                .await?;
                return Err(e);
            }
        };
        let last_error =
            (status == SandboxStatus::Error).then_some("pod runtime unavailable");
        sandboxes::update_status(&self.pool, sandbox.id, status, last_error).await?;

        info!(sandbox_id = %sandbox.id, status = %status, "sandbox created");
        self.get(sandbox.id, organization_id).await
    }

    /// Resume a suspended sandbox: `resuming → running | error`.
    pub async fn resume(&self, sandbox_id: Uuid, organization_id: Uuid) -> Result<Sandbox> {
        self.require_enabled()?;
        let sandbox = self.get(sandbox_id, organization_id).await?;

        sandboxes::update_status(&self.pool, sandbox_id, SandboxStatus::Resuming, None).await?;

        let status = match self.ensure_pod(&sandbox).await {
            Ok(true) => SandboxStatus::Running,
            Ok(false) => SandboxStatus::Error,
            Err(e) => {
                sandboxes::update_status(
                    &self.pool,
                    sandbox_id,
                    SandboxStatus::Error,
                    Some(&e.to_string()),
                )
                .await?;
                return Err(e);
            }
        };
        let last_error =
            (status == SandboxStatus::Error).then_some("pod runtime unavailable");
        sandboxes::update_status(&self.pool, sandbox_id, status, last_error).await?;

        info!(sandbox_id = %sandbox_id, status = %status, "sandbox resumed");
        self.get(sandbox_id, organization_id).await
    }

    /// Suspend a running sandbox: the pod is deleted; the row survives.
    pub async fn suspend(&self, sandbox_id: Uuid, organization_id: Uuid) -> Result<Sandbox> {
        self.require_enabled()?;
        let sandbox = self.get(sandbox_id, organization_id).await?;

        self.delete_pod_if_exists(sandbox.pod_name.as_deref()).await?;
        sandboxes::update_status(&self.pool, sandbox_id, SandboxStatus::Suspended, None).await?;

        info!(sandbox_id = %sandbox_id, "sandbox suspended");
        self.get(sandbox_id, organization_id).await
    }

    /// Destroy a sandbox: terminal; the pod is removed.
    pub async fn destroy(&self, sandbox_id: Uuid, organization_id: Uuid) -> Result<Sandbox> {
        self.require_enabled()?;
        let sandbox = self.get(sandbox_id, organization_id).await?;

        self.delete_pod_if_exists(sandbox.pod_name.as_deref()).await?;
        sandboxes::update_status(&self.pool, sandbox_id, SandboxStatus::Destroyed, None).await?;

        info!(sandbox_id = %sandbox_id, "sandbox destroyed");
        self.get(sandbox_id, organization_id).await
    }

    /// Record (or clear) the runner connection for a sandbox. A connected
    /// runner moves `running → ready`; disconnecting moves back.
    pub async fn sync_runner_connection(
        &self,
        sandbox_id: Uuid,
        organization_id: Uuid,
        runner_id: Option<Uuid>,
    ) -> Result<Sandbox> {
        self.require_enabled()?;
        let sandbox = self.get(sandbox_id, organization_id).await?;

        sandboxes::set_runner(&self.pool, sandbox_id, runner_id).await?;
        match (runner_id.is_some(), sandbox.status) {
            (true, SandboxStatus::Running) => {
                sandboxes::update_status(&self.pool, sandbox_id, SandboxStatus::Ready, None)
                    .await?;
            }
            (false, SandboxStatus::Ready) => {
                sandboxes::update_status(&self.pool, sandbox_id, SandboxStatus::Running, None)
                    .await?;
            }
            _ => {}
        }

        self.get(sandbox_id, organization_id).await
    }

    /// Read the sandbox pod's logs.
    pub async fn get_logs(
        &self,
        sandbox_id: Uuid,
        organization_id: Uuid,
        tail_lines: u32,
    ) -> Result<String> {
        self.require_enabled()?;
        let sandbox = self.get(sandbox_id, organization_id).await?;

        let Some(runtime) = &self.runtime else {
            return Err(SibylError::Permanent("pod runtime is unavailable".to_owned()).into());
        };
        let Some(pod_name) = &sandbox.pod_name else {
            return Err(SibylError::Permanent(format!(
                "sandbox {sandbox_id} has no runtime pod provisioned"
            ))
            .into());
        };

        runtime
            .pod_logs(&self.config.namespace, pod_name, tail_lines)
            .await
    }

    // -----------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------

    /// One reconcile pass: realign DB status with observed pod phase for
    /// every sandbox in an active or error state. Returns the number of
    /// rows realigned.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let Some(runtime) = &self.runtime else {
            return Ok(0);
        };

        let sandboxes_to_check = sandboxes::list_reconcilable(&self.pool).await?;
        let mut realigned = 0usize;

        for sandbox in &sandboxes_to_check {
            let Some(pod_name) = &sandbox.pod_name else {
                // An active-state sandbox that never got a pod is an error.
                if sandbox.status != SandboxStatus::Error {
                    sandboxes::update_status(
                        &self.pool,
                        sandbox.id,
                        SandboxStatus::Error,
                        Some("no pod provisioned"),
                    )
                    .await?;
                    realigned += 1;
                }
                continue;
            };

            let phase = runtime
                .get_pod_phase(&self.config.namespace, pod_name)
                .await?;
            let desired = match phase {
                Some(PodPhase::Running) => SandboxStatus::Running,
                Some(PodPhase::Pending) => SandboxStatus::Creating,
                Some(PodPhase::Failed | PodPhase::Unknown) => SandboxStatus::Error,
                Some(PodPhase::Succeeded) => SandboxStatus::Error,
                // Missing pod in a should-have-one state.
                None => SandboxStatus::Error,
            };

            // `ready` means a runner is connected on a running pod; a
            // Running phase must not demote it.
            if sandbox.status == SandboxStatus::Ready && desired == SandboxStatus::Running {
                continue;
            }

            if sandbox.status != desired {
                let last_error = (desired == SandboxStatus::Error)
                    .then_some("pod phase drift detected by reconciler");
                sandboxes::update_status(&self.pool, sandbox.id, desired, last_error).await?;
                realigned += 1;
                info!(
                    sandbox_id = %sandbox.id,
                    from = %sandbox.status,
                    to = %desired,
                    "reconciled sandbox status"
                );
            }
        }

        Ok(realigned)
    }

    /// Run the reconcile loop until cancelled.
    pub async fn run_reconcile_loop(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.reconcile_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!(error = %e, "sandbox reconcile pass failed");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("sandbox reconcile loop stopping");
                    return;
                }
            }
        }
    }
}

//! Per-task build loop coordinator (Tier 2).
//!
//! Drives one task through implement → review → rework with bounded
//! rework (the "Ralph Loop" safety cap) and optional human review before
//! completion. Escalation is a state transition plus a QUESTION approval,
//! never a thrown error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::approval::ApprovalQueue;
use crate::bus::KvBus;
use crate::entity::records::{
    ApprovalRecord, ApprovalStatus, ApprovalType, AgentType, OrchestratorPhase,
    OrchestratorStatus, QualityGateType, SpawnSource, Task, TaskOrchestratorRecord, TaskStatus,
    WorktreeRecord,
};
use crate::entity::store::EntityStore;
use crate::entity::{EntityKind, RelationshipType};
use crate::error::SibylError;
use crate::runner::{AgentInstance, AgentRunner, SpawnRequest};

use super::gates::{GateExecutor, GateResult};

/// Default quality gates, in execution order.
pub const DEFAULT_GATES: [QualityGateType; 4] = [
    QualityGateType::Lint,
    QualityGateType::Typecheck,
    QualityGateType::Test,
    QualityGateType::AiReview,
];

/// Default Ralph Loop cap.
pub const DEFAULT_MAX_REWORK: u32 = 3;

/// Pub/sub channel for completion notices consumed by the meta tier.
pub const COMPLETION_CHANNEL: &str = "task_orchestrator_complete";

/// Per-task build loop coordinator.
pub struct TaskOrchestratorService {
    store: EntityStore,
    bus: Arc<dyn KvBus>,
    pool: Option<PgPool>,
    runner: Arc<AgentRunner>,
    gates: Arc<dyn GateExecutor>,
    project_id: String,
}

impl TaskOrchestratorService {
    pub fn new(
        store: EntityStore,
        bus: Arc<dyn KvBus>,
        pool: Option<PgPool>,
        runner: Arc<AgentRunner>,
        gates: Arc<dyn GateExecutor>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bus,
            pool,
            runner,
            gates,
            project_id: project_id.into(),
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Create an orchestrator for a task, linking it to the task
    /// (`WORKS_ON`) and optionally its meta (`MANAGED_BY`).
    pub async fn create(
        &self,
        task: &Task,
        meta_orchestrator_id: Option<&str>,
        gate_config: Option<Vec<QualityGateType>>,
        max_rework_attempts: u32,
    ) -> Result<TaskOrchestratorRecord> {
        let orchestrator_id = format!("taskorch_{}", &Uuid::new_v4().simple().to_string()[..16]);

        let name: String = format!("TaskOrchestrator: {}", task.name)
            .chars()
            .take(70)
            .collect();
        let record = TaskOrchestratorRecord {
            id: orchestrator_id.clone(),
            name,
            organization_id: self.store.org_id().to_owned(),
            project_id: self.project_id.clone(),
            meta_orchestrator_id: meta_orchestrator_id.map(str::to_owned),
            task_id: task.id.clone(),
            worker_id: None,
            worktree_id: None,
            status: OrchestratorStatus::Initializing,
            current_phase: OrchestratorPhase::Implement,
            rework_count: 0,
            max_rework_attempts,
            gate_config: gate_config.unwrap_or_else(|| DEFAULT_GATES.to_vec()),
            gate_results: Vec::new(),
            pending_approval_id: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        };

        self.store.create_sync(record.clone().into_entity()).await?;
        self.store
            .link(&orchestrator_id, &task.id, RelationshipType::WorksOn)
            .await?;
        if let Some(meta_id) = meta_orchestrator_id {
            self.store
                .link(&orchestrator_id, meta_id, RelationshipType::ManagedBy)
                .await?;
        }

        info!(
            orchestrator_id = %orchestrator_id,
            task_id = %task.id,
            gates = record.gate_config.len(),
            "created task orchestrator"
        );
        Ok(record)
    }

    /// Fetch an orchestrator record.
    pub async fn get(&self, orchestrator_id: &str) -> Result<TaskOrchestratorRecord> {
        let entity = self
            .store
            .get(orchestrator_id)
            .await
            .map_err(anyhow::Error::from)?;
        if entity.kind != EntityKind::TaskOrchestrator {
            bail!("entity {orchestrator_id} is not a task orchestrator");
        }
        TaskOrchestratorRecord::from_entity(&entity)
    }

    /// Start the build loop: spawn the worker agent and mark it managed.
    pub async fn start(&self, orchestrator_id: &str) -> Result<Arc<AgentInstance>> {
        let record = self.get(orchestrator_id).await?;
        if record.status != OrchestratorStatus::Initializing {
            return Err(SibylError::Conflict(format!(
                "cannot start orchestrator in state {}",
                record.status
            ))
            .into());
        }

        let task_entity = self
            .store
            .get(&record.task_id)
            .await
            .map_err(anyhow::Error::from)?;
        let task = Task::from_entity(&task_entity)?;

        let mut req = SpawnRequest::new(self.project_id.clone(), AgentType::Implementer);
        req.spawn_source = SpawnSource::Orchestrator;
        req.task = Some(task.clone());
        req.create_worktree = true;
        req.enable_approvals = true;
        let worker = self
            .runner
            .spawn(req)
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .context("failed to spawn worker agent")?;

        // The worker is managed, not standalone.
        let mut worker_patch = Map::new();
        worker_patch.insert(
            "task_orchestrator_id".to_owned(),
            Value::String(orchestrator_id.to_owned()),
        );
        worker_patch.insert("standalone".to_owned(), Value::Bool(false));
        self.store
            .update(worker.id(), worker_patch)
            .await
            .map_err(anyhow::Error::from)?;

        let worker_entity = self
            .store
            .get(worker.id())
            .await
            .map_err(anyhow::Error::from)?;
        let worktree_id = worker_entity
            .metadata
            .get("worktree_id")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let mut patch = Map::new();
        patch.insert("worker_id".to_owned(), Value::String(worker.id().to_owned()));
        if let Some(worktree_id) = &worktree_id {
            patch.insert("worktree_id".to_owned(), Value::String(worktree_id.clone()));
        }
        patch.insert(
            "status".to_owned(),
            Value::String(OrchestratorStatus::Implementing.to_string()),
        );
        patch.insert(
            "current_phase".to_owned(),
            Value::String(OrchestratorPhase::Implement.to_string()),
        );
        self.store
            .update(orchestrator_id, patch)
            .await
            .map_err(anyhow::Error::from)?;

        self.store
            .link(orchestrator_id, worker.id(), RelationshipType::Orchestrates)
            .await?;

        info!(orchestrator_id, worker_id = %worker.id(), "started build loop");
        Ok(worker)
    }

    /// The initial prompt the worker receives when its session starts.
    pub fn worker_prompt(task: &Task, record: &TaskOrchestratorRecord) -> String {
        let gates: Vec<String> = record.gate_config.iter().map(|g| g.to_string()).collect();
        format!(
            "You are implementing a task as part of an orchestrated build loop.\n\
             \n\
             ## Task\n\
             **{title}**\n\
             \n\
             {description}\n\
             \n\
             ## Quality Gates\n\
             Your implementation will be reviewed by these automated gates: {gates}\n\
             \n\
             ## Instructions\n\
             1. Implement the task completely\n\
             2. Ensure all quality gates can pass (lint, types, tests)\n\
             3. When finished, signal completion so gates can run\n\
             4. If gates fail, you'll receive feedback for rework\n\
             \n\
             Focus on clean, well-tested implementation. You have up to \
             {max_rework} rework iterations before human escalation.",
            title = task.name,
            description = task.description,
            gates = gates.join(", "),
            max_rework = record.max_rework_attempts,
        )
    }

    // -----------------------------------------------------------------
    // Review / rework
    // -----------------------------------------------------------------

    /// Worker signalled completion: run the gates and evaluate.
    pub async fn on_worker_complete(&self, orchestrator_id: &str) -> Result<TaskOrchestratorRecord> {
        let record = self.get(orchestrator_id).await?;
        if !matches!(
            record.status,
            OrchestratorStatus::Implementing | OrchestratorStatus::Reworking
        ) {
            return Err(SibylError::Conflict(format!(
                "worker completion in unexpected state {}",
                record.status
            ))
            .into());
        }

        self.set_state(
            orchestrator_id,
            OrchestratorStatus::Reviewing,
            OrchestratorPhase::Review,
        )
        .await?;

        let worktree = self.resolve_worktree(&record).await;
        let mut results = Vec::new();
        for gate in &record.gate_config {
            if *gate == QualityGateType::HumanReview {
                // Handled by the orchestrator after the automated gates.
                continue;
            }
            let result = self.gates.run_gate(*gate, &worktree).await;
            if !result.passed {
                info!(
                    orchestrator_id,
                    gate = %gate,
                    errors = result.errors.len(),
                    "gate failed"
                );
            }
            results.push(result);
        }

        // Persist the latest run's results on the record.
        let mut patch = Map::new();
        patch.insert(
            "gate_results".to_owned(),
            Value::Array(results.iter().map(GateResult::to_value).collect()),
        );
        self.store
            .update(orchestrator_id, patch)
            .await
            .map_err(anyhow::Error::from)?;

        let all_passed = results.iter().all(|r| r.passed);
        if all_passed {
            self.handle_gates_passed(orchestrator_id).await?;
        } else {
            self.handle_gates_failed(orchestrator_id, &results).await?;
        }

        self.get(orchestrator_id).await
    }

    async fn handle_gates_passed(&self, orchestrator_id: &str) -> Result<()> {
        let record = self.get(orchestrator_id).await?;

        if record.gate_config.contains(&QualityGateType::HumanReview) {
            let approval_id = self.request_human_review(&record).await?;
            self.set_state(
                orchestrator_id,
                OrchestratorStatus::HumanReview,
                OrchestratorPhase::HumanReview,
            )
            .await?;
            let mut patch = Map::new();
            patch.insert(
                "pending_approval_id".to_owned(),
                Value::String(approval_id),
            );
            self.store
                .update(orchestrator_id, patch)
                .await
                .map_err(anyhow::Error::from)?;
            info!(orchestrator_id, "gates passed, awaiting human review");
        } else {
            self.complete(orchestrator_id).await?;
        }
        Ok(())
    }

    async fn handle_gates_failed(
        &self,
        orchestrator_id: &str,
        results: &[GateResult],
    ) -> Result<()> {
        let record = self.get(orchestrator_id).await?;
        let new_rework_count = record.rework_count + 1;

        // Ralph Loop safety: the cap bounds how many times the worker can
        // grind on failing gates.
        if new_rework_count >= record.max_rework_attempts {
            warn!(
                orchestrator_id,
                rework_count = new_rework_count,
                max_attempts = record.max_rework_attempts,
                "max rework attempts exceeded, escalating"
            );
            self.fail_with_escalation(&record, results).await?;
            return Ok(());
        }

        let feedback = compile_gate_feedback(results);

        let mut patch = Map::new();
        patch.insert("rework_count".to_owned(), Value::from(new_rework_count));
        patch.insert(
            "status".to_owned(),
            Value::String(OrchestratorStatus::Reworking.to_string()),
        );
        patch.insert(
            "current_phase".to_owned(),
            Value::String(OrchestratorPhase::Rework.to_string()),
        );
        self.store
            .update(orchestrator_id, patch)
            .await
            .map_err(anyhow::Error::from)?;

        self.send_rework_feedback(&record, &feedback).await;

        info!(
            orchestrator_id,
            rework_count = new_rework_count,
            failed_gates = ?results
                .iter()
                .filter(|r| !r.passed)
                .map(|r| r.gate_type.to_string())
                .collect::<Vec<_>>(),
            "requesting rework"
        );
        Ok(())
    }

    /// Human review landed: approve completes, reject replays the failed
    /// gate path with a synthetic HumanReview failure.
    pub async fn on_human_approval(
        &self,
        orchestrator_id: &str,
        approved: bool,
        feedback: Option<&str>,
    ) -> Result<TaskOrchestratorRecord> {
        let record = self.get(orchestrator_id).await?;
        if record.status != OrchestratorStatus::HumanReview {
            return Err(SibylError::Conflict(format!(
                "human approval in unexpected state {}",
                record.status
            ))
            .into());
        }

        if approved {
            self.complete(orchestrator_id).await?;
        } else {
            let result = GateResult {
                gate_type: QualityGateType::HumanReview,
                passed: false,
                output: feedback.unwrap_or("Human review rejected").to_owned(),
                errors: vec![feedback.unwrap_or("Review rejected").to_owned()],
                warnings: Vec::new(),
                metrics: Map::new(),
                duration_ms: 0,
            };
            self.handle_gates_failed(orchestrator_id, &[result]).await?;
        }

        self.get(orchestrator_id).await
    }

    /// Pause the loop; cascades to the worker.
    pub async fn pause(&self, orchestrator_id: &str, reason: &str) -> Result<()> {
        let record = self.get(orchestrator_id).await?;

        if let Some(worker_id) = &record.worker_id {
            if let Some(worker) = self.runner.get_agent(worker_id) {
                worker.pause(reason).await?;
            }
        }

        self.set_state(
            orchestrator_id,
            OrchestratorStatus::Paused,
            record.current_phase,
        )
        .await?;
        info!(orchestrator_id, reason, "paused orchestrator");
        Ok(())
    }

    /// Resume a paused loop; the status is recovered from the phase.
    pub async fn resume(&self, orchestrator_id: &str) -> Result<TaskOrchestratorRecord> {
        let record = self.get(orchestrator_id).await?;
        if record.status != OrchestratorStatus::Paused {
            return Err(SibylError::Conflict(format!(
                "can only resume a paused orchestrator, current status {}",
                record.status
            ))
            .into());
        }

        if let Some(worker_id) = &record.worker_id {
            if let Some(worker) = self.runner.get_agent(worker_id) {
                let _stream = worker.resume().await?;
            }
        }

        let status = match record.current_phase {
            OrchestratorPhase::Implement => OrchestratorStatus::Implementing,
            OrchestratorPhase::Review => OrchestratorStatus::Reviewing,
            OrchestratorPhase::Rework => OrchestratorStatus::Reworking,
            OrchestratorPhase::HumanReview => OrchestratorStatus::HumanReview,
            OrchestratorPhase::Merge => OrchestratorStatus::Complete,
        };
        self.set_state(orchestrator_id, status, record.current_phase)
            .await?;
        info!(orchestrator_id, "resumed orchestrator");
        self.get(orchestrator_id).await
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    async fn set_state(
        &self,
        orchestrator_id: &str,
        status: OrchestratorStatus,
        phase: OrchestratorPhase,
    ) -> Result<()> {
        let mut patch = Map::new();
        patch.insert("status".to_owned(), Value::String(status.to_string()));
        patch.insert("current_phase".to_owned(), Value::String(phase.to_string()));
        self.store
            .update(orchestrator_id, patch)
            .await
            .map(|_| ())
            .map_err(anyhow::Error::from)
    }

    /// Resolve the worktree the gates should run in: the live worker
    /// instance first, the persisted worktree record as fallback.
    async fn resolve_worktree(&self, record: &TaskOrchestratorRecord) -> PathBuf {
        if let Some(worker_id) = &record.worker_id {
            if let Some(worker) = self.runner.get_agent(worker_id) {
                return worker.worktree_path().clone();
            }
        }
        if let Some(worktree_id) = &record.worktree_id {
            if let Ok(entity) = self.store.get(worktree_id).await {
                if let Ok(worktree) = WorktreeRecord::from_entity(&entity) {
                    return PathBuf::from(worktree.path);
                }
            }
        }
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    /// Send compiled gate feedback into the worker session and drain the
    /// response stream.
    async fn send_rework_feedback(&self, record: &TaskOrchestratorRecord, feedback: &str) {
        let Some(worker_id) = &record.worker_id else {
            warn!(orchestrator_id = %record.id, "no worker to send feedback to");
            return;
        };
        let Some(worker) = self.runner.get_agent(worker_id) else {
            warn!(worker_id = %worker_id, "worker not in this process; feedback deferred to job runtime");
            return;
        };

        match worker.send_message(feedback).await {
            Ok(mut stream) => {
                use futures::StreamExt;
                while stream.next().await.is_some() {}
            }
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "failed to deliver rework feedback");
            }
        }
    }

    async fn request_human_review(&self, record: &TaskOrchestratorRecord) -> Result<String> {
        let agent_id = record
            .worker_id
            .clone()
            .unwrap_or_else(|| record.id.clone());
        let queue = ApprovalQueue::new(
            self.store.clone(),
            Arc::clone(&self.bus),
            self.pool.clone(),
            self.project_id.clone(),
            agent_id,
            Some(record.task_id.clone()),
        );

        let short_task = &record.task_id[record.task_id.len().saturating_sub(8)..];
        let mut metadata = Map::new();
        metadata.insert(
            "tool_name".to_owned(),
            Value::String("human_review".to_owned()),
        );
        metadata.insert(
            "orchestrator_id".to_owned(),
            Value::String(record.id.clone()),
        );
        metadata.insert("task_id".to_owned(), Value::String(record.task_id.clone()));
        metadata.insert("rework_count".to_owned(), Value::from(record.rework_count));

        let approval = queue
            .enqueue(
                ApprovalType::ReviewPhase,
                &format!("Review task {short_task} implementation"),
                &format!(
                    "All automated gates passed. Rework count: {}",
                    record.rework_count
                ),
                metadata,
                crate::approval::DEFAULT_EXPIRY,
            )
            .await?;
        Ok(approval.id)
    }

    /// Ralph Loop exhaustion: mark the record failed and raise a QUESTION
    /// approval naming the failed gates.
    async fn fail_with_escalation(
        &self,
        record: &TaskOrchestratorRecord,
        results: &[GateResult],
    ) -> Result<()> {
        let failed_gates: Vec<String> = results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.gate_type.to_string())
            .collect();

        let short_task = &record.task_id[record.task_id.len().saturating_sub(8)..];
        let approval_id = format!("approval_{}", &Uuid::new_v4().simple().to_string()[..16]);
        let approval = ApprovalRecord {
            id: approval_id.clone(),
            name: format!("Escalation: task {short_task}"),
            organization_id: self.store.org_id().to_owned(),
            project_id: self.project_id.clone(),
            agent_id: record
                .worker_id
                .clone()
                .unwrap_or_else(|| record.id.clone()),
            task_id: Some(record.task_id.clone()),
            approval_type: ApprovalType::Question,
            priority: "high".to_owned(),
            title: format!("Task {short_task} exceeded rework limit"),
            summary: format!(
                "Max rework attempts ({}) exceeded. Failed gates: {}. Human intervention required.",
                record.max_rework_attempts,
                failed_gates.join(", ")
            ),
            actions: vec!["approve".to_owned(), "deny".to_owned()],
            status: ApprovalStatus::Pending,
            expires_at: Utc::now()
                + chrono::Duration::from_std(crate::approval::DEFAULT_EXPIRY).unwrap_or_default(),
            responded_at: None,
            response_by: None,
            response_message: None,
        };
        let mut approval_entity = approval.into_entity();
        approval_entity.metadata.insert(
            "failed_gates".to_owned(),
            Value::Array(failed_gates.iter().cloned().map(Value::String).collect()),
        );
        self.store.create_sync(approval_entity).await?;

        let mut patch = Map::new();
        patch.insert(
            "status".to_owned(),
            Value::String(OrchestratorStatus::Failed.to_string()),
        );
        patch.insert(
            "pending_approval_id".to_owned(),
            Value::String(approval_id),
        );
        patch.insert(
            "failure_reason".to_owned(),
            Value::String("max_rework_exceeded".to_owned()),
        );
        patch.insert(
            "failed_gates".to_owned(),
            Value::Array(failed_gates.iter().cloned().map(Value::String).collect()),
        );
        self.store
            .update(&record.id, patch)
            .await
            .map_err(anyhow::Error::from)?;

        self.notify_completion(&record.id, false).await;

        error!(
            orchestrator_id = %record.id,
            rework_count = record.rework_count,
            failed_gates = ?failed_gates,
            "orchestrator failed, rework limit reached"
        );
        Ok(())
    }

    async fn complete(&self, orchestrator_id: &str) -> Result<()> {
        let record = self.get(orchestrator_id).await?;
        let now = Utc::now();

        let mut patch = Map::new();
        patch.insert(
            "status".to_owned(),
            Value::String(OrchestratorStatus::Complete.to_string()),
        );
        patch.insert(
            "current_phase".to_owned(),
            Value::String(OrchestratorPhase::Merge.to_string()),
        );
        patch.insert("completed_at".to_owned(), Value::String(now.to_rfc3339()));
        self.store
            .update(orchestrator_id, patch)
            .await
            .map_err(anyhow::Error::from)?;

        // The task is now ready for merge review.
        let mut task_patch = Map::new();
        task_patch.insert(
            "status".to_owned(),
            Value::String(TaskStatus::Review.to_string()),
        );
        self.store
            .update(&record.task_id, task_patch)
            .await
            .map_err(anyhow::Error::from)?;

        self.notify_completion(orchestrator_id, true).await;

        info!(
            orchestrator_id,
            rework_count = record.rework_count,
            "orchestrator completed"
        );
        Ok(())
    }

    /// Two-phase broadcast: the record is already persisted; the event is
    /// fire-and-forget for whoever supervises the meta tier.
    async fn notify_completion(&self, orchestrator_id: &str, success: bool) {
        let record = match self.get(orchestrator_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(orchestrator_id, error = %e, "cannot read record for completion notice");
                return;
            }
        };
        let Some(meta_id) = &record.meta_orchestrator_id else {
            return;
        };

        let cost_usd = record
            .worker_id
            .as_deref()
            .and_then(|worker_id| self.runner.get_agent(worker_id))
            .map(|worker| worker.cost_usd())
            .unwrap_or(0.0);

        let payload = serde_json::json!({
            "meta_orchestrator_id": meta_id,
            "task_orchestrator_id": orchestrator_id,
            "task_id": record.task_id,
            "success": success,
            "cost_usd": cost_usd,
            "rework_cycles": record.rework_count,
        });
        if let Err(e) = self.bus.publish(COMPLETION_CHANNEL, &payload.to_string()).await {
            warn!(orchestrator_id, error = %e, "failed to publish completion notice");
        }
    }
}

/// Compile gate results into the structured rework feedback message.
pub fn compile_gate_feedback(results: &[GateResult]) -> String {
    let mut lines = vec!["## Quality Gate Feedback".to_owned(), String::new()];

    for result in results {
        let status = if result.passed { "PASSED" } else { "FAILED" };
        lines.push(format!("### {}: {status}", result.gate_type));

        if !result.output.is_empty() {
            lines.push(String::new());
            lines.push(result.output.clone());
            lines.push(String::new());
        }

        if !result.errors.is_empty() {
            lines.push("**Errors:**".to_owned());
            for error in result.errors.iter().take(10) {
                lines.push(format!("- {error}"));
            }
            if result.errors.len() > 10 {
                lines.push(format!("- ... and {} more", result.errors.len() - 10));
            }
        }

        lines.push(String::new());
    }

    lines.push("Please address the issues above and signal completion when ready.".to_owned());
    lines.join("\n")
}

/// Convenience: the default wait used when blocking on a human review
/// decision.
pub const HUMAN_REVIEW_WAIT: Duration = Duration::from_secs(300);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::entity::graph::MemoryGraph;
    use crate::harness::ClaudeCodeHarness;
    use crate::llm::NoopHintProvider;
    use crate::runner::RunnerConfig;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    /// Gate executor with a scripted verdict sequence per gate type.
    struct ScriptedGates {
        // Pop-front verdicts; empty means pass.
        verdicts: StdMutex<Vec<bool>>,
    }

    impl ScriptedGates {
        fn failing(times: usize) -> Arc<Self> {
            Arc::new(Self {
                verdicts: StdMutex::new(vec![false; times]),
            })
        }

        fn passing() -> Arc<Self> {
            Arc::new(Self {
                verdicts: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl GateExecutor for ScriptedGates {
        async fn run_gate(&self, gate: QualityGateType, _worktree: &Path) -> GateResult {
            if gate != QualityGateType::Lint {
                return GateResult::skipped(gate, "scripted pass");
            }
            let passed = {
                let mut verdicts = self.verdicts.lock().unwrap();
                if verdicts.is_empty() {
                    true
                } else {
                    verdicts.remove(0)
                }
            };
            GateResult {
                gate_type: gate,
                passed,
                output: if passed { "clean" } else { "lint exploded" }.to_owned(),
                errors: if passed {
                    Vec::new()
                } else {
                    vec!["src/lib.rs:1:1: unused import".to_owned()]
                },
                warnings: Vec::new(),
                metrics: Map::new(),
                duration_ms: 1,
            }
        }
    }

    fn write_fake_agent(dir: &Path) -> String {
        let path = dir.join("fake_agent.sh");
        std::fs::write(
            &path,
            "#!/bin/sh\n\
             cat > /dev/null\n\
             echo '{\"type\":\"result\",\"subtype\":\"success\",\"session_id\":\"sess_w\",\"total_cost_usd\":0.1,\"usage\":{\"input_tokens\":10,\"output_tokens\":5}}'\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    async fn service_fixture(
        gates: Arc<dyn GateExecutor>,
    ) -> (TaskOrchestratorService, Task, tempfile::TempDir) {
        // The tempdir holds the fake agent script; it must outlive the
        // service so spawned workers can exec it.
        let tmp = tempfile::tempdir().unwrap();
        let script = write_fake_agent(tmp.path());

        let store = EntityStore::new(Arc::new(MemoryGraph::new()), "org_1");
        let bus: Arc<dyn KvBus> = Arc::new(MemoryBus::new());
        let runner = Arc::new(AgentRunner::new(
            store.clone(),
            Arc::clone(&bus),
            None,
            Arc::new(ClaudeCodeHarness::with_binary(script)),
            Arc::new(NoopHintProvider),
            None,
            RunnerConfig::default(),
        ));

        let task = Task::new("task_1", "Implement the parser", "org_1", "proj_1");
        store.create_sync(task.clone().into_entity()).await.unwrap();

        let service =
            TaskOrchestratorService::new(store, bus, None, runner, gates, "proj_1");
        (service, task, tmp)
    }

    #[tokio::test]
    async fn create_links_task_and_meta() {
        let (service, task, _tmp) = service_fixture(ScriptedGates::passing()).await;
        let record = service
            .create(&task, Some("meta_1"), None, DEFAULT_MAX_REWORK)
            .await
            .unwrap();

        assert_eq!(record.status, OrchestratorStatus::Initializing);
        assert_eq!(record.gate_config, DEFAULT_GATES.to_vec());

        let edges = service
            .store()
            .graph()
            .edges_from("org_1", &record.id)
            .await
            .unwrap();
        assert!(edges.iter().any(|e| e.edge_type == "WORKS_ON" && e.target_id == "task_1"));
        assert!(edges.iter().any(|e| e.edge_type == "MANAGED_BY" && e.target_id == "meta_1"));
    }

    #[tokio::test]
    async fn start_spawns_managed_worker() {
        let (service, task, _tmp) = service_fixture(ScriptedGates::passing()).await;
        let record = service.create(&task, None, None, DEFAULT_MAX_REWORK).await.unwrap();
        let worker = service.start(&record.id).await.unwrap();

        let updated = service.get(&record.id).await.unwrap();
        assert_eq!(updated.status, OrchestratorStatus::Implementing);
        assert_eq!(updated.worker_id.as_deref(), Some(worker.id()));

        let worker_entity = service.store().get(worker.id()).await.unwrap();
        assert_eq!(
            worker_entity.metadata.get("standalone").and_then(Value::as_bool),
            Some(false)
        );
        assert_eq!(
            worker_entity
                .metadata
                .get("task_orchestrator_id")
                .and_then(Value::as_str),
            Some(record.id.as_str())
        );

        // Starting twice conflicts.
        assert!(service.start(&record.id).await.is_err());
    }

    #[tokio::test]
    async fn passing_gates_complete_and_move_task_to_review() {
        let (service, task, _tmp) = service_fixture(ScriptedGates::passing()).await;
        let record = service.create(&task, None, None, DEFAULT_MAX_REWORK).await.unwrap();
        service.start(&record.id).await.unwrap();

        let updated = service.on_worker_complete(&record.id).await.unwrap();
        assert_eq!(updated.status, OrchestratorStatus::Complete);
        assert_eq!(updated.current_phase, OrchestratorPhase::Merge);
        assert!(updated.completed_at.is_some());

        let task_entity = service.store().get("task_1").await.unwrap();
        assert_eq!(
            task_entity.metadata.get("status").and_then(Value::as_str),
            Some("review")
        );
    }

    #[tokio::test]
    async fn ralph_loop_escalates_after_bounded_rework() {
        // Lint fails on every review; default cap of 3 means two rework
        // cycles and then escalation on the third failing review.
        let (service, task, _tmp) = service_fixture(ScriptedGates::failing(10)).await;
        let record = service.create(&task, None, None, DEFAULT_MAX_REWORK).await.unwrap();
        service.start(&record.id).await.unwrap();

        let after_first = service.on_worker_complete(&record.id).await.unwrap();
        assert_eq!(after_first.status, OrchestratorStatus::Reworking);
        assert_eq!(after_first.rework_count, 1);

        let after_second = service.on_worker_complete(&record.id).await.unwrap();
        assert_eq!(after_second.status, OrchestratorStatus::Reworking);
        assert_eq!(after_second.rework_count, 2);

        let after_third = service.on_worker_complete(&record.id).await.unwrap();
        assert_eq!(after_third.status, OrchestratorStatus::Failed);
        assert_eq!(after_third.rework_count, 2);
        assert!(after_third.rework_count <= after_third.max_rework_attempts);

        // Escalation approval exists and names the failed gate.
        let approval_id = after_third.pending_approval_id.expect("escalation approval");
        let approval = service.store().get(&approval_id).await.unwrap();
        let failed_gates = approval
            .metadata
            .get("failed_gates")
            .and_then(Value::as_array)
            .expect("failed_gates metadata");
        assert_eq!(failed_gates, &vec![Value::String("lint".to_owned())]);

        let entity = service.store().get(&record.id).await.unwrap();
        assert_eq!(
            entity.metadata.get("failure_reason").and_then(Value::as_str),
            Some("max_rework_exceeded")
        );
    }

    #[tokio::test]
    async fn human_review_gate_blocks_completion() {
        let (service, task, _tmp) = service_fixture(ScriptedGates::passing()).await;
        let gates = vec![QualityGateType::Lint, QualityGateType::HumanReview];
        let record = service
            .create(&task, None, Some(gates), DEFAULT_MAX_REWORK)
            .await
            .unwrap();
        service.start(&record.id).await.unwrap();

        let updated = service.on_worker_complete(&record.id).await.unwrap();
        assert_eq!(updated.status, OrchestratorStatus::HumanReview);
        assert!(updated.pending_approval_id.is_some());

        // Approval completes the loop.
        let done = service
            .on_human_approval(&record.id, true, None)
            .await
            .unwrap();
        assert_eq!(done.status, OrchestratorStatus::Complete);
    }

    #[tokio::test]
    async fn human_rejection_counts_as_failed_gate() {
        let (service, task, _tmp) = service_fixture(ScriptedGates::passing()).await;
        let gates = vec![QualityGateType::Lint, QualityGateType::HumanReview];
        let record = service
            .create(&task, None, Some(gates), DEFAULT_MAX_REWORK)
            .await
            .unwrap();
        service.start(&record.id).await.unwrap();
        service.on_worker_complete(&record.id).await.unwrap();

        let rejected = service
            .on_human_approval(&record.id, false, Some("needs better tests"))
            .await
            .unwrap();
        assert_eq!(rejected.status, OrchestratorStatus::Reworking);
        assert_eq!(rejected.rework_count, 1);
    }

    #[test]
    fn feedback_lists_failures_and_caps_errors() {
        let result = GateResult {
            gate_type: QualityGateType::Lint,
            passed: false,
            output: "lint output".to_owned(),
            errors: (0..15).map(|i| format!("error {i}")).collect(),
            warnings: Vec::new(),
            metrics: Map::new(),
            duration_ms: 5,
        };
        let feedback = compile_gate_feedback(&[result]);
        assert!(feedback.contains("### lint: FAILED"));
        assert!(feedback.contains("- error 9"));
        assert!(!feedback.contains("- error 10\n"));
        assert!(feedback.contains("... and 5 more"));
        assert!(feedback.contains("signal completion"));
    }
}

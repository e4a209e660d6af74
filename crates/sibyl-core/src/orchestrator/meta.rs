//! Project-level sprint coordinator (Tier 1).
//!
//! A singleton per project. Maintains the task queue, spawns task
//! orchestrators according to the configured strategy, and tracks spend
//! against the cost budget. The budget admission check runs before every
//! spawn; exhaustion pauses the sprint rather than erroring.

use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::entity::records::{
    MetaOrchestratorRecord, MetaStatus, QualityGateType, SprintStrategy, Task, TaskPriority,
};
use crate::entity::store::{EntityStore, ListFilters};
use crate::entity::EntityKind;
use crate::error::SibylError;

use super::task::{DEFAULT_GATES, DEFAULT_MAX_REWORK, TaskOrchestratorService};

/// The pause reason recorded when the budget runs out.
pub const BUDGET_EXHAUSTED_REASON: &str = "Budget exhausted";

/// Sprint status snapshot returned by [`MetaOrchestratorService::get_status`].
#[derive(Debug, Clone)]
pub struct SprintStatus {
    pub id: String,
    pub status: MetaStatus,
    pub strategy: SprintStrategy,
    pub queue_size: usize,
    pub active_count: usize,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub total_rework_cycles: u32,
    pub budget_usd: f64,
    pub spent_usd: f64,
    pub budget_remaining: f64,
    pub budget_utilization: f64,
}

/// Project-level orchestration coordinator.
pub struct MetaOrchestratorService {
    store: EntityStore,
    task_service: Arc<TaskOrchestratorService>,
    project_id: String,
}

impl MetaOrchestratorService {
    pub fn new(
        store: EntityStore,
        task_service: Arc<TaskOrchestratorService>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            task_service,
            project_id: project_id.into(),
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    // -----------------------------------------------------------------
    // Singleton lifecycle
    // -----------------------------------------------------------------

    /// Get the existing meta orchestrator for this project or create one.
    pub async fn get_or_create(&self) -> Result<MetaOrchestratorRecord> {
        if let Some(existing) = self.find_existing().await? {
            return Ok(existing);
        }

        let record = MetaOrchestratorRecord::new(
            format!("meta_{}", &Uuid::new_v4().simple().to_string()[..16]),
            self.store.org_id(),
            self.project_id.clone(),
        );
        self.store.create_sync(record.clone().into_entity()).await?;

        info!(
            meta_orchestrator_id = %record.id,
            project_id = %self.project_id,
            "created meta orchestrator"
        );
        Ok(record)
    }

    async fn find_existing(&self) -> Result<Option<MetaOrchestratorRecord>> {
        let filters = ListFilters {
            project_id: Some(self.project_id.clone()),
            include_archived: true,
            ..Default::default()
        };
        let entities = self
            .store
            .list_by_type(EntityKind::MetaOrchestrator, &filters, 10, 0)
            .await?;
        for entity in &entities {
            let record = MetaOrchestratorRecord::from_entity(entity)?;
            if record.project_id == self.project_id {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Fetch a meta orchestrator by id.
    pub async fn get(&self, meta_id: &str) -> Result<MetaOrchestratorRecord> {
        let entity = self.store.get(meta_id).await.map_err(anyhow::Error::from)?;
        if entity.kind != EntityKind::MetaOrchestrator {
            bail!("entity {meta_id} is not a meta orchestrator");
        }
        MetaOrchestratorRecord::from_entity(&entity)
    }

    // -----------------------------------------------------------------
    // Queue management
    // -----------------------------------------------------------------

    /// Queue one task, deduplicating.
    pub async fn queue_task(&self, meta_id: &str, task_id: &str) -> Result<MetaOrchestratorRecord> {
        self.queue_tasks(meta_id, &[task_id.to_owned()]).await
    }

    /// Queue several tasks, deduplicating against the existing queue.
    pub async fn queue_tasks(
        &self,
        meta_id: &str,
        task_ids: &[String],
    ) -> Result<MetaOrchestratorRecord> {
        let record = self.get(meta_id).await?;

        let mut queue = record.task_queue.clone();
        let mut added = 0usize;
        for task_id in task_ids {
            if !queue.contains(task_id) {
                queue.push(task_id.clone());
                added += 1;
            }
        }

        if added > 0 {
            let mut patch = Map::new();
            patch.insert("task_queue".to_owned(), string_array(&queue));
            self.store.update(meta_id, patch).await.map_err(anyhow::Error::from)?;
            info!(
                meta_orchestrator_id = meta_id,
                added,
                queue_size = queue.len(),
                "tasks queued"
            );
        }

        self.get(meta_id).await
    }

    // -----------------------------------------------------------------
    // Sprint control
    // -----------------------------------------------------------------

    /// Start processing the queue.
    pub async fn start(
        &self,
        meta_id: &str,
        gate_config: Option<Vec<QualityGateType>>,
    ) -> Result<MetaOrchestratorRecord> {
        let record = self.get(meta_id).await?;

        if record.status == MetaStatus::Running {
            return Err(SibylError::Conflict("meta orchestrator is already running".to_owned()).into());
        }
        if record.task_queue.is_empty() {
            return Err(SibylError::Permanent("no tasks queued".to_owned()).into());
        }

        let mut patch = Map::new();
        patch.insert(
            "status".to_owned(),
            Value::String(MetaStatus::Running.to_string()),
        );
        patch.insert(
            "sprint_started_at".to_owned(),
            Value::String(Utc::now().to_rfc3339()),
        );
        self.store.update(meta_id, patch).await.map_err(anyhow::Error::from)?;

        let record = self.get(meta_id).await?;
        self.spawn_orchestrators(&record, gate_config.unwrap_or_else(|| DEFAULT_GATES.to_vec()))
            .await?;

        info!(
            meta_orchestrator_id = meta_id,
            queue_size = record.task_queue.len(),
            strategy = %record.strategy,
            "meta orchestrator started"
        );
        self.get(meta_id).await
    }

    /// Pause the sprint. Active task orchestrators continue; no new ones
    /// spawn. The reason is recorded on the record so operators can see
    /// why (budget exhaustion uses [`BUDGET_EXHAUSTED_REASON`]).
    pub async fn pause(&self, meta_id: &str, reason: &str) -> Result<MetaOrchestratorRecord> {
        let mut patch = Map::new();
        patch.insert(
            "status".to_owned(),
            Value::String(MetaStatus::Paused.to_string()),
        );
        patch.insert("pause_reason".to_owned(), Value::String(reason.to_owned()));
        self.store.update(meta_id, patch).await.map_err(anyhow::Error::from)?;

        info!(meta_orchestrator_id = meta_id, reason, "meta orchestrator paused");
        self.get(meta_id).await
    }

    /// Resume a paused sprint and top capacity back up.
    pub async fn resume(&self, meta_id: &str) -> Result<MetaOrchestratorRecord> {
        let record = self.get(meta_id).await?;
        if record.status != MetaStatus::Paused {
            return Err(SibylError::Conflict(format!(
                "can only resume a paused meta orchestrator, current status {}",
                record.status
            ))
            .into());
        }

        let mut patch = Map::new();
        patch.insert(
            "status".to_owned(),
            Value::String(MetaStatus::Running.to_string()),
        );
        patch.insert("pause_reason".to_owned(), Value::Null);
        self.store.update(meta_id, patch).await.map_err(anyhow::Error::from)?;

        let record = self.get(meta_id).await?;
        if !record.task_queue.is_empty() {
            let available = record
                .max_concurrent
                .saturating_sub(record.active_orchestrators.len() as u32);
            if available > 0 {
                self.spawn_orchestrators(&record, DEFAULT_GATES.to_vec()).await?;
            }
        }

        info!(meta_orchestrator_id = meta_id, "meta orchestrator resumed");
        self.get(meta_id).await
    }

    /// Change the scheduling strategy (and optionally the concurrency cap).
    pub async fn set_strategy(
        &self,
        meta_id: &str,
        strategy: SprintStrategy,
        max_concurrent: Option<u32>,
    ) -> Result<MetaOrchestratorRecord> {
        let mut patch = Map::new();
        patch.insert("strategy".to_owned(), Value::String(strategy.to_string()));
        if let Some(max_concurrent) = max_concurrent {
            patch.insert("max_concurrent".to_owned(), Value::from(max_concurrent));
        }
        self.store.update(meta_id, patch).await.map_err(anyhow::Error::from)?;

        info!(meta_orchestrator_id = meta_id, strategy = %strategy, "strategy updated");
        self.get(meta_id).await
    }

    /// Update the budget and alert threshold.
    pub async fn set_budget(
        &self,
        meta_id: &str,
        budget_usd: f64,
        alert_threshold: f64,
    ) -> Result<MetaOrchestratorRecord> {
        let mut patch = Map::new();
        patch.insert("budget_usd".to_owned(), Value::from(budget_usd));
        patch.insert("cost_alert_threshold".to_owned(), Value::from(alert_threshold));
        self.store.update(meta_id, patch).await.map_err(anyhow::Error::from)?;

        info!(
            meta_orchestrator_id = meta_id,
            budget = budget_usd,
            threshold = alert_threshold,
            "budget updated"
        );
        self.get(meta_id).await
    }

    // -----------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------

    /// Spawn task orchestrators according to the strategy, checking the
    /// budget before each spawn.
    async fn spawn_orchestrators(
        &self,
        record: &MetaOrchestratorRecord,
        gate_config: Vec<QualityGateType>,
    ) -> Result<()> {
        let spawn_count = match record.strategy {
            SprintStrategy::Sequential => {
                if record.active_orchestrators.is_empty() {
                    1
                } else {
                    0
                }
            }
            SprintStrategy::Parallel => {
                let available = record
                    .max_concurrent
                    .saturating_sub(record.active_orchestrators.len() as u32)
                    as usize;
                available.min(record.task_queue.len())
            }
            // Priority spawns one at a time, highest priority first.
            SprintStrategy::Priority => {
                if record.active_orchestrators.is_empty() {
                    1
                } else {
                    0
                }
            }
        };

        let mut queue = record.task_queue.clone();
        let mut active = record.active_orchestrators.clone();
        let spent = record.spent_usd;

        for _ in 0..spawn_count {
            if queue.is_empty() {
                break;
            }

            let index = match record.strategy {
                // Priority sorting happens at dequeue time; the queue is
                // not re-sorted when tasks mutate.
                SprintStrategy::Priority => self.highest_priority_index(&queue).await,
                _ => 0,
            };
            let task_id = queue[index].clone();

            let task_entity = match self.store.get(&task_id).await {
                Ok(entity) if entity.kind == EntityKind::Task => entity,
                Ok(_) | Err(_) => {
                    warn!(task_id = %task_id, "task not found, skipping");
                    queue.remove(index);
                    continue;
                }
            };
            let task = Task::from_entity(&task_entity)?;

            // Budget admission runs before each spawn. A task carrying a
            // cost estimate is refused when completing it would reach the
            // budget; without an estimate only actual spend gates it.
            let estimate = task.estimated_cost_usd.unwrap_or(0.0);
            let exhausted =
                spent >= record.budget_usd || (estimate > 0.0 && spent + estimate >= record.budget_usd);
            if exhausted {
                warn!(
                    meta_orchestrator_id = %record.id,
                    spent,
                    estimate,
                    budget = record.budget_usd,
                    "budget exhausted, pausing orchestration"
                );
                // Persist queue/active progress before pausing; the task
                // stays queued for a future budget raise.
                self.write_schedule(&record.id, &queue, &active).await?;
                self.pause(&record.id, BUDGET_EXHAUSTED_REASON).await?;
                return Ok(());
            }

            queue.remove(index);
            let task_orch = self
                .task_service
                .create(&task, Some(&record.id), Some(gate_config.clone()), DEFAULT_MAX_REWORK)
                .await?;
            active.push(task_orch.id.clone());

            info!(
                meta_orchestrator_id = %record.id,
                task_orchestrator_id = %task_orch.id,
                task_id = %task_id,
                "spawned task orchestrator"
            );
        }

        self.write_schedule(&record.id, &queue, &active).await
    }

    async fn write_schedule(
        &self,
        meta_id: &str,
        queue: &[String],
        active: &[String],
    ) -> Result<()> {
        let mut patch = Map::new();
        patch.insert("task_queue".to_owned(), string_array(queue));
        patch.insert("active_orchestrators".to_owned(), string_array(active));
        self.store
            .update(meta_id, patch)
            .await
            .map(|_| ())
            .map_err(anyhow::Error::from)
    }

    /// Index of the highest-priority task in the queue snapshot; ties keep
    /// queue position.
    async fn highest_priority_index(&self, queue: &[String]) -> usize {
        let mut best_index = 0usize;
        let mut best_priority = TaskPriority::Low;
        for (index, task_id) in queue.iter().enumerate() {
            let priority = match self.store.get(task_id).await {
                Ok(entity) => Task::from_entity(&entity)
                    .map(|t| t.priority)
                    .unwrap_or(TaskPriority::Low),
                Err(_) => TaskPriority::Low,
            };
            if priority > best_priority {
                best_priority = priority;
                best_index = index;
            }
        }
        best_index
    }

    // -----------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------

    /// Handle completion of a task orchestrator: fold in metrics, check
    /// the alert threshold, and schedule the next task (or go idle).
    pub async fn on_task_complete(
        &self,
        meta_id: &str,
        task_orchestrator_id: &str,
        success: bool,
        cost_usd: f64,
        rework_cycles: u32,
    ) -> Result<MetaOrchestratorRecord> {
        let record = self.get(meta_id).await?;

        let tasks_completed = record.tasks_completed + u32::from(success);
        let tasks_failed = record.tasks_failed + u32::from(!success);
        let spent_usd = record.spent_usd + cost_usd;
        let total_rework = record.total_rework_cycles + rework_cycles;
        let active: Vec<String> = record
            .active_orchestrators
            .iter()
            .filter(|id| id.as_str() != task_orchestrator_id)
            .cloned()
            .collect();

        let mut patch = Map::new();
        patch.insert("tasks_completed".to_owned(), Value::from(tasks_completed));
        patch.insert("tasks_failed".to_owned(), Value::from(tasks_failed));
        patch.insert("spent_usd".to_owned(), Value::from(spent_usd));
        patch.insert("total_rework_cycles".to_owned(), Value::from(total_rework));
        patch.insert("active_orchestrators".to_owned(), string_array(&active));
        self.store.update(meta_id, patch).await.map_err(anyhow::Error::from)?;

        if spent_usd >= record.budget_usd * record.cost_alert_threshold {
            warn!(
                meta_orchestrator_id = meta_id,
                spent = spent_usd,
                threshold = record.budget_usd * record.cost_alert_threshold,
                "budget threshold reached"
            );
        }

        let record = self.get(meta_id).await?;
        if record.status == MetaStatus::Running && !record.task_queue.is_empty() {
            self.spawn_orchestrators(&record, DEFAULT_GATES.to_vec()).await?;
        } else if record.task_queue.is_empty() && record.active_orchestrators.is_empty() {
            let mut patch = Map::new();
            patch.insert(
                "status".to_owned(),
                Value::String(MetaStatus::Idle.to_string()),
            );
            self.store.update(meta_id, patch).await.map_err(anyhow::Error::from)?;
            info!(
                meta_orchestrator_id = meta_id,
                completed = tasks_completed,
                failed = tasks_failed,
                "sprint complete"
            );
        }

        self.get(meta_id).await
    }

    /// Status snapshot with budget utilization.
    pub async fn get_status(&self, meta_id: &str) -> Result<SprintStatus> {
        let record = self.get(meta_id).await?;
        Ok(SprintStatus {
            id: record.id.clone(),
            status: record.status,
            strategy: record.strategy,
            queue_size: record.task_queue.len(),
            active_count: record.active_orchestrators.len(),
            tasks_completed: record.tasks_completed,
            tasks_failed: record.tasks_failed,
            total_rework_cycles: record.total_rework_cycles,
            budget_usd: record.budget_usd,
            spent_usd: record.spent_usd,
            budget_remaining: record.budget_usd - record.spent_usd,
            budget_utilization: if record.budget_usd > 0.0 {
                record.spent_usd / record.budget_usd
            } else {
                0.0
            },
        })
    }
}

fn string_array(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

//! The job runtime: a worker process type distinct from the API.
//!
//! Jobs are JSON values on a single named K/V-bus queue. The API process
//! owns lifecycle decisions and enqueues; worker processes consume and own
//! the long-running streams. They share nothing but the SQL store, the
//! K/V bus, and pub/sub.

pub mod agents;
pub mod backup;
pub mod entities;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::KvBus;
use crate::entity::Entity;
use crate::entity::store::EntityStore;
use crate::llm::HintProvider;
use crate::runner::AgentRunner;

use self::backup::BackupConfig;

/// The single named job queue every worker consumes.
pub const JOB_QUEUE_KEY: &str = "sibyl:jobs";
/// How long one BLPOP blocks before the loop re-checks cancellation.
const POP_TIMEOUT: Duration = Duration::from_secs(5);

/// A unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job", content = "args", rename_all = "snake_case")]
pub enum Job {
    RunAgentExecution {
        agent_id: String,
        prompt: String,
    },
    ResumeAgentExecution {
        agent_id: String,
    },
    CreateEntity {
        entity: Entity,
        /// `(target_id, edge_type)` pairs.
        relationships: Vec<(String, String)>,
        auto_link: bool,
    },
    UpdateEntity {
        entity_id: String,
        patch: Map<String, Value>,
    },
    UpdateTask {
        task_id: String,
        patch: Map<String, Value>,
    },
    CreateLearningEpisode {
        name: String,
        content: String,
        task_id: Option<String>,
        tags: Vec<String>,
    },
    GenerateStatusHint {
        agent_id: String,
        recent_output: String,
    },
    RunBackup {
        backup_id: Uuid,
        organization_id: Uuid,
    },
    CleanupOldBackups {
        organization_id: Uuid,
        retention_days: u32,
    },
    RunScheduledBackups {
        organization_ids: Vec<Uuid>,
    },
}

impl Job {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunAgentExecution { .. } => "run_agent_execution",
            Self::ResumeAgentExecution { .. } => "resume_agent_execution",
            Self::CreateEntity { .. } => "create_entity",
            Self::UpdateEntity { .. } => "update_entity",
            Self::UpdateTask { .. } => "update_task",
            Self::CreateLearningEpisode { .. } => "create_learning_episode",
            Self::GenerateStatusHint { .. } => "generate_status_hint",
            Self::RunBackup { .. } => "run_backup",
            Self::CleanupOldBackups { .. } => "cleanup_old_backups",
            Self::RunScheduledBackups { .. } => "run_scheduled_backups",
        }
    }
}

/// Producer handle onto the job queue.
#[derive(Clone)]
pub struct JobQueue {
    bus: Arc<dyn KvBus>,
}

impl JobQueue {
    pub fn new(bus: Arc<dyn KvBus>) -> Self {
        Self { bus }
    }

    /// Enqueue a job for a worker process.
    pub async fn submit(&self, job: &Job) -> Result<()> {
        let payload = serde_json::to_string(job).context("failed to serialize job")?;
        self.bus.rpush(JOB_QUEUE_KEY, &payload).await
    }

    /// Pop the next job, waiting up to `timeout`.
    pub async fn pop(&self, timeout: Duration) -> Result<Option<Job>> {
        let Some(payload) = self.bus.blpop(JOB_QUEUE_KEY, timeout).await? else {
            return Ok(None);
        };
        let job = serde_json::from_str(&payload)
            .with_context(|| format!("undecodable job payload: {payload}"))?;
        Ok(Some(job))
    }
}

/// Everything a job handler may need.
#[derive(Clone)]
pub struct JobContext {
    pub store: EntityStore,
    pub bus: Arc<dyn KvBus>,
    pub pool: PgPool,
    pub runner: Arc<AgentRunner>,
    pub hints: Arc<dyn HintProvider>,
    pub backup: BackupConfig,
}

/// Publish an event, never failing the caller.
pub(crate) async fn safe_broadcast(bus: &dyn KvBus, channel: &str, payload: &Value) {
    if let Err(e) = bus.publish(channel, &payload.to_string()).await {
        warn!(channel, error = %e, "broadcast failed (ignored)");
    }
}

/// The worker loop: consume the queue until cancelled.
///
/// A failing job is logged and recorded; the loop never dies with it.
pub async fn run_worker(ctx: JobContext, cancel: CancellationToken) {
    let queue = JobQueue::new(Arc::clone(&ctx.bus));
    info!("job worker started");

    loop {
        if cancel.is_cancelled() {
            info!("job worker stopping");
            return;
        }

        let job = tokio::select! {
            job = queue.pop(POP_TIMEOUT) => job,
            _ = cancel.cancelled() => continue,
        };

        let job = match job {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "job pop failed");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let name = job.name();
        info!(job = name, "job started");
        match dispatch(&ctx, job).await {
            Ok(()) => info!(job = name, "job completed"),
            Err(e) => error!(job = name, error = format!("{e:#}"), "job failed"),
        }
    }
}

/// Route one job to its handler.
pub async fn dispatch(ctx: &JobContext, job: Job) -> Result<()> {
    match job {
        Job::RunAgentExecution { agent_id, prompt } => {
            agents::run_agent_execution(ctx, &agent_id, &prompt).await
        }
        Job::ResumeAgentExecution { agent_id } => {
            agents::resume_agent_execution(ctx, &agent_id).await
        }
        Job::CreateEntity {
            entity,
            relationships,
            auto_link,
        } => entities::create_entity(ctx, entity, relationships, auto_link).await,
        Job::UpdateEntity { entity_id, patch } => {
            entities::update_entity(ctx, &entity_id, patch).await
        }
        Job::UpdateTask { task_id, patch } => entities::update_task(ctx, &task_id, patch).await,
        Job::CreateLearningEpisode {
            name,
            content,
            task_id,
            tags,
        } => entities::create_learning_episode(ctx, &name, &content, task_id, tags).await,
        Job::GenerateStatusHint {
            agent_id,
            recent_output,
        } => {
            entities::generate_status_hint(ctx, &agent_id, &recent_output).await;
            Ok(())
        }
        Job::RunBackup {
            backup_id,
            organization_id,
        } => backup::run_backup(ctx, backup_id, organization_id).await,
        Job::CleanupOldBackups {
            organization_id,
            retention_days,
        } => backup::cleanup_old_backups(ctx, organization_id, retention_days).await,
        Job::RunScheduledBackups { organization_ids } => {
            backup::run_scheduled_backups(ctx, &organization_ids).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    #[tokio::test]
    async fn queue_roundtrip_preserves_job() {
        let queue = JobQueue::new(Arc::new(MemoryBus::new()));
        let job = Job::UpdateTask {
            task_id: "task_1".to_owned(),
            patch: Map::new(),
        };
        queue.submit(&job).await.unwrap();

        let popped = queue.pop(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(popped.name(), "update_task");
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_queue() {
        let queue = JobQueue::new(Arc::new(MemoryBus::new()));
        let popped = queue.pop(Duration::from_millis(20)).await.unwrap();
        assert!(popped.is_none());
    }

    #[test]
    fn job_serialization_is_tagged() {
        let job = Job::ResumeAgentExecution {
            agent_id: "agent_1".to_owned(),
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(
            json.get("job").and_then(Value::as_str),
            Some("resume_agent_execution")
        );
        assert_eq!(
            json.pointer("/args/agent_id").and_then(Value::as_str),
            Some("agent_1")
        );
    }
}

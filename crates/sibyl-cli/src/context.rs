//! Runtime wiring shared by the CLI commands.
//!
//! Builds the component graph for one org/project scope: SQL pool, K/V
//! bus (Redis, falling back to the in-memory bus when Redis is absent),
//! entity store, runner, orchestrator services.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use tracing::warn;

use sibyl_core::bus::redis_impl::RedisBus;
use sibyl_core::bus::{KvBus, MemoryBus};
use sibyl_core::entity::graph::MemoryGraph;
use sibyl_core::entity::store::EntityStore;
use sibyl_core::harness::ClaudeCodeHarness;
use sibyl_core::jobs::backup::BackupConfig;
use sibyl_core::jobs::JobContext;
use sibyl_core::llm::NoopHintProvider;
use sibyl_core::orchestrator::{
    MetaOrchestratorService, QualityGateRunner, TaskOrchestratorService,
};
use sibyl_core::runner::{AgentRunner, RunnerConfig};
use sibyl_core::worktree::WorktreeManager;

use crate::config::SibylConfig;

/// Fully wired runtime for one org/project scope.
pub struct RuntimeContext {
    pub pool: PgPool,
    pub bus: Arc<dyn KvBus>,
    pub store: EntityStore,
    pub runner: Arc<AgentRunner>,
    pub task_service: Arc<TaskOrchestratorService>,
    pub meta_service: Arc<MetaOrchestratorService>,
    pub config: SibylConfig,
}

impl RuntimeContext {
    /// Build the runtime. The graph store adapter is deployment-specific;
    /// this binary wires the in-process store (state scoped to this
    /// process), which is enough for the operational command surface.
    pub async fn build(config: SibylConfig, org_id: &str, project_id: &str) -> Result<Self> {
        let pool = sibyl_db::pool::create_pool(&config.db_config).await?;

        let bus: Arc<dyn KvBus> = match RedisBus::connect(&config.redis_url).await {
            Ok(bus) => Arc::new(bus),
            Err(e) => {
                warn!(error = %e, "redis unavailable, using in-process bus");
                Arc::new(MemoryBus::new())
            }
        };

        let store = EntityStore::new(Arc::new(MemoryGraph::new()), org_id);

        let worktrees = std::env::current_dir()
            .ok()
            .and_then(|cwd| WorktreeManager::new(cwd, None).ok());

        let runner = Arc::new(AgentRunner::new(
            store.clone(),
            Arc::clone(&bus),
            Some(pool.clone()),
            Arc::new(ClaudeCodeHarness::new()),
            Arc::new(NoopHintProvider),
            worktrees,
            RunnerConfig::default(),
        ));

        let task_service = Arc::new(TaskOrchestratorService::new(
            store.clone(),
            Arc::clone(&bus),
            Some(pool.clone()),
            Arc::clone(&runner),
            Arc::new(QualityGateRunner::new()),
            project_id,
        ));

        let meta_service = Arc::new(MetaOrchestratorService::new(
            store.clone(),
            Arc::clone(&task_service),
            project_id,
        ));

        Ok(Self {
            pool,
            bus,
            store,
            runner,
            task_service,
            meta_service,
            config,
        })
    }

    /// Job context for worker-side handlers.
    pub fn job_context(&self) -> JobContext {
        JobContext {
            store: self.store.clone(),
            bus: Arc::clone(&self.bus),
            pool: self.pool.clone(),
            runner: Arc::clone(&self.runner),
            hints: Arc::new(NoopHintProvider),
            backup: BackupConfig::new(
                self.config.backup_dir.clone(),
                self.config.db_config.database_url.clone(),
            ),
        }
    }
}

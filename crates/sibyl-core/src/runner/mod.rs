//! The agent runner: lifecycle owner for agent instances.
//!
//! One [`AgentInstance`] pairs an AgentRecord with a subprocess session, a
//! worktree, an approval queue, and the heartbeat/stop machinery. The
//! runner's in-memory registry is the only authority for "is an instance
//! alive in this process".

pub mod prompt;

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sibyl_db::queries::agent_state;

use crate::approval::ApprovalQueue;
use crate::bus::KvBus;
use crate::entity::records::{
    AgentCheckpoint, AgentRecord, AgentStatus, AgentType, SpawnSource, Task, WorktreeRecord,
    WorktreeStatus,
};
use crate::entity::store::EntityStore;
use crate::error::SibylError;
use crate::harness::{AgentHarness, AgentMessage, SpawnOptions};
use crate::llm::HintProvider;
use crate::locks::spawn_key;
use crate::worktree::{WorktreeManager, agent_branch_name};

use self::prompt::{PromptContext, build_system_prompt};

/// Runner tuning knobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How often the heartbeat writes to the operational store.
    pub heartbeat_interval: Duration,
    /// How often the stop-signal key is polled during streaming.
    pub stop_poll_interval: Duration,
    /// Hard cap on concurrently registered instances.
    pub max_agents: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            stop_poll_interval: Duration::from_millis(200),
            max_agents: 10,
        }
    }
}

/// K/V sentinel key polled for external stop requests.
pub fn stop_signal_key(agent_id: &str) -> String {
    format!("agent:stop:{agent_id}")
}

/// Signal a running agent to stop. The watcher clears the key once the
/// stop has been effected, so a short TTL is enough.
pub async fn request_stop(bus: &dyn KvBus, agent_id: &str) -> Result<()> {
    bus.setex(&stop_signal_key(agent_id), Duration::from_secs(60), "1")
        .await
}

/// A request to spawn one agent.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Caller-supplied id; derived deterministically when absent.
    pub agent_id: Option<String>,
    pub agent_type: AgentType,
    pub spawn_source: SpawnSource,
    pub project_id: String,
    pub task: Option<Task>,
    pub create_worktree: bool,
    pub enable_approvals: bool,
    pub custom_instructions: Option<String>,
}

impl SpawnRequest {
    pub fn new(project_id: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            agent_id: None,
            agent_type,
            spawn_source: SpawnSource::User,
            project_id: project_id.into(),
            task: None,
            create_worktree: false,
            enable_approvals: false,
            custom_instructions: None,
        }
    }
}

/// Owns the registry of live instances and the spawn contract.
pub struct AgentRunner {
    store: EntityStore,
    bus: Arc<dyn KvBus>,
    /// Operational store for heartbeats; `None` disables them (tests).
    pool: Option<PgPool>,
    harness: Arc<dyn AgentHarness>,
    hints: Arc<dyn HintProvider>,
    worktrees: Option<WorktreeManager>,
    active: Arc<StdMutex<HashMap<String, Arc<AgentInstance>>>>,
    config: RunnerConfig,
}

impl AgentRunner {
    pub fn new(
        store: EntityStore,
        bus: Arc<dyn KvBus>,
        pool: Option<PgPool>,
        harness: Arc<dyn AgentHarness>,
        hints: Arc<dyn HintProvider>,
        worktrees: Option<WorktreeManager>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            pool,
            harness,
            hints,
            worktrees,
            active: Arc::new(StdMutex::new(HashMap::new())),
            config,
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Derive an agent id from `(org, project, timestamp)`.
    fn derive_agent_id(&self, project_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.store.org_id().as_bytes());
        hasher.update(b":");
        hasher.update(project_id.as_bytes());
        hasher.update(b":");
        hasher.update(Utc::now().to_rfc3339().as_bytes());
        format!("agent_{}", &hex::encode(hasher.finalize())[..16])
    }

    /// Spawn contract: lock, upsert the record, allocate a worktree, build
    /// the prompt stack, register the instance.
    pub async fn spawn(&self, req: SpawnRequest) -> std::result::Result<Arc<AgentInstance>, SibylError> {
        let agent_id = req
            .agent_id
            .clone()
            .unwrap_or_else(|| self.derive_agent_id(&req.project_id));

        // Non-blocking per-task spawn lock; losers reject, never queue.
        let _spawn_guard = match &req.task {
            Some(task) => {
                let guard = self.store.locks().try_lock(&spawn_key(&task.id)).await;
                if guard.is_none() {
                    return Err(SibylError::Conflict(format!(
                        "spawn already in flight for task {}",
                        task.id
                    )));
                }
                guard
            }
            None => None,
        };

        // An in-memory instance already serving this task also rejects.
        if let Some(task) = &req.task {
            let active = self.active.lock().expect("runner registry poisoned");
            if active.values().any(|i| i.task_id.as_deref() == Some(&task.id)) {
                return Err(SibylError::Conflict(format!(
                    "an agent instance is already serving task {}",
                    task.id
                )));
            }
            if active.len() >= self.config.max_agents {
                return Err(SibylError::ResourceExhausted("at_capacity".to_owned()));
            }
        } else {
            let active = self.active.lock().expect("runner registry poisoned");
            if active.len() >= self.config.max_agents {
                return Err(SibylError::ResourceExhausted("at_capacity".to_owned()));
            }
        }

        // Upsert the AgentRecord: an API handler may have pre-created it.
        let mut record = match self.store.get(&agent_id).await {
            Ok(entity) => AgentRecord::from_entity(&entity).map_err(SibylError::Other)?,
            Err(SibylError::NotFound { .. }) => AgentRecord::new(
                agent_id.clone(),
                format!("{} agent", req.agent_type),
                self.store.org_id(),
                req.agent_type,
                req.spawn_source,
            ),
            Err(e) => return Err(e),
        };
        record.agent_type = req.agent_type;
        record.spawn_source = req.spawn_source;
        record.task_id = req.task.as_ref().map(|t| t.id.clone());
        record.standalone = true;
        record.started_at = Some(Utc::now());

        let derived = self.derive_tags(&record, req.task.as_ref()).await;
        for tag in derived {
            if !record.tags.contains(&tag) {
                record.tags.push(tag);
            }
        }
        record.tags.truncate(8);

        // Worktree allocation.
        let mut worktree_path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        if req.create_worktree {
            if let Some(manager) = &self.worktrees {
                let branch =
                    agent_branch_name(&agent_id, req.task.as_ref().map(|t| t.name.as_str()));
                let info = manager
                    .create_worktree(&branch)
                    .map_err(|e| SibylError::Other(e.into()))?;
                let worktree_id = format!("wt_{}", &agent_id[agent_id.len().saturating_sub(12)..]);
                let wt_record = WorktreeRecord {
                    id: worktree_id.clone(),
                    name: branch.clone(),
                    organization_id: self.store.org_id().to_owned(),
                    task_id: req.task.as_ref().map(|t| t.id.clone()).unwrap_or_default(),
                    agent_id: Some(agent_id.clone()),
                    path: info.path.to_string_lossy().into_owned(),
                    branch,
                    base_commit: info.head_commit.clone(),
                    status: WorktreeStatus::Active,
                    last_used: Utc::now(),
                    has_uncommitted: false,
                };
                self.store
                    .create_sync(wt_record.into_entity())
                    .await
                    .map_err(SibylError::Other)?;
                record.worktree_id = Some(worktree_id);
                worktree_path = info.path;
            }
        }

        // Layered system prompt.
        let system_prompt = build_system_prompt(&PromptContext {
            agent_id: &agent_id,
            agent_type: Some(req.agent_type),
            task: req.task.as_ref(),
            custom_instructions: req.custom_instructions.as_deref(),
        });

        record.status = AgentStatus::Working;
        self.store
            .create_sync(record.clone().into_entity())
            .await
            .map_err(SibylError::Other)?;

        let approvals = req.enable_approvals.then(|| {
            Arc::new(ApprovalQueue::new(
                self.store.clone(),
                Arc::clone(&self.bus),
                self.pool.clone(),
                req.project_id.clone(),
                agent_id.clone(),
                req.task.as_ref().map(|t| t.id.clone()),
            ))
        });

        let instance = Arc::new(AgentInstance {
            id: agent_id.clone(),
            store: self.store.clone(),
            bus: Arc::clone(&self.bus),
            pool: self.pool.clone(),
            harness: Arc::clone(&self.harness),
            config: self.config.clone(),
            task_id: record.task_id.clone(),
            worktree_path,
            system_prompt,
            approvals,
            session_id: StdMutex::new(record.session_id.clone()),
            tokens_used: AtomicI64::new(record.tokens_used),
            cost_usd: StdMutex::new(record.cost_usd),
            status: StdMutex::new(AgentStatus::Working),
            heartbeat: Mutex::new(None),
        });

        self.active
            .lock()
            .expect("runner registry poisoned")
            .insert(agent_id.clone(), Arc::clone(&instance));

        info!(agent_id = %agent_id, task_id = ?instance.task_id, "agent spawned");
        Ok(instance)
    }

    /// Best-effort tag derivation; falls back to agent-type + task tags.
    async fn derive_tags(&self, record: &AgentRecord, task: Option<&Task>) -> Vec<String> {
        let task_context = task
            .map(|t| format!("{}\n{}", t.name, t.description))
            .unwrap_or_default();
        match self.hints.derive_tags(&record.name, &task_context, 8).await {
            Ok(tags) => tags.into_iter().take(8).collect(),
            Err(e) => {
                debug!(agent_id = %record.id, error = %e, "tag derivation fell back");
                let mut tags = vec![record.agent_type.to_string()];
                if let Some(task) = task {
                    tags.extend(task.tags.iter().take(7).cloned());
                }
                tags
            }
        }
    }

    /// Look up a live instance by id.
    pub fn get_agent(&self, agent_id: &str) -> Option<Arc<AgentInstance>> {
        self.active
            .lock()
            .expect("runner registry poisoned")
            .get(agent_id)
            .cloned()
    }

    /// Number of live instances.
    pub fn active_count(&self) -> usize {
        self.active.lock().expect("runner registry poisoned").len()
    }

    /// Drop an instance from the registry after it has been finalized.
    pub fn unregister(&self, agent_id: &str) {
        self.active
            .lock()
            .expect("runner registry poisoned")
            .remove(agent_id);
    }

    /// Stop a live agent and remove it from the registry.
    pub async fn stop_agent(&self, agent_id: &str, reason: &str) -> Result<()> {
        if let Some(instance) = self.get_agent(agent_id) {
            instance.stop(reason).await?;
        }
        self.unregister(agent_id);
        Ok(())
    }
}

/// One live agent: record + session + worktree + approvals + heartbeat.
pub struct AgentInstance {
    id: String,
    store: EntityStore,
    bus: Arc<dyn KvBus>,
    pool: Option<PgPool>,
    harness: Arc<dyn AgentHarness>,
    config: RunnerConfig,
    task_id: Option<String>,
    worktree_path: PathBuf,
    system_prompt: String,
    approvals: Option<Arc<ApprovalQueue>>,
    session_id: StdMutex<Option<String>>,
    tokens_used: AtomicI64,
    cost_usd: StdMutex<f64>,
    status: StdMutex<AgentStatus>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AgentInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentInstance").field("id", &self.id).finish()
    }
}

impl AgentInstance {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn worktree_path(&self) -> &PathBuf {
        &self.worktree_path
    }

    pub fn approvals(&self) -> Option<&Arc<ApprovalQueue>> {
        self.approvals.as_ref()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().expect("session lock poisoned").clone()
    }

    pub fn tokens_used(&self) -> i64 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    pub fn cost_usd(&self) -> f64 {
        *self.cost_usd.lock().expect("cost lock poisoned")
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    fn set_status(&self, status: AgentStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
    }

    // -----------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------

    /// Start a fresh session with the given prompt. Returns the ordered,
    /// finite message stream.
    pub async fn execute(
        self: &Arc<Self>,
        user_prompt: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = AgentMessage> + Send>>> {
        let mut options = SpawnOptions::new(user_prompt, self.worktree_path.clone());
        options.system_prompt = self.system_prompt.clone();
        self.run_session(options).await
    }

    /// Send a follow-up message into the existing session (resumed via
    /// session id). Without a session id this starts a fresh session.
    pub async fn send_message(
        self: &Arc<Self>,
        content: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = AgentMessage> + Send>>> {
        let mut options = SpawnOptions::new(content, self.worktree_path.clone());
        options.system_prompt = self.system_prompt.clone();
        options.session_id = self.session_id();
        self.run_session(options).await
    }

    /// Resume after restart. With a valid session id the subprocess
    /// re-enters the session; without one the agent restarts on the same
    /// record with a fresh session and a continuation prompt (lossy, by
    /// design).
    pub async fn resume(
        self: &Arc<Self>,
    ) -> Result<Pin<Box<dyn Stream<Item = AgentMessage> + Send>>> {
        let session = self.session_id();
        let prompt = if session.is_some() {
            "Continue from where you left off.".to_owned()
        } else {
            info!(agent_id = %self.id, "no session id; restarting rather than resuming");
            "Your previous session was lost. Review the current state of the \
             working directory and continue the task."
                .to_owned()
        };
        let mut options = SpawnOptions::new(prompt, self.worktree_path.clone());
        options.system_prompt = self.system_prompt.clone();
        options.session_id = session;
        self.run_session(options).await
    }

    async fn run_session(
        self: &Arc<Self>,
        options: SpawnOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = AgentMessage> + Send>>> {
        let handle = self
            .harness
            .spawn(&options)
            .await
            .context("failed to spawn agent subprocess")?;

        self.set_status(AgentStatus::Working);
        self.start_heartbeat().await;

        let instance = Arc::clone(self);
        let mut messages = instance.harness.messages(&handle);

        let stream = async_stream::stream! {
            let mut poll = tokio::time::interval(instance.config.stop_poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    message = messages.next() => {
                        match message {
                            Some(message) => {
                                instance.observe(&message);
                                let done = message.is_result();
                                yield message;
                                if done {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = poll.tick() => {
                        if instance.stop_requested().await {
                            info!(agent_id = %instance.id, "stop signal detected, cancelling session");
                            // Subprocess shutdown may race its own exit;
                            // those failures are noise.
                            if let Err(e) = instance.harness.kill(&handle).await {
                                debug!(agent_id = %instance.id, error = %e,
                                       "kill raced subprocess shutdown");
                            }
                            instance.clear_stop_signal().await;
                            break;
                        }
                    }
                }
            }

            instance.cancel_heartbeat().await;
        };

        Ok(Box::pin(stream))
    }

    /// Local bookkeeping applied to every streamed message.
    fn observe(&self, message: &AgentMessage) {
        if let AgentMessage::Result {
            total_cost_usd,
            session_id,
            usage,
            ..
        } = message
        {
            self.tokens_used.fetch_add(
                (usage.input_tokens + usage.output_tokens) as i64,
                Ordering::Relaxed,
            );
            if let Some(cost) = total_cost_usd {
                *self.cost_usd.lock().expect("cost lock poisoned") += cost;
            }
            if let Some(session) = session_id {
                // The session id is the resume key; latest wins.
                *self.session_id.lock().expect("session lock poisoned") = Some(session.clone());
            }
        }
    }

    async fn stop_requested(&self) -> bool {
        matches!(self.bus.get(&stop_signal_key(&self.id)).await, Ok(Some(_)))
    }

    async fn clear_stop_signal(&self) {
        if let Err(e) = self.bus.del(&stop_signal_key(&self.id)).await {
            warn!(agent_id = %self.id, error = %e, "failed to clear stop signal");
        }
    }

    // -----------------------------------------------------------------
    // Heartbeat
    // -----------------------------------------------------------------

    async fn start_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock().await;
        if slot.is_some() {
            return;
        }
        let Some(pool) = self.pool.clone() else {
            return;
        };
        let Ok(org_uuid) = self.store.org_id().parse::<uuid::Uuid>() else {
            warn!(agent_id = %self.id, "org id is not a UUID; heartbeats disabled");
            return;
        };

        let instance = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(instance.config.heartbeat_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                // The heartbeat writes only to the operational store; the
                // graph is reserved for meaningful state changes.
                let result = agent_state::upsert_heartbeat(
                    &pool,
                    &instance.id,
                    org_uuid,
                    &instance.status().to_string(),
                    instance.tokens_used(),
                    instance.cost_usd(),
                )
                .await;
                if let Err(e) = result {
                    warn!(agent_id = %instance.id, error = %e, "heartbeat write failed");
                }
            }
        }));
    }

    async fn cancel_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
    }

    // -----------------------------------------------------------------
    // Stop / pause / checkpoint
    // -----------------------------------------------------------------

    /// Stop the agent: cancel heartbeat, deny pending approvals, write a
    /// terminal status, checkpoint.
    pub async fn stop(&self, reason: &str) -> Result<()> {
        self.cancel_heartbeat().await;

        if let Some(approvals) = &self.approvals {
            if let Err(e) = approvals.cancel_all(reason).await {
                warn!(agent_id = %self.id, error = %e, "failed to cancel pending approvals");
            }
        }

        self.set_status(AgentStatus::Terminated);
        self.write_record_status(AgentStatus::Terminated, true).await?;
        self.checkpoint(None).await?;

        info!(agent_id = %self.id, reason, "agent stopped");
        Ok(())
    }

    /// Pause the agent: cancel heartbeat but retain pending approvals so a
    /// resume can pick them back up.
    pub async fn pause(&self, reason: &str) -> Result<()> {
        self.cancel_heartbeat().await;
        self.set_status(AgentStatus::Paused);
        self.write_record_status(AgentStatus::Paused, false).await?;
        self.checkpoint(None).await?;

        info!(agent_id = %self.id, reason, "agent paused");
        Ok(())
    }

    async fn write_record_status(&self, status: AgentStatus, terminal: bool) -> Result<()> {
        let mut patch = Map::new();
        patch.insert("status".to_owned(), Value::String(status.to_string()));
        patch.insert("tokens_used".to_owned(), Value::from(self.tokens_used()));
        patch.insert("cost_usd".to_owned(), Value::from(self.cost_usd()));
        if let Some(session) = self.session_id() {
            patch.insert("session_id".to_owned(), Value::String(session));
        }
        if terminal {
            patch.insert(
                "completed_at".to_owned(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
        self.store
            .update(&self.id, patch)
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Write a recovery checkpoint: session id, optional step marker, and
    /// any pending approval. No message history.
    pub async fn checkpoint(&self, current_step: Option<&str>) -> Result<String> {
        let pending_approval_id = match &self.approvals {
            Some(approvals) => approvals
                .list_pending()
                .await
                .unwrap_or_default()
                .first()
                .and_then(|p| p.get("id").and_then(Value::as_str).map(str::to_owned)),
            None => None,
        };

        let checkpoint_id = format!("checkpoint_{}_{}", self.id, Utc::now().timestamp_millis());
        let checkpoint = AgentCheckpoint {
            id: checkpoint_id.clone(),
            name: format!("Checkpoint: {}", self.id),
            organization_id: self.store.org_id().to_owned(),
            agent_id: self.id.clone(),
            session_id: self.session_id(),
            current_step: current_step.map(str::to_owned),
            pending_approval_id,
            waiting_for_task_id: None,
        };
        self.store.create_sync(checkpoint.into_entity()).await?;
        debug!(agent_id = %self.id, checkpoint_id = %checkpoint_id, "checkpoint written");
        Ok(checkpoint_id)
    }

    /// Finalize after a session ends: persist usage and the terminal
    /// status onto the record.
    pub async fn finalize(&self, status: AgentStatus) -> Result<()> {
        self.cancel_heartbeat().await;
        self.set_status(status);
        self.write_record_status(status, !status.is_live()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::entity::graph::MemoryGraph;
    use crate::harness::ClaudeCodeHarness;
    use crate::llm::NoopHintProvider;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn fake_harness(dir: &std::path::Path) -> Arc<dyn AgentHarness> {
        let script = write_script(
            dir,
            "fake_agent.sh",
            "#!/bin/sh\n\
             cat > /dev/null\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"done\"}]}}'\n\
             echo '{\"type\":\"result\",\"subtype\":\"success\",\"session_id\":\"sess_9\",\"total_cost_usd\":0.5,\"usage\":{\"input_tokens\":100,\"output_tokens\":50}}'\n",
        );
        Arc::new(ClaudeCodeHarness::with_binary(script.to_str().unwrap()))
    }

    fn runner(harness: Arc<dyn AgentHarness>) -> AgentRunner {
        let store = EntityStore::new(Arc::new(MemoryGraph::new()), "org_1");
        AgentRunner::new(
            store,
            Arc::new(MemoryBus::new()),
            None,
            harness,
            Arc::new(NoopHintProvider),
            None,
            RunnerConfig::default(),
        )
    }

    fn task_fixture() -> Task {
        Task::new("task_1", "Build the thing", "org_1", "proj_1")
    }

    #[tokio::test]
    async fn spawn_registers_record_and_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(fake_harness(tmp.path()));

        let mut req = SpawnRequest::new("proj_1", AgentType::Implementer);
        req.task = Some(task_fixture());
        let instance = runner.spawn(req).await.unwrap();

        assert_eq!(runner.active_count(), 1);
        assert!(runner.get_agent(instance.id()).is_some());

        let entity = runner.store().get(instance.id()).await.unwrap();
        let record = AgentRecord::from_entity(&entity).unwrap();
        assert_eq!(record.status, AgentStatus::Working);
        assert_eq!(record.task_id.as_deref(), Some("task_1"));
        // Fallback tags: agent type + task tags.
        assert!(record.tags.contains(&"implementer".to_owned()));
    }

    #[tokio::test]
    async fn second_spawn_for_same_task_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(fake_harness(tmp.path()));

        let mut req = SpawnRequest::new("proj_1", AgentType::Implementer);
        req.task = Some(task_fixture());
        runner.spawn(req.clone()).await.unwrap();

        let err = runner.spawn(req).await.unwrap_err();
        assert!(matches!(err, SibylError::Conflict(_)));
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let harness = fake_harness(tmp.path());
        let store = EntityStore::new(Arc::new(MemoryGraph::new()), "org_1");
        let runner = AgentRunner::new(
            store,
            Arc::new(MemoryBus::new()),
            None,
            harness,
            Arc::new(NoopHintProvider),
            None,
            RunnerConfig {
                max_agents: 1,
                ..Default::default()
            },
        );

        runner
            .spawn(SpawnRequest::new("proj_1", AgentType::Implementer))
            .await
            .unwrap();
        let err = runner
            .spawn(SpawnRequest::new("proj_1", AgentType::Implementer))
            .await
            .unwrap_err();
        assert!(matches!(err, SibylError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn execute_accumulates_cost_and_session() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(fake_harness(tmp.path()));
        let instance = runner
            .spawn(SpawnRequest::new("proj_1", AgentType::Implementer))
            .await
            .unwrap();

        let messages: Vec<AgentMessage> =
            instance.execute("go").await.unwrap().collect().await;
        assert!(messages.last().unwrap().is_result());

        assert_eq!(instance.session_id().as_deref(), Some("sess_9"));
        assert_eq!(instance.tokens_used(), 150);
        assert!((instance.cost_usd() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stop_signal_cancels_streaming() {
        let tmp = tempfile::tempdir().unwrap();
        // An agent that emits one message and then hangs.
        let script = write_script(
            tmp.path(),
            "hanging_agent.sh",
            "#!/bin/sh\n\
             cat > /dev/null\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"working\"}]}}'\n\
             sleep 3600\n",
        );
        let harness: Arc<dyn AgentHarness> =
            Arc::new(ClaudeCodeHarness::with_binary(script.to_str().unwrap()));
        let runner = runner(harness);
        let instance = runner
            .spawn(SpawnRequest::new("proj_1", AgentType::Implementer))
            .await
            .unwrap();

        let bus = Arc::clone(&instance.bus);
        let agent_id = instance.id().to_owned();
        let stream = instance.execute("go").await.unwrap();

        let collector = tokio::spawn(async move {
            stream.collect::<Vec<AgentMessage>>().await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        request_stop(bus.as_ref(), &agent_id).await.unwrap();

        let messages = tokio::time::timeout(Duration::from_secs(10), collector)
            .await
            .expect("stop signal should end the stream")
            .unwrap();
        assert!(!messages.is_empty());

        // The signal is cleared once effected.
        assert_eq!(
            instance.bus.get(&stop_signal_key(instance.id())).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn checkpoint_holds_summary_only() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(fake_harness(tmp.path()));
        let instance = runner
            .spawn(SpawnRequest::new("proj_1", AgentType::Implementer))
            .await
            .unwrap();

        let messages: Vec<AgentMessage> =
            instance.execute("go").await.unwrap().collect().await;
        assert!(!messages.is_empty());

        let checkpoint_id = instance.checkpoint(Some("post_execute")).await.unwrap();
        let entity = runner.store().get(&checkpoint_id).await.unwrap();
        let checkpoint = AgentCheckpoint::from_entity(&entity).unwrap();
        assert_eq!(checkpoint.agent_id, instance.id());
        assert_eq!(checkpoint.session_id.as_deref(), Some("sess_9"));
        assert_eq!(checkpoint.current_step.as_deref(), Some("post_execute"));
    }

    #[tokio::test]
    async fn stop_writes_terminal_record() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(fake_harness(tmp.path()));
        let instance = runner
            .spawn(SpawnRequest::new("proj_1", AgentType::Implementer))
            .await
            .unwrap();

        runner.stop_agent(instance.id(), "test teardown").await.unwrap();
        assert_eq!(runner.active_count(), 0);

        let entity = runner.store().get(instance.id()).await.unwrap();
        let record = AgentRecord::from_entity(&entity).unwrap();
        assert_eq!(record.status, AgentStatus::Terminated);
        assert!(record.completed_at.is_some());
    }
}

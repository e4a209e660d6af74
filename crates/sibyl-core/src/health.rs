//! Agent health monitoring.
//!
//! A background loop in the API process scans the operational store for
//! agents whose heartbeat has gone stale, marks them failed, and writes a
//! checkpoint tagged `stale_heartbeat` so a later resume knows why the
//! session died.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sibyl_db::queries::agent_state;

use crate::entity::records::{AgentCheckpoint, AgentRecord, AgentStatus};
use crate::entity::store::EntityStore;

/// An agent is stale when its heartbeat is older than this.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(120);
/// How often the health loop scans.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Background scanner for stale agents.
pub struct HealthMonitor {
    pool: PgPool,
    store: EntityStore,
    stale_threshold: Duration,
    scan_interval: Duration,
}

impl HealthMonitor {
    pub fn new(pool: PgPool, store: EntityStore) -> Self {
        Self {
            pool,
            store,
            stale_threshold: STALE_THRESHOLD,
            scan_interval: SCAN_INTERVAL,
        }
    }

    /// Override the timing knobs (tests).
    pub fn with_intervals(mut self, stale_threshold: Duration, scan_interval: Duration) -> Self {
        self.stale_threshold = stale_threshold;
        self.scan_interval = scan_interval;
        self
    }

    /// One scan: mark every stale agent failed and checkpoint it. Returns
    /// the number of agents marked.
    pub async fn scan_once(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stale_threshold).unwrap_or_default();
        let stale = agent_state::list_stale(&self.pool, cutoff).await?;

        let mut marked = 0usize;
        for state in &stale {
            warn!(
                agent_id = %state.agent_id,
                last_heartbeat = ?state.last_heartbeat,
                "agent heartbeat is stale, marking failed"
            );

            agent_state::set_status(&self.pool, &state.agent_id, "failed").await?;

            // The graph record and checkpoint are best-effort: the agent
            // may only exist in the operational store.
            let session_id = match self.store.get(&state.agent_id).await {
                Ok(entity) => {
                    let session = AgentRecord::from_entity(&entity)
                        .ok()
                        .and_then(|record| record.session_id);
                    let mut patch = Map::new();
                    patch.insert(
                        "status".to_owned(),
                        Value::String(AgentStatus::Failed.to_string()),
                    );
                    if let Err(e) = self.store.update(&state.agent_id, patch).await {
                        warn!(agent_id = %state.agent_id, error = %e,
                              "failed to mark agent record failed");
                    }
                    session
                }
                Err(e) => {
                    warn!(agent_id = %state.agent_id, error = %e,
                          "no graph record for stale agent");
                    None
                }
            };

            let checkpoint = AgentCheckpoint {
                id: format!(
                    "checkpoint_{}_{}",
                    state.agent_id,
                    Utc::now().timestamp_millis()
                ),
                name: format!("Checkpoint: {}", state.agent_id),
                organization_id: self.store.org_id().to_owned(),
                agent_id: state.agent_id.clone(),
                session_id,
                current_step: Some("stale_heartbeat".to_owned()),
                pending_approval_id: None,
                waiting_for_task_id: None,
            };
            if let Err(e) = self.store.create_sync(checkpoint.into_entity()).await {
                warn!(agent_id = %state.agent_id, error = %e,
                      "failed to write stale-heartbeat checkpoint");
            }

            marked += 1;
        }

        Ok(marked)
    }

    /// Run the scan loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.scan_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.scan_once().await {
                        Ok(0) => {}
                        Ok(marked) => info!(marked, "health scan marked stale agents"),
                        Err(e) => warn!(error = %e, "health scan failed"),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("health monitor stopping");
                    return;
                }
            }
        }
    }
}

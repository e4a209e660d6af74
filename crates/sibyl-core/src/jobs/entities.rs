//! Entity-store jobs: graph work that would otherwise block API requests.

use anyhow::Result;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use sibyl_db::models::{AgentMessageKind, AgentMessageRole};
use sibyl_db::queries::agent_log::{self, NewAgentMessage};

use crate::entity::records::Learning;
use crate::entity::store::{AutoLinkParams, CreateSpec, RelationshipSpec};
use crate::entity::{Entity, RelationshipType};

use super::{JobContext, safe_broadcast};

/// Run the asynchronous creation pipeline for an entity.
pub async fn create_entity(
    ctx: &JobContext,
    entity: Entity,
    relationships: Vec<(String, String)>,
    auto_link: bool,
) -> Result<()> {
    let relationships = relationships
        .into_iter()
        .filter_map(|(target_id, edge_type)| {
            let edge_type = match edge_type.as_str() {
                "BELONGS_TO" => RelationshipType::BelongsTo,
                "WORKS_ON" => RelationshipType::WorksOn,
                "MANAGED_BY" => RelationshipType::ManagedBy,
                "ORCHESTRATES" => RelationshipType::Orchestrates,
                "RELATED_TO" => RelationshipType::RelatedTo,
                other => {
                    warn!(edge_type = other, "unknown relationship type, skipping");
                    return None;
                }
            };
            Some(RelationshipSpec {
                target_id,
                edge_type,
            })
        })
        .collect();

    ctx.store
        .run_create_pipeline(CreateSpec {
            entity,
            relationships,
            auto_link: auto_link.then(AutoLinkParams::default),
        })
        .await
}

/// Apply an entity patch, stashing it when the target is still pending.
pub async fn update_entity(
    ctx: &JobContext,
    entity_id: &str,
    patch: Map<String, Value>,
) -> Result<()> {
    if ctx.store.queue_while_pending(entity_id, patch.clone()) {
        debug!(entity_id, "target is pending; update queued for the creation pipeline");
        return Ok(());
    }
    ctx.store
        .update(entity_id, patch)
        .await
        .map(|_| ())
        .map_err(anyhow::Error::from)
}

/// Task-flavored update; identical mechanics, kept separate so callers and
/// logs distinguish task transitions from generic patches.
pub async fn update_task(
    ctx: &JobContext,
    task_id: &str,
    patch: Map<String, Value>,
) -> Result<()> {
    update_entity(ctx, task_id, patch).await?;
    info!(task_id, "task updated");
    Ok(())
}

/// Capture a learning episode with similarity auto-linking.
pub async fn create_learning_episode(
    ctx: &JobContext,
    name: &str,
    content: &str,
    task_id: Option<String>,
    tags: Vec<String>,
) -> Result<()> {
    let learning = Learning {
        id: format!("learning_{}", &Uuid::new_v4().simple().to_string()[..16]),
        name: name.to_owned(),
        organization_id: ctx.store.org_id().to_owned(),
        content: content.to_owned(),
        task_id: task_id.clone(),
        tags,
    };

    let relationships = task_id
        .into_iter()
        .map(|task_id| RelationshipSpec {
            target_id: task_id,
            edge_type: RelationshipType::RelatedTo,
        })
        .collect();

    ctx.store
        .run_create_pipeline(CreateSpec {
            entity: learning.into_entity(),
            relationships,
            auto_link: Some(AutoLinkParams::default()),
        })
        .await
}

/// Best-effort decorative status hint. Any failure is logged and absorbed;
/// this must never fail a caller.
pub async fn generate_status_hint(ctx: &JobContext, agent_id: &str, recent_output: &str) {
    let hint = match ctx.hints.status_hint(recent_output).await {
        Ok(hint) => hint,
        Err(e) => {
            debug!(agent_id, error = %e, "status hint generation skipped");
            return;
        }
    };

    let Ok(org_uuid) = ctx.store.org_id().parse::<Uuid>() else {
        return;
    };

    let row = NewAgentMessage {
        organization_id: org_uuid,
        agent_id: agent_id.to_owned(),
        role: AgentMessageRole::System,
        kind: AgentMessageKind::StatusHint,
        content: hint.clone(),
        extra: json!({}),
    };
    if let Err(e) = agent_log::append_message(&ctx.pool, &row).await {
        warn!(agent_id, error = %e, "failed to store status hint");
        return;
    }

    safe_broadcast(
        ctx.bus.as_ref(),
        "agent_status_hint",
        &json!({"agent_id": agent_id, "org_id": org_uuid.to_string(), "hint": hint}),
    )
    .await;
}

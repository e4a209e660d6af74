//! The org-scoped entity store: typed CRUD over the graph engine.
//!
//! Writes are serialized through a store-wide write lock (the graph
//! client's connection is not safe under concurrent writers); per-entity
//! logical locks are layered above it by callers that need them. Name
//! embeddings are computed engine-side on merge; this layer only decides
//! whether to request them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SibylError;
use crate::locks::{LockManager, entity_key};

use super::graph::{GraphEdge, GraphNode, GraphStore};
use super::pending::{PendingRegistry, PendingState, QueuedOp, wait_settled};
use super::records::{ContainerStatus, Task, TaskPriority, TaskStatus};
use super::{Entity, EntityKind, RelationshipType};

/// Similarity threshold for auto-discovered RELATED_TO edges.
const AUTO_LINK_THRESHOLD: f64 = 0.75;
/// Cap on auto-discovered RELATED_TO edges per entity.
const AUTO_LINK_LIMIT: usize = 5;
/// Retry envelope for the async creation pipeline.
const CREATE_RETRY_ATTEMPTS: u32 = 5;

/// An explicit relationship to create alongside an async entity creation.
#[derive(Debug, Clone)]
pub struct RelationshipSpec {
    pub target_id: String,
    pub edge_type: RelationshipType,
}

/// Parameters for similarity-based RELATED_TO discovery.
#[derive(Debug, Clone)]
pub struct AutoLinkParams {
    pub threshold: f64,
    pub limit: usize,
}

impl Default for AutoLinkParams {
    fn default() -> Self {
        Self {
            threshold: AUTO_LINK_THRESHOLD,
            limit: AUTO_LINK_LIMIT,
        }
    }
}

/// A unit of async-creation work, shared between the in-process spawn path
/// and the job-runtime handler.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub entity: Entity,
    pub relationships: Vec<RelationshipSpec>,
    pub auto_link: Option<AutoLinkParams>,
}

/// Structured filters for [`EntityStore::list_by_type`].
///
/// `project_id` and `epic_id` are pushed into the graph query; the rest
/// live inside metadata and are evaluated in the host process.
#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub project_id: Option<String>,
    pub epic_id: Option<String>,
    pub no_epic: bool,
    /// Comma-separated multi-value status filter, already split.
    pub statuses: Vec<String>,
    pub priority: Option<String>,
    pub complexity: Option<String>,
    pub feature: Option<String>,
    /// Match-any tag filter.
    pub tags: Vec<String>,
    pub include_archived: bool,
}

impl ListFilters {
    /// Parse the comma-separated status form used by callers.
    pub fn with_status_csv(mut self, csv: &str) -> Self {
        self.statuses = csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        self
    }
}

/// Progress rollup for an epic.
#[derive(Debug, Clone, PartialEq)]
pub struct EpicProgress {
    pub total_tasks: u64,
    pub status_counts: BTreeMap<String, u64>,
    pub progress_pct: f64,
}

/// A short task row inside a project summary.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskBrief {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
}

/// An epic row inside a project summary.
#[derive(Debug, Clone, PartialEq)]
pub struct EpicSummary {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub progress_pct: f64,
    pub total_tasks: u64,
}

/// The project summary shape.
#[derive(Debug, Clone)]
pub struct ProjectSummary {
    pub status_counts: BTreeMap<String, u64>,
    pub total_tasks: u64,
    pub progress_pct: f64,
    pub actionable_tasks: Vec<TaskBrief>,
    pub critical_tasks: Vec<TaskBrief>,
    pub epics: Vec<EpicSummary>,
}

/// Org-scoped typed CRUD over a [`GraphStore`].
#[derive(Clone)]
pub struct EntityStore {
    graph: Arc<dyn GraphStore>,
    org_id: String,
    locks: LockManager,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    pending: Arc<PendingRegistry>,
}

impl EntityStore {
    pub fn new(graph: Arc<dyn GraphStore>, org_id: impl Into<String>) -> Self {
        Self {
            graph,
            org_id: org_id.into(),
            locks: LockManager::new(),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            pending: Arc::new(PendingRegistry::new()),
        }
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    // -----------------------------------------------------------------
    // Node <-> entity conversion
    // -----------------------------------------------------------------
    //
    // Primitive metadata values become top-level node properties (the
    // graph accepts only primitives, and top-level placement is what lets
    // project/epic filters push down); everything else folds into one
    // JSON-stringified "metadata" property. Unknown keys round-trip.

    fn entity_to_node(entity: &Entity) -> GraphNode {
        let mut properties = Map::new();
        let mut nested = Map::new();

        for (key, value) in &entity.metadata {
            match value {
                Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                    properties.insert(key.clone(), value.clone());
                }
                _ => {
                    nested.insert(key.clone(), value.clone());
                }
            }
        }

        properties.insert(
            "metadata".to_owned(),
            Value::String(Value::Object(nested).to_string()),
        );
        if let Some(by) = &entity.created_by {
            properties.insert("created_by".to_owned(), Value::String(by.clone()));
        }
        if let Some(by) = &entity.modified_by {
            properties.insert("modified_by".to_owned(), Value::String(by.clone()));
        }

        GraphNode {
            id: entity.id.clone(),
            org_id: entity.organization_id.clone(),
            label: entity.kind.to_string(),
            name: entity.name.clone(),
            properties,
            name_embedding: None,
            created_at: entity.created_at,
            updated_at: entity.updated_at,
        }
    }

    fn node_to_entity(node: &GraphNode) -> Result<Entity> {
        let kind: EntityKind = node
            .label
            .parse()
            .with_context(|| format!("node {} has unknown label {}", node.id, node.label))?;

        let mut metadata: Map<String, Value> = node
            .properties
            .get("metadata")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();

        let mut created_by = None;
        let mut modified_by = None;
        for (key, value) in &node.properties {
            match key.as_str() {
                "metadata" => {}
                "created_by" => created_by = value.as_str().map(str::to_owned),
                "modified_by" => modified_by = value.as_str().map(str::to_owned),
                _ => {
                    metadata.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(Entity {
            id: node.id.clone(),
            kind,
            name: node.name.clone(),
            organization_id: node.org_id.clone(),
            created_by,
            modified_by,
            created_at: node.created_at,
            updated_at: node.updated_at,
            metadata,
        })
    }

    // -----------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------

    /// Direct insert. Idempotent under MERGE-by-id semantics. Returns the
    /// canonical id.
    pub async fn create_sync(&self, entity: Entity) -> Result<String> {
        if entity.organization_id != self.org_id {
            anyhow::bail!(
                "entity {} belongs to org {}, store is scoped to {}",
                entity.id,
                entity.organization_id,
                self.org_id
            );
        }
        let id = entity.id.clone();
        let node = Self::entity_to_node(&entity);

        let _write = self.write_lock.lock().await;
        self.graph
            .merge_node(node)
            .await
            .with_context(|| format!("failed to create entity {id}"))?;

        debug!(entity_id = %id, kind = %entity.kind, "entity created");
        Ok(id)
    }

    /// Asynchronous creation: registers the id as pending and runs the
    /// creation pipeline on the runtime. Reads may observe the entity as
    /// pending until the returned receiver settles.
    pub fn create_async(
        &self,
        entity: Entity,
        relationships: Vec<RelationshipSpec>,
        auto_link: Option<AutoLinkParams>,
    ) -> watch::Receiver<PendingState> {
        let rx = self.pending.register(&entity.id);
        let spec = CreateSpec {
            entity,
            relationships,
            auto_link,
        };
        let store = self.clone();
        tokio::spawn(async move {
            let id = spec.entity.id.clone();
            if let Err(e) = store.run_create_pipeline(spec).await {
                warn!(entity_id = %id, error = %e, "async entity creation failed");
            }
        });
        rx
    }

    /// Await an async creation until it settles. Returns the error message
    /// for failed creations.
    pub async fn wait_created(
        &self,
        rx: watch::Receiver<PendingState>,
    ) -> std::result::Result<(), String> {
        match wait_settled(rx).await {
            PendingState::Completed => Ok(()),
            PendingState::Failed(e) => Err(e),
            PendingState::Pending => Err("creation never settled".to_owned()),
        }
    }

    /// Whether an id is still in the pending set.
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.is_pending(id)
    }

    /// Stash an update against a pending id. Returns `false` when the id
    /// is not pending (apply the update directly instead).
    pub fn queue_while_pending(&self, id: &str, patch: Map<String, Value>) -> bool {
        self.pending.queue_op(id, QueuedOp::Update(patch))
    }

    /// The creation pipeline body. Called in-process by [`create_async`]
    /// and by the job runtime for queued `create_entity` jobs.
    pub async fn run_create_pipeline(&self, spec: CreateSpec) -> Result<()> {
        let id = spec.entity.id.clone();
        let name = spec.entity.name.clone();
        let node = Self::entity_to_node(&spec.entity);

        // (i) Write the node, retrying transient engine failures.
        let write_result = self
            .with_retry(|| {
                let node = node.clone();
                async move {
                    let _write = self.write_lock.lock().await;
                    self.graph.merge_node(node).await
                }
            })
            .await;

        if let Err(e) = write_result {
            self.pending.fail(&id, e.to_string());
            return Err(e).with_context(|| format!("async creation of {id} failed"));
        }

        // (ii) Explicit edges.
        for rel in &spec.relationships {
            let edge = GraphEdge {
                org_id: self.org_id.clone(),
                source_id: id.clone(),
                target_id: rel.target_id.clone(),
                edge_type: rel.edge_type.to_string(),
            };
            if let Err(e) = self.graph.create_edge(edge).await {
                warn!(entity_id = %id, target = %rel.target_id, error = %e,
                      "failed to create explicit edge");
            }
        }

        // (iii) Similarity-discovered RELATED_TO edges.
        if let Some(params) = &spec.auto_link {
            match self.graph.search(&self.org_id, &name, params.limit * 4).await {
                Ok(candidates) => {
                    let mut linked = 0usize;
                    for (candidate, score) in candidates {
                        if candidate.id == id || score < params.threshold {
                            continue;
                        }
                        let edge = GraphEdge {
                            org_id: self.org_id.clone(),
                            source_id: id.clone(),
                            target_id: candidate.id.clone(),
                            edge_type: RelationshipType::RelatedTo.to_string(),
                        };
                        if self.graph.create_edge(edge).await.is_ok() {
                            linked += 1;
                        }
                        if linked >= params.limit {
                            break;
                        }
                    }
                    if linked > 0 {
                        debug!(entity_id = %id, linked, "auto-linked related entities");
                    }
                }
                Err(e) => {
                    warn!(entity_id = %id, error = %e, "auto-link search failed");
                }
            }
        }

        // (iv) Drain operations stashed while the id was pending.
        for op in self.pending.take_ops(&id) {
            match op {
                QueuedOp::Update(patch) => {
                    if let Err(e) = self.apply_update(&id, patch).await {
                        warn!(entity_id = %id, error = %e, "queued update failed");
                    }
                }
                QueuedOp::Link {
                    target_id,
                    edge_type,
                } => {
                    let edge = GraphEdge {
                        org_id: self.org_id.clone(),
                        source_id: id.clone(),
                        target_id,
                        edge_type,
                    };
                    if let Err(e) = self.graph.create_edge(edge).await {
                        warn!(entity_id = %id, error = %e, "queued link failed");
                    }
                }
            }
        }

        self.pending.complete(&id);
        info!(entity_id = %id, "async entity creation completed");
        Ok(())
    }

    /// Fetch an entity by id within the org.
    pub async fn get(&self, id: &str) -> std::result::Result<Entity, SibylError> {
        let node = self
            .graph
            .get_node(&self.org_id, id)
            .await
            .map_err(SibylError::Other)?;
        match node {
            Some(node) => Self::node_to_entity(&node).map_err(SibylError::Other),
            None => Err(SibylError::not_found("entity", id)),
        }
    }

    /// Read-modify-write with merge semantics under the per-entity lock.
    ///
    /// Known envelope fields (`name`, `modified_by`) replace; all other
    /// keys fold into `metadata`. `updated_at` bumps monotonically.
    pub async fn update(
        &self,
        id: &str,
        patch: Map<String, Value>,
    ) -> std::result::Result<Entity, SibylError> {
        let _guard = self.locks.lock(&entity_key(&self.org_id, id)).await;
        self.apply_update(id, patch).await
    }

    async fn apply_update(
        &self,
        id: &str,
        patch: Map<String, Value>,
    ) -> std::result::Result<Entity, SibylError> {
        let mut entity = self.get(id).await?;

        let was_task_status = (entity.kind == EntityKind::Task)
            .then(|| super::get_string(&entity.metadata, "status"))
            .flatten();

        for (key, value) in patch {
            match key.as_str() {
                "name" => {
                    if let Some(s) = value.as_str() {
                        entity.name = s.to_owned();
                    }
                }
                "modified_by" => {
                    entity.modified_by = value.as_str().map(str::to_owned);
                }
                "id" | "kind" | "organization_id" | "created_at" => {
                    debug!(entity_id = %id, key = %key, "ignoring immutable field in patch");
                }
                _ => {
                    entity.metadata.insert(key, value);
                }
            }
        }

        // updated_at bumps monotonically even under clock skew.
        let now = Utc::now();
        entity.updated_at = now.max(entity.updated_at + chrono::Duration::milliseconds(1));

        let node = Self::entity_to_node(&entity);
        {
            let _write = self.write_lock.lock().await;
            self.graph
                .merge_node(node)
                .await
                .with_context(|| format!("failed to update entity {id}"))
                .map_err(SibylError::Other)?;
        }

        // Epic auto-start: a child task moving into doing/review/blocked
        // flips a planning epic to in_progress. Never the inverse.
        if entity.kind == EntityKind::Task {
            let new_status = super::get_string(&entity.metadata, "status");
            if new_status != was_task_status {
                if let Err(e) = self.maybe_start_epic(&entity).await {
                    warn!(task_id = %id, error = %e, "epic auto-start check failed");
                }
            }
        }

        Ok(entity)
    }

    async fn maybe_start_epic(&self, task_entity: &Entity) -> Result<()> {
        let Some(status) = super::get_str(&task_entity.metadata, "status") else {
            return Ok(());
        };
        let Ok(status) = status.parse::<TaskStatus>() else {
            return Ok(());
        };
        if !status.starts_epic() {
            return Ok(());
        }
        let Some(epic_id) = super::get_str(&task_entity.metadata, "epic_id") else {
            return Ok(());
        };

        let epic = match self.get(epic_id).await {
            Ok(e) => e,
            Err(SibylError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(anyhow!(e)),
        };
        if super::get_str(&epic.metadata, "status") == Some("planning") {
            let mut props = Map::new();
            props.insert(
                "status".to_owned(),
                Value::String(ContainerStatus::InProgress.to_string()),
            );
            let _write = self.write_lock.lock().await;
            self.graph.set_properties(&self.org_id, epic_id, props).await?;
            info!(epic_id = %epic_id, task_id = %task_entity.id, "epic auto-started");
        }
        Ok(())
    }

    /// Detach and remove an entity. Idempotent.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _write = self.write_lock.lock().await;
        self.graph
            .delete_node(&self.org_id, id)
            .await
            .with_context(|| format!("failed to delete entity {id}"))
    }

    /// Create a relationship edge between two entities in the org.
    pub async fn link(
        &self,
        source_id: &str,
        target_id: &str,
        edge_type: RelationshipType,
    ) -> Result<()> {
        self.graph
            .create_edge(GraphEdge {
                org_id: self.org_id.clone(),
                source_id: source_id.to_owned(),
                target_id: target_id.to_owned(),
                edge_type: edge_type.to_string(),
            })
            .await
            .with_context(|| format!("failed to link {source_id} -> {target_id}"))
    }

    // -----------------------------------------------------------------
    // Structured queries
    // -----------------------------------------------------------------

    /// List entities of a kind with structured filters.
    pub async fn list_by_type(
        &self,
        kind: EntityKind,
        filters: &ListFilters,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Entity>> {
        // Push project/epic down into the graph query.
        let mut prop_filters = Map::new();
        if let Some(project_id) = &filters.project_id {
            prop_filters.insert("project_id".to_owned(), Value::String(project_id.clone()));
        }
        if let Some(epic_id) = &filters.epic_id {
            prop_filters.insert("epic_id".to_owned(), Value::String(epic_id.clone()));
        }

        // Over-fetch so host-side filters still fill the page.
        let fetch = (limit + offset).saturating_mul(4).max(200);
        let nodes = self
            .graph
            .list_nodes(&self.org_id, &kind.to_string(), &prop_filters, fetch, 0)
            .await?;

        let mut entities = Vec::new();
        for node in &nodes {
            let entity = Self::node_to_entity(node)?;
            if Self::matches_host_filters(&entity, filters) {
                entities.push(entity);
            }
        }

        Ok(entities.into_iter().skip(offset).take(limit).collect())
    }

    fn matches_host_filters(entity: &Entity, filters: &ListFilters) -> bool {
        let meta = &entity.metadata;
        let status = super::get_str(meta, "status").unwrap_or_default();

        if !filters.include_archived && status == "archived" && filters.statuses.is_empty() {
            return false;
        }
        if filters.no_epic && super::get_str(meta, "epic_id").is_some() {
            return false;
        }
        if !filters.statuses.is_empty() && !filters.statuses.iter().any(|s| s == status) {
            return false;
        }
        if let Some(priority) = &filters.priority {
            if super::get_str(meta, "priority") != Some(priority.as_str()) {
                return false;
            }
        }
        if let Some(complexity) = &filters.complexity {
            if super::get_str(meta, "complexity") != Some(complexity.as_str()) {
                return false;
            }
        }
        if let Some(feature) = &filters.feature {
            if super::get_str(meta, "feature") != Some(feature.as_str()) {
                return false;
            }
        }
        if !filters.tags.is_empty() {
            let entity_tags = super::get_string_vec(meta, "tags");
            if !filters.tags.iter().any(|t| entity_tags.contains(t)) {
                return false;
            }
        }
        true
    }

    /// Tasks belonging to an epic, optionally narrowed by status.
    pub async fn get_tasks_for_epic(
        &self,
        epic_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        let mut filters = ListFilters {
            epic_id: Some(epic_id.to_owned()),
            include_archived: true,
            ..Default::default()
        };
        if let Some(status) = status {
            filters.statuses = vec![status.to_string()];
        }

        let entities = self
            .list_by_type(EntityKind::Task, &filters, usize::MAX / 2, 0)
            .await?;
        entities.iter().map(Task::from_entity).collect()
    }

    /// Count-based progress rollup for an epic.
    pub async fn get_epic_progress(&self, epic_id: &str) -> Result<EpicProgress> {
        let tasks = self.get_tasks_for_epic(epic_id, None).await?;
        let mut status_counts: BTreeMap<String, u64> = BTreeMap::new();
        for task in &tasks {
            *status_counts.entry(task.status.to_string()).or_default() += 1;
        }
        let total = tasks.len() as u64;
        let done = status_counts.get("done").copied().unwrap_or(0);
        let progress_pct = if total > 0 {
            done as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Ok(EpicProgress {
            total_tasks: total,
            status_counts,
            progress_pct,
        })
    }

    /// Curated project rollup: counts, actionable list, critical list,
    /// per-epic progress.
    pub async fn get_project_summary(
        &self,
        project_id: &str,
        actionable_limit: usize,
        critical_limit: usize,
        epic_limit: usize,
    ) -> Result<ProjectSummary> {
        let filters = ListFilters {
            project_id: Some(project_id.to_owned()),
            include_archived: true,
            ..Default::default()
        };
        let entities = self
            .list_by_type(EntityKind::Task, &filters, usize::MAX / 2, 0)
            .await?;
        let tasks: Vec<Task> = entities
            .iter()
            .map(Task::from_entity)
            .collect::<Result<_>>()?;

        let mut status_counts: BTreeMap<String, u64> = BTreeMap::new();
        for task in &tasks {
            *status_counts.entry(task.status.to_string()).or_default() += 1;
        }
        let total_tasks = tasks.len() as u64;
        let done = status_counts.get("done").copied().unwrap_or(0);
        let progress_pct = if total_tasks > 0 {
            done as f64 / total_tasks as f64 * 100.0
        } else {
            0.0
        };

        // Actionable: doing first, then blocked, then review, then recent.
        let actionable_rank = |status: TaskStatus| match status {
            TaskStatus::Doing => 0,
            TaskStatus::Blocked => 1,
            TaskStatus::Review => 2,
            TaskStatus::Todo => 3,
            _ => 4,
        };
        let mut actionable: Vec<&Task> = tasks
            .iter()
            .filter(|t| !matches!(t.status, TaskStatus::Done | TaskStatus::Archived))
            .collect();
        actionable.sort_by_key(|t| actionable_rank(t.status));
        let actionable_tasks = actionable
            .into_iter()
            .take(actionable_limit)
            .map(|t| TaskBrief {
                id: t.id.clone(),
                name: t.name.clone(),
                status: t.status,
                priority: t.priority,
            })
            .collect();

        // Critical: high/critical priority, or shouting names.
        let mut critical: Vec<&Task> = tasks
            .iter()
            .filter(|t| {
                matches!(t.priority, TaskPriority::Critical | TaskPriority::High)
                    || t.name.contains("CRITICAL")
            })
            .collect();
        critical.sort_by(|a, b| b.priority.cmp(&a.priority));
        let critical_tasks = critical
            .into_iter()
            .take(critical_limit)
            .map(|t| TaskBrief {
                id: t.id.clone(),
                name: t.name.clone(),
                status: t.status,
                priority: t.priority,
            })
            .collect();

        // Epics with per-epic progress.
        let epic_filters = ListFilters {
            project_id: Some(project_id.to_owned()),
            include_archived: true,
            ..Default::default()
        };
        let epic_entities = self
            .list_by_type(EntityKind::Epic, &epic_filters, epic_limit, 0)
            .await?;
        let mut epics = Vec::new();
        for entity in &epic_entities {
            let epic = super::records::Epic::from_entity(entity)?;
            let progress = self.get_epic_progress(&epic.id).await?;
            epics.push(EpicSummary {
                id: epic.id,
                name: epic.name,
                status: epic.status,
                progress_pct: progress.progress_pct,
                total_tasks: progress.total_tasks,
            });
        }

        Ok(ProjectSummary {
            status_counts,
            total_tasks,
            progress_pct,
            actionable_tasks,
            critical_tasks,
            epics,
        })
    }

    // -----------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------

    /// Hybrid search scoped to the org, post-filtered by kinds.
    pub async fn search(
        &self,
        query: &str,
        kinds: Option<&[EntityKind]>,
        limit: usize,
    ) -> Result<Vec<(Entity, f64)>> {
        let sanitized = sanitize_search_query(query);
        if sanitized.trim().is_empty() {
            return Ok(Vec::new());
        }

        // Over-fetch so kind post-filtering still fills the page.
        let raw = self.graph.search(&self.org_id, &sanitized, limit * 4).await?;

        let mut results = Vec::new();
        for (node, score) in raw {
            let entity = Self::node_to_entity(&node)?;
            if let Some(kinds) = kinds {
                if !kinds.contains(&entity.kind) {
                    continue;
                }
            }
            results.push((entity, score));
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    // -----------------------------------------------------------------
    // Retry
    // -----------------------------------------------------------------

    async fn with_retry<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            randomization_factor: 0.25,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < CREATE_RETRY_ATTEMPTS && is_transient_error(&e) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_secs(30));
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e,
                          "transient graph failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Classify whether a graph failure is worth retrying.
fn is_transient_error(e: &anyhow::Error) -> bool {
    let message = format!("{e:#}").to_lowercase();
    ["timeout", "timed out", "connection", "unavailable", "transient", "broken pipe"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// Escape search-engine special characters so user input cannot break the
/// query syntax.
pub fn sanitize_search_query(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    for c in query.chars() {
        match c {
            '+' | '-' | '&' | '|' | '!' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '"' | '~'
            | '*' | '?' | ':' | '\\' | '/' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::super::graph::MemoryGraph;
    use super::super::records::{Epic, Task};
    use super::*;

    fn store() -> EntityStore {
        EntityStore::new(Arc::new(MemoryGraph::new()), "org_1")
    }

    fn sample_task(id: &str, name: &str) -> Task {
        Task::new(id, name, "org_1", "proj_1")
    }

    #[tokio::test]
    async fn create_get_roundtrip_through_coercion() {
        let store = store();
        let mut task = sample_task("task_1", "Implement lexer");
        task.status = TaskStatus::Doing;
        task.priority = TaskPriority::High;
        task.tags = vec!["lexer".to_owned()];

        store.create_sync(task.clone().into_entity()).await.unwrap();

        let entity = store.get("task_1").await.unwrap();
        let back = Task::from_entity(&entity).unwrap();
        assert_eq!(back.status, TaskStatus::Doing);
        assert_eq!(back.priority, TaskPriority::High);
        assert_eq!(back.tags, vec!["lexer".to_owned()]);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = store();
        let err = store.get("ghost").await.unwrap_err();
        assert!(matches!(err, SibylError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_merges_and_bumps_updated_at() {
        let store = store();
        store
            .create_sync(sample_task("task_1", "t").into_entity())
            .await
            .unwrap();
        let before = store.get("task_1").await.unwrap();

        let mut patch = Map::new();
        patch.insert("status".to_owned(), Value::String("doing".to_owned()));
        patch.insert("custom".to_owned(), Value::String("kept".to_owned()));
        let updated = store.update("task_1", patch).await.unwrap();

        assert!(updated.updated_at > before.updated_at);
        assert_eq!(
            updated.metadata.get("status").and_then(Value::as_str),
            Some("doing")
        );
        assert_eq!(
            updated.metadata.get("custom").and_then(Value::as_str),
            Some("kept")
        );
        // Pre-existing keys survive the merge.
        assert_eq!(
            updated.metadata.get("project_id").and_then(Value::as_str),
            Some("proj_1")
        );
    }

    #[tokio::test]
    async fn sequential_updates_compose_like_a_merged_patch() {
        let store = store();
        store
            .create_sync(sample_task("task_1", "t").into_entity())
            .await
            .unwrap();

        let mut p1 = Map::new();
        p1.insert("status".to_owned(), Value::String("doing".to_owned()));
        let mut p2 = Map::new();
        p2.insert("feature".to_owned(), Value::String("auth".to_owned()));

        store.update("task_1", p1.clone()).await.unwrap();
        let after_two = store.update("task_1", p2.clone()).await.unwrap();

        // Same result as one merged patch applied to a fresh copy.
        let store2 = store_with_task().await;
        let mut merged = p1;
        merged.extend(p2);
        let after_merged = store2.update("task_1", merged).await.unwrap();

        assert_eq!(
            after_two.metadata.get("status"),
            after_merged.metadata.get("status")
        );
        assert_eq!(
            after_two.metadata.get("feature"),
            after_merged.metadata.get("feature")
        );
    }

    async fn store_with_task() -> EntityStore {
        let store = store();
        store
            .create_sync(sample_task("task_1", "t").into_entity())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = store_with_task().await;
        store.delete("task_1").await.unwrap();
        store.delete("task_1").await.unwrap();
        assert!(store.get("task_1").await.is_err());
    }

    #[tokio::test]
    async fn epic_auto_starts_when_child_task_begins() {
        let store = store();
        store
            .create_sync(
                Epic {
                    id: "epic_1".to_owned(),
                    name: "Epic".to_owned(),
                    organization_id: "org_1".to_owned(),
                    project_id: "proj_1".to_owned(),
                    status: ContainerStatus::Planning,
                }
                .into_entity(),
            )
            .await
            .unwrap();
        let mut task = sample_task("task_1", "t");
        task.epic_id = Some("epic_1".to_owned());
        store.create_sync(task.into_entity()).await.unwrap();

        let mut patch = Map::new();
        patch.insert("status".to_owned(), Value::String("doing".to_owned()));
        store.update("task_1", patch).await.unwrap();

        let epic = store.get("epic_1").await.unwrap();
        assert_eq!(
            epic.metadata.get("status").and_then(Value::as_str),
            Some("in_progress")
        );

        // The inverse is never forced: task back to todo leaves the epic.
        let mut patch = Map::new();
        patch.insert("status".to_owned(), Value::String("todo".to_owned()));
        store.update("task_1", patch).await.unwrap();
        let epic = store.get("epic_1").await.unwrap();
        assert_eq!(
            epic.metadata.get("status").and_then(Value::as_str),
            Some("in_progress")
        );
    }

    #[tokio::test]
    async fn list_by_type_filters() {
        let store = store();
        for (id, status, priority) in [
            ("t1", TaskStatus::Doing, TaskPriority::High),
            ("t2", TaskStatus::Todo, TaskPriority::Low),
            ("t3", TaskStatus::Archived, TaskPriority::Medium),
        ] {
            let mut task = sample_task(id, id);
            task.status = status;
            task.priority = priority;
            store.create_sync(task.into_entity()).await.unwrap();
        }

        // Archived excluded by default.
        let all = store
            .list_by_type(EntityKind::Task, &ListFilters::default(), 50, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        // Multi-status filter.
        let filters = ListFilters::default().with_status_csv("doing, archived");
        let some = store
            .list_by_type(EntityKind::Task, &filters, 50, 0)
            .await
            .unwrap();
        assert_eq!(some.len(), 2);

        // Priority filter.
        let filters = ListFilters {
            priority: Some("high".to_owned()),
            ..Default::default()
        };
        let high = store
            .list_by_type(EntityKind::Task, &filters, 50, 0)
            .await
            .unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].id, "t1");
    }

    #[tokio::test]
    async fn project_summary_shape() {
        let store = store();
        store
            .create_sync(
                Epic {
                    id: "epic_1".to_owned(),
                    name: "Epic".to_owned(),
                    organization_id: "org_1".to_owned(),
                    project_id: "proj_1".to_owned(),
                    status: ContainerStatus::InProgress,
                }
                .into_entity(),
            )
            .await
            .unwrap();

        for (id, status, priority) in [
            ("t1", TaskStatus::Doing, TaskPriority::Critical),
            ("t2", TaskStatus::Done, TaskPriority::Low),
            ("t3", TaskStatus::Review, TaskPriority::Medium),
            ("t4", TaskStatus::Blocked, TaskPriority::High),
        ] {
            let mut task = sample_task(id, id);
            task.status = status;
            task.priority = priority;
            task.epic_id = Some("epic_1".to_owned());
            store.create_sync(task.into_entity()).await.unwrap();
        }

        let summary = store
            .get_project_summary("proj_1", 10, 10, 10)
            .await
            .unwrap();

        assert_eq!(summary.total_tasks, 4);
        assert_eq!(summary.status_counts.get("done"), Some(&1));
        assert!((summary.progress_pct - 25.0).abs() < 0.01);
        // doing sorts before blocked before review.
        assert_eq!(summary.actionable_tasks[0].id, "t1");
        assert_eq!(summary.actionable_tasks[1].id, "t4");
        assert_eq!(summary.actionable_tasks[2].id, "t3");
        // critical + high only, critical first.
        assert_eq!(summary.critical_tasks.len(), 2);
        assert_eq!(summary.critical_tasks[0].priority, TaskPriority::Critical);
        assert_eq!(summary.epics.len(), 1);
        assert_eq!(summary.epics[0].total_tasks, 4);
    }

    #[tokio::test]
    async fn async_creation_pipeline_completes_and_drains_queued_ops() {
        let store = store();
        let task = sample_task("task_1", "async task");
        let rx = store.create_async(task.into_entity(), Vec::new(), None);

        // Stash an update while (possibly) pending; if the pipeline already
        // finished the direct path applies instead.
        let mut patch = Map::new();
        patch.insert("status".to_owned(), Value::String("doing".to_owned()));
        if !store.queue_while_pending("task_1", patch.clone()) {
            store.update("task_1", patch).await.unwrap();
        }

        store.wait_created(rx).await.expect("creation should settle");
        assert!(!store.is_pending("task_1"));

        let entity = store.get("task_1").await.unwrap();
        assert_eq!(
            entity.metadata.get("status").and_then(Value::as_str),
            Some("doing")
        );
    }

    #[tokio::test]
    async fn auto_link_discovers_related_entities() {
        let store = store();
        store
            .create_sync(sample_task("t1", "implement websocket transport layer").into_entity())
            .await
            .unwrap();

        let task = sample_task("t2", "implement websocket transport layer retry");
        let rx = store.create_async(
            task.into_entity(),
            Vec::new(),
            Some(AutoLinkParams::default()),
        );
        store.wait_created(rx).await.unwrap();

        let edges = store.graph().edges_from("org_1", "t2").await.unwrap();
        assert!(
            edges
                .iter()
                .any(|e| e.edge_type == "RELATED_TO" && e.target_id == "t1"),
            "expected a RELATED_TO edge to t1, got {edges:?}"
        );
    }

    #[tokio::test]
    async fn search_is_org_scoped_and_kind_filtered() {
        let graph = Arc::new(MemoryGraph::new());
        let store_a = EntityStore::new(graph.clone(), "org_a");
        let store_b = EntityStore::new(graph, "org_b");

        store_a
            .create_sync(Task::new("t1", "database migration", "org_a", "p").into_entity())
            .await
            .unwrap();
        store_b
            .create_sync(Task::new("t2", "database migration", "org_b", "p").into_entity())
            .await
            .unwrap();

        let results = store_a.search("database migration", None, 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, "t1");

        let none = store_a
            .search("database migration", Some(&[EntityKind::Epic]), 10)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn sanitize_escapes_specials() {
        assert_eq!(sanitize_search_query("a+b"), "a\\+b");
        assert_eq!(sanitize_search_query("path/to:thing"), "path\\/to\\:thing");
        assert_eq!(sanitize_search_query("plain words"), "plain words");
    }
}

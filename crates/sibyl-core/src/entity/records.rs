//! Typed entity records and their metadata projections.
//!
//! Each record owns the fields spec'd for its kind, projects them into the
//! shared `metadata` map on write (`into_entity`), and coerces them back on
//! read (`from_entity`). Datetimes normalize to ISO-8601 strings and enums
//! to their snake_case value so the projection is stable across languages
//! reading the same graph.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    Entity, EntityKind, get_bool, get_datetime, get_f64, get_i64, get_str, get_string,
    get_string_vec, get_u32, put, put_datetime, put_opt_datetime, put_opt_str, put_string_vec,
};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    Doing,
    Blocked,
    Review,
    Done,
    Archived,
}

impl TaskStatus {
    /// Statuses that require a live assigned agent (invariant: a task in
    /// one of these has a matching AgentRecord).
    pub fn requires_agent(self) -> bool {
        matches!(self, Self::Doing | Self::Review)
    }

    /// Statuses that auto-start a planning epic.
    pub fn starts_epic(self) -> bool {
        matches!(self, Self::Doing | Self::Review | Self::Blocked)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::Doing => "doing",
            Self::Blocked => "blocked",
            Self::Review => "review",
            Self::Done => "done",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "doing" => Ok(Self::Doing),
            "blocked" => Ok(Self::Blocked),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            "archived" => Ok(Self::Archived),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

/// Priority of a task. Ordering is by urgency: `Low < Medium < High <
/// Critical`, so `Ord` can drive priority-strategy dequeueing directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(ParseEnumError::new("task priority", other)),
        }
    }
}

/// Status of an epic or project container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Planning,
    InProgress,
    Completed,
    Archived,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl FromStr for ContainerStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "archived" => Ok(Self::Archived),
            other => Err(ParseEnumError::new("container status", other)),
        }
    }
}

/// Status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initializing,
    Working,
    Paused,
    WaitingApproval,
    WaitingDependency,
    Completed,
    Failed,
    Terminated,
}

impl AgentStatus {
    /// Whether this agent still counts against the one-agent-per-task rule.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Working => "working",
            Self::Paused => "paused",
            Self::WaitingApproval => "waiting_approval",
            Self::WaitingDependency => "waiting_dependency",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "working" => Ok(Self::Working),
            "paused" => Ok(Self::Paused),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "waiting_dependency" => Ok(Self::WaitingDependency),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            other => Err(ParseEnumError::new("agent status", other)),
        }
    }
}

/// Role an agent was spawned to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Implementer,
    Reviewer,
    Planner,
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Implementer => "implementer",
            Self::Reviewer => "reviewer",
            Self::Planner => "planner",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "implementer" => Ok(Self::Implementer),
            "reviewer" => Ok(Self::Reviewer),
            "planner" => Ok(Self::Planner),
            other => Err(ParseEnumError::new("agent type", other)),
        }
    }
}

/// Where a spawn request originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnSource {
    User,
    Orchestrator,
    Api,
}

impl fmt::Display for SpawnSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Orchestrator => "orchestrator",
            Self::Api => "api",
        };
        f.write_str(s)
    }
}

impl FromStr for SpawnSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "orchestrator" => Ok(Self::Orchestrator),
            "api" => Ok(Self::Api),
            other => Err(ParseEnumError::new("spawn source", other)),
        }
    }
}

/// Status of a worktree. `merged` and `orphaned` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Active,
    Merged,
    Orphaned,
}

impl fmt::Display for WorktreeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Merged => "merged",
            Self::Orphaned => "orphaned",
        };
        f.write_str(s)
    }
}

impl FromStr for WorktreeStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "merged" => Ok(Self::Merged),
            "orphaned" => Ok(Self::Orphaned),
            other => Err(ParseEnumError::new("worktree status", other)),
        }
    }
}

/// Status of an approval request. Monotonic: once out of `pending`, a
/// record never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl FromStr for ApprovalStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "denied" => Ok(Self::Denied),
            "expired" => Ok(Self::Expired),
            other => Err(ParseEnumError::new("approval status", other)),
        }
    }
}

/// What kind of decision an approval asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    ToolUse,
    Question,
    ReviewPhase,
    Plan,
}

impl fmt::Display for ApprovalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ToolUse => "tool_use",
            Self::Question => "question",
            Self::ReviewPhase => "review_phase",
            Self::Plan => "plan",
        };
        f.write_str(s)
    }
}

impl FromStr for ApprovalType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_use" => Ok(Self::ToolUse),
            "question" => Ok(Self::Question),
            "review_phase" => Ok(Self::ReviewPhase),
            "plan" => Ok(Self::Plan),
            other => Err(ParseEnumError::new("approval type", other)),
        }
    }
}

/// Status of a task orchestrator's build loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Initializing,
    Implementing,
    Reviewing,
    Reworking,
    HumanReview,
    Paused,
    Complete,
    Failed,
}

impl fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Implementing => "implementing",
            Self::Reviewing => "reviewing",
            Self::Reworking => "reworking",
            Self::HumanReview => "human_review",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for OrchestratorStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "implementing" => Ok(Self::Implementing),
            "reviewing" => Ok(Self::Reviewing),
            "reworking" => Ok(Self::Reworking),
            "human_review" => Ok(Self::HumanReview),
            "paused" => Ok(Self::Paused),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("orchestrator status", other)),
        }
    }
}

/// Phase of the build loop a task orchestrator is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorPhase {
    Implement,
    Review,
    Rework,
    HumanReview,
    Merge,
}

impl fmt::Display for OrchestratorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Implement => "implement",
            Self::Review => "review",
            Self::Rework => "rework",
            Self::HumanReview => "human_review",
            Self::Merge => "merge",
        };
        f.write_str(s)
    }
}

impl FromStr for OrchestratorPhase {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "implement" => Ok(Self::Implement),
            "review" => Ok(Self::Review),
            "rework" => Ok(Self::Rework),
            "human_review" => Ok(Self::HumanReview),
            "merge" => Ok(Self::Merge),
            other => Err(ParseEnumError::new("orchestrator phase", other)),
        }
    }
}

/// Status of a meta orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaStatus {
    Idle,
    Running,
    Paused,
}

impl fmt::Display for MetaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

impl FromStr for MetaStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            other => Err(ParseEnumError::new("meta status", other)),
        }
    }
}

/// Scheduling strategy for a sprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprintStrategy {
    Sequential,
    Parallel,
    Priority,
}

impl fmt::Display for SprintStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Priority => "priority",
        };
        f.write_str(s)
    }
}

impl FromStr for SprintStrategy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "priority" => Ok(Self::Priority),
            other => Err(ParseEnumError::new("sprint strategy", other)),
        }
    }
}

/// Quality gates a task orchestrator can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityGateType {
    Lint,
    Typecheck,
    Test,
    SecurityScan,
    AiReview,
    HumanReview,
}

impl fmt::Display for QualityGateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Lint => "lint",
            Self::Typecheck => "typecheck",
            Self::Test => "test",
            Self::SecurityScan => "security_scan",
            Self::AiReview => "ai_review",
            Self::HumanReview => "human_review",
        };
        f.write_str(s)
    }
}

impl FromStr for QualityGateType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lint" => Ok(Self::Lint),
            "typecheck" => Ok(Self::Typecheck),
            "test" => Ok(Self::Test),
            "security_scan" => Ok(Self::SecurityScan),
            "ai_review" => Ok(Self::AiReview),
            "human_review" => Ok(Self::HumanReview),
            other => Err(ParseEnumError::new("quality gate type", other)),
        }
    }
}

/// Error returned when parsing any record enum string.
#[derive(Debug, Clone)]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.what, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

fn require_kind(entity: &Entity, kind: EntityKind) -> Result<()> {
    if entity.kind != kind {
        bail!(
            "entity {} has kind {}, expected {}",
            entity.id,
            entity.kind,
            kind
        );
    }
    Ok(())
}

fn parse_enum<T: FromStr<Err = ParseEnumError>>(
    meta: &Map<String, Value>,
    key: &str,
    default: T,
) -> Result<T> {
    match get_str(meta, key) {
        Some(s) => s
            .parse::<T>()
            .with_context(|| format!("bad value for metadata key {key:?}")),
        None => Ok(default),
    }
}

/// A unit of work inside a project.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub project_id: String,
    pub epic_id: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub complexity: Option<String>,
    pub feature: Option<String>,
    pub description: String,
    pub assignees: Vec<String>,
    pub tags: Vec<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub estimated_hours: Option<f64>,
    pub actual_hours: Option<f64>,
    /// Expected LLM spend for the task; drives budget admission.
    pub estimated_cost_usd: Option<f64>,
    pub technologies: Vec<String>,
    pub branch_name: Option<String>,
    pub commit_shas: Vec<String>,
    pub pr_url: Option<String>,
    pub learnings: Option<String>,
    pub assigned_agent: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Minimal constructor; everything else defaults.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            organization_id: organization_id.into(),
            project_id: project_id.into(),
            epic_id: None,
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            complexity: None,
            feature: None,
            description: String::new(),
            assignees: Vec::new(),
            tags: Vec::new(),
            due_date: None,
            estimated_hours: None,
            actual_hours: None,
            estimated_cost_usd: None,
            technologies: Vec::new(),
            branch_name: None,
            commit_shas: Vec::new(),
            pr_url: None,
            learnings: None,
            assigned_agent: None,
            claimed_at: None,
        }
    }

    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(self.id, EntityKind::Task, self.name, self.organization_id);
        let meta = &mut entity.metadata;
        put(meta, "project_id", Value::String(self.project_id));
        put_opt_str(meta, "epic_id", self.epic_id.as_deref());
        put(meta, "status", Value::String(self.status.to_string()));
        put(meta, "priority", Value::String(self.priority.to_string()));
        put_opt_str(meta, "complexity", self.complexity.as_deref());
        put_opt_str(meta, "feature", self.feature.as_deref());
        put(meta, "description", Value::String(self.description));
        put_string_vec(meta, "assignees", &self.assignees);
        put_string_vec(meta, "tags", &self.tags);
        put_opt_datetime(meta, "due_date", self.due_date);
        if let Some(h) = self.estimated_hours {
            put(meta, "estimated_hours", Value::from(h));
        }
        if let Some(h) = self.actual_hours {
            put(meta, "actual_hours", Value::from(h));
        }
        if let Some(c) = self.estimated_cost_usd {
            put(meta, "estimated_cost_usd", Value::from(c));
        }
        put_string_vec(meta, "technologies", &self.technologies);
        put_opt_str(meta, "branch_name", self.branch_name.as_deref());
        put_string_vec(meta, "commit_shas", &self.commit_shas);
        put_opt_str(meta, "pr_url", self.pr_url.as_deref());
        put_opt_str(meta, "learnings", self.learnings.as_deref());
        put_opt_str(meta, "assigned_agent", self.assigned_agent.as_deref());
        put_opt_datetime(meta, "claimed_at", self.claimed_at);
        entity
    }

    pub fn from_entity(entity: &Entity) -> Result<Self> {
        require_kind(entity, EntityKind::Task)?;
        let meta = &entity.metadata;
        Ok(Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            organization_id: entity.organization_id.clone(),
            project_id: get_string(meta, "project_id").unwrap_or_default(),
            epic_id: get_string(meta, "epic_id"),
            status: parse_enum(meta, "status", TaskStatus::Todo)?,
            priority: parse_enum(meta, "priority", TaskPriority::Medium)?,
            complexity: get_string(meta, "complexity"),
            feature: get_string(meta, "feature"),
            description: get_string(meta, "description").unwrap_or_default(),
            assignees: get_string_vec(meta, "assignees"),
            tags: get_string_vec(meta, "tags"),
            due_date: get_datetime(meta, "due_date"),
            estimated_hours: get_f64(meta, "estimated_hours"),
            actual_hours: get_f64(meta, "actual_hours"),
            estimated_cost_usd: get_f64(meta, "estimated_cost_usd"),
            technologies: get_string_vec(meta, "technologies"),
            branch_name: get_string(meta, "branch_name"),
            commit_shas: get_string_vec(meta, "commit_shas"),
            pr_url: get_string(meta, "pr_url"),
            learnings: get_string(meta, "learnings"),
            assigned_agent: get_string(meta, "assigned_agent"),
            claimed_at: get_datetime(meta, "claimed_at"),
        })
    }
}

/// A status-bearing container of tasks, belonging to a project.
#[derive(Debug, Clone, PartialEq)]
pub struct Epic {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub project_id: String,
    pub status: ContainerStatus,
}

impl Epic {
    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(self.id, EntityKind::Epic, self.name, self.organization_id);
        put(
            &mut entity.metadata,
            "project_id",
            Value::String(self.project_id),
        );
        put(
            &mut entity.metadata,
            "status",
            Value::String(self.status.to_string()),
        );
        entity
    }

    pub fn from_entity(entity: &Entity) -> Result<Self> {
        require_kind(entity, EntityKind::Epic)?;
        Ok(Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            organization_id: entity.organization_id.clone(),
            project_id: get_string(&entity.metadata, "project_id").unwrap_or_default(),
            status: parse_enum(&entity.metadata, "status", ContainerStatus::Planning)?,
        })
    }
}

/// A top-level container of epics and tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub status: ContainerStatus,
}

impl Project {
    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(
            self.id,
            EntityKind::Project,
            self.name,
            self.organization_id,
        );
        put(
            &mut entity.metadata,
            "status",
            Value::String(self.status.to_string()),
        );
        entity
    }

    pub fn from_entity(entity: &Entity) -> Result<Self> {
        require_kind(entity, EntityKind::Project)?;
        Ok(Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            organization_id: entity.organization_id.clone(),
            status: parse_enum(&entity.metadata, "status", ContainerStatus::Planning)?,
        })
    }
}

/// Persistent record of one agent instance.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub agent_type: AgentType,
    pub spawn_source: SpawnSource,
    pub status: AgentStatus,
    pub task_id: Option<String>,
    pub worktree_id: Option<String>,
    pub session_id: Option<String>,
    pub standalone: bool,
    pub task_orchestrator_id: Option<String>,
    pub tags: Vec<String>,
    pub tokens_used: i64,
    pub cost_usd: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        organization_id: impl Into<String>,
        agent_type: AgentType,
        spawn_source: SpawnSource,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            organization_id: organization_id.into(),
            agent_type,
            spawn_source,
            status: AgentStatus::Initializing,
            task_id: None,
            worktree_id: None,
            session_id: None,
            standalone: true,
            task_orchestrator_id: None,
            tags: Vec::new(),
            tokens_used: 0,
            cost_usd: 0.0,
            started_at: None,
            last_heartbeat: None,
            completed_at: None,
        }
    }

    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(self.id, EntityKind::Agent, self.name, self.organization_id);
        let meta = &mut entity.metadata;
        put(
            meta,
            "agent_type",
            Value::String(self.agent_type.to_string()),
        );
        put(
            meta,
            "spawn_source",
            Value::String(self.spawn_source.to_string()),
        );
        put(meta, "status", Value::String(self.status.to_string()));
        put_opt_str(meta, "task_id", self.task_id.as_deref());
        put_opt_str(meta, "worktree_id", self.worktree_id.as_deref());
        put_opt_str(meta, "session_id", self.session_id.as_deref());
        put(meta, "standalone", Value::Bool(self.standalone));
        put_opt_str(
            meta,
            "task_orchestrator_id",
            self.task_orchestrator_id.as_deref(),
        );
        put_string_vec(meta, "tags", &self.tags);
        put(meta, "tokens_used", Value::from(self.tokens_used));
        put(meta, "cost_usd", Value::from(self.cost_usd));
        put_opt_datetime(meta, "started_at", self.started_at);
        put_opt_datetime(meta, "last_heartbeat", self.last_heartbeat);
        put_opt_datetime(meta, "completed_at", self.completed_at);
        entity
    }

    pub fn from_entity(entity: &Entity) -> Result<Self> {
        require_kind(entity, EntityKind::Agent)?;
        let meta = &entity.metadata;
        Ok(Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            organization_id: entity.organization_id.clone(),
            agent_type: parse_enum(meta, "agent_type", AgentType::Implementer)?,
            spawn_source: parse_enum(meta, "spawn_source", SpawnSource::User)?,
            status: parse_enum(meta, "status", AgentStatus::Initializing)?,
            task_id: get_string(meta, "task_id"),
            worktree_id: get_string(meta, "worktree_id"),
            session_id: get_string(meta, "session_id"),
            standalone: get_bool(meta, "standalone").unwrap_or(true),
            task_orchestrator_id: get_string(meta, "task_orchestrator_id"),
            tags: get_string_vec(meta, "tags"),
            tokens_used: get_i64(meta, "tokens_used").unwrap_or(0),
            cost_usd: get_f64(meta, "cost_usd").unwrap_or(0.0),
            started_at: get_datetime(meta, "started_at"),
            last_heartbeat: get_datetime(meta, "last_heartbeat"),
            completed_at: get_datetime(meta, "completed_at"),
        })
    }
}

/// An isolated checkout + branch pair owned by at most one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeRecord {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub task_id: String,
    pub agent_id: Option<String>,
    pub path: String,
    pub branch: String,
    pub base_commit: String,
    pub status: WorktreeStatus,
    pub last_used: DateTime<Utc>,
    pub has_uncommitted: bool,
}

impl WorktreeRecord {
    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(
            self.id,
            EntityKind::Worktree,
            self.name,
            self.organization_id,
        );
        let meta = &mut entity.metadata;
        put(meta, "task_id", Value::String(self.task_id));
        put_opt_str(meta, "agent_id", self.agent_id.as_deref());
        put(meta, "path", Value::String(self.path));
        put(meta, "branch", Value::String(self.branch));
        put(meta, "base_commit", Value::String(self.base_commit));
        put(meta, "status", Value::String(self.status.to_string()));
        put_datetime(meta, "last_used", self.last_used);
        put(meta, "has_uncommitted", Value::Bool(self.has_uncommitted));
        entity
    }

    pub fn from_entity(entity: &Entity) -> Result<Self> {
        require_kind(entity, EntityKind::Worktree)?;
        let meta = &entity.metadata;
        Ok(Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            organization_id: entity.organization_id.clone(),
            task_id: get_string(meta, "task_id").unwrap_or_default(),
            agent_id: get_string(meta, "agent_id"),
            path: get_string(meta, "path").unwrap_or_default(),
            branch: get_string(meta, "branch").unwrap_or_default(),
            base_commit: get_string(meta, "base_commit").unwrap_or_default(),
            status: parse_enum(meta, "status", WorktreeStatus::Active)?,
            last_used: get_datetime(meta, "last_used").unwrap_or(entity.updated_at),
            has_uncommitted: get_bool(meta, "has_uncommitted").unwrap_or(false),
        })
    }
}

/// A human-in-the-loop approval request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRecord {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub project_id: String,
    pub agent_id: String,
    pub task_id: Option<String>,
    pub approval_type: ApprovalType,
    pub priority: String,
    pub title: String,
    pub summary: String,
    pub actions: Vec<String>,
    pub status: ApprovalStatus,
    pub expires_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub response_by: Option<String>,
    pub response_message: Option<String>,
}

impl ApprovalRecord {
    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(
            self.id,
            EntityKind::Approval,
            self.name,
            self.organization_id,
        );
        let meta = &mut entity.metadata;
        put(meta, "project_id", Value::String(self.project_id));
        put(meta, "agent_id", Value::String(self.agent_id));
        put_opt_str(meta, "task_id", self.task_id.as_deref());
        put(
            meta,
            "approval_type",
            Value::String(self.approval_type.to_string()),
        );
        put(meta, "priority", Value::String(self.priority));
        put(meta, "title", Value::String(self.title));
        put(meta, "summary", Value::String(self.summary));
        put_string_vec(meta, "actions", &self.actions);
        put(meta, "status", Value::String(self.status.to_string()));
        put_datetime(meta, "expires_at", self.expires_at);
        put_opt_datetime(meta, "responded_at", self.responded_at);
        put_opt_str(meta, "response_by", self.response_by.as_deref());
        put_opt_str(meta, "response_message", self.response_message.as_deref());
        entity
    }

    pub fn from_entity(entity: &Entity) -> Result<Self> {
        require_kind(entity, EntityKind::Approval)?;
        let meta = &entity.metadata;
        Ok(Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            organization_id: entity.organization_id.clone(),
            project_id: get_string(meta, "project_id").unwrap_or_default(),
            agent_id: get_string(meta, "agent_id").unwrap_or_default(),
            task_id: get_string(meta, "task_id"),
            approval_type: parse_enum(meta, "approval_type", ApprovalType::Question)?,
            priority: get_string(meta, "priority").unwrap_or_else(|| "normal".to_owned()),
            title: get_string(meta, "title").unwrap_or_default(),
            summary: get_string(meta, "summary").unwrap_or_default(),
            actions: get_string_vec(meta, "actions"),
            status: parse_enum(meta, "status", ApprovalStatus::Pending)?,
            expires_at: get_datetime(meta, "expires_at").unwrap_or(entity.updated_at),
            responded_at: get_datetime(meta, "responded_at"),
            response_by: get_string(meta, "response_by"),
            response_message: get_string(meta, "response_message"),
        })
    }
}

/// A lightweight recovery marker for one agent. Holds only a summary; the
/// full message history lives in the SQL message log.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCheckpoint {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub agent_id: String,
    pub session_id: Option<String>,
    pub current_step: Option<String>,
    pub pending_approval_id: Option<String>,
    pub waiting_for_task_id: Option<String>,
}

impl AgentCheckpoint {
    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(
            self.id,
            EntityKind::AgentCheckpoint,
            self.name,
            self.organization_id,
        );
        let meta = &mut entity.metadata;
        put(meta, "agent_id", Value::String(self.agent_id));
        put_opt_str(meta, "session_id", self.session_id.as_deref());
        put_opt_str(meta, "current_step", self.current_step.as_deref());
        put_opt_str(
            meta,
            "pending_approval_id",
            self.pending_approval_id.as_deref(),
        );
        put_opt_str(
            meta,
            "waiting_for_task_id",
            self.waiting_for_task_id.as_deref(),
        );
        entity
    }

    pub fn from_entity(entity: &Entity) -> Result<Self> {
        require_kind(entity, EntityKind::AgentCheckpoint)?;
        let meta = &entity.metadata;
        Ok(Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            organization_id: entity.organization_id.clone(),
            agent_id: get_string(meta, "agent_id").unwrap_or_default(),
            session_id: get_string(meta, "session_id"),
            current_step: get_string(meta, "current_step"),
            pending_approval_id: get_string(meta, "pending_approval_id"),
            waiting_for_task_id: get_string(meta, "waiting_for_task_id"),
        })
    }
}

/// Tier-2 build-loop state for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOrchestratorRecord {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub project_id: String,
    pub meta_orchestrator_id: Option<String>,
    pub task_id: String,
    pub worker_id: Option<String>,
    pub worktree_id: Option<String>,
    pub status: OrchestratorStatus,
    pub current_phase: OrchestratorPhase,
    pub rework_count: u32,
    pub max_rework_attempts: u32,
    pub gate_config: Vec<QualityGateType>,
    pub gate_results: Vec<Value>,
    pub pending_approval_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskOrchestratorRecord {
    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(
            self.id,
            EntityKind::TaskOrchestrator,
            self.name,
            self.organization_id,
        );
        let meta = &mut entity.metadata;
        put(meta, "project_id", Value::String(self.project_id));
        put_opt_str(
            meta,
            "meta_orchestrator_id",
            self.meta_orchestrator_id.as_deref(),
        );
        put(meta, "task_id", Value::String(self.task_id));
        put_opt_str(meta, "worker_id", self.worker_id.as_deref());
        put_opt_str(meta, "worktree_id", self.worktree_id.as_deref());
        put(meta, "status", Value::String(self.status.to_string()));
        put(
            meta,
            "current_phase",
            Value::String(self.current_phase.to_string()),
        );
        put(meta, "rework_count", Value::from(self.rework_count));
        put(
            meta,
            "max_rework_attempts",
            Value::from(self.max_rework_attempts),
        );
        let gates: Vec<String> = self.gate_config.iter().map(|g| g.to_string()).collect();
        put_string_vec(meta, "gate_config", &gates);
        put(meta, "gate_results", Value::Array(self.gate_results));
        put_opt_str(
            meta,
            "pending_approval_id",
            self.pending_approval_id.as_deref(),
        );
        put_opt_datetime(meta, "started_at", self.started_at);
        put_opt_datetime(meta, "completed_at", self.completed_at);
        entity
    }

    pub fn from_entity(entity: &Entity) -> Result<Self> {
        require_kind(entity, EntityKind::TaskOrchestrator)?;
        let meta = &entity.metadata;
        let gate_config = get_string_vec(meta, "gate_config")
            .iter()
            .filter_map(|g| g.parse().ok())
            .collect();
        let gate_results = meta
            .get("gate_results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            organization_id: entity.organization_id.clone(),
            project_id: get_string(meta, "project_id").unwrap_or_default(),
            meta_orchestrator_id: get_string(meta, "meta_orchestrator_id"),
            task_id: get_string(meta, "task_id").unwrap_or_default(),
            worker_id: get_string(meta, "worker_id"),
            worktree_id: get_string(meta, "worktree_id"),
            status: parse_enum(meta, "status", OrchestratorStatus::Initializing)?,
            current_phase: parse_enum(meta, "current_phase", OrchestratorPhase::Implement)?,
            rework_count: get_u32(meta, "rework_count").unwrap_or(0),
            max_rework_attempts: get_u32(meta, "max_rework_attempts").unwrap_or(3),
            gate_config,
            gate_results,
            pending_approval_id: get_string(meta, "pending_approval_id"),
            started_at: get_datetime(meta, "started_at"),
            completed_at: get_datetime(meta, "completed_at"),
        })
    }
}

/// Tier-1 sprint state for one project. Singleton per project.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaOrchestratorRecord {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub project_id: String,
    pub status: MetaStatus,
    pub strategy: SprintStrategy,
    pub max_concurrent: u32,
    pub task_queue: Vec<String>,
    pub active_orchestrators: Vec<String>,
    pub budget_usd: f64,
    pub spent_usd: f64,
    pub cost_alert_threshold: f64,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub total_rework_cycles: u32,
    pub sprint_started_at: Option<DateTime<Utc>>,
}

impl MetaOrchestratorRecord {
    pub fn new(
        id: impl Into<String>,
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        let project_id = project_id.into();
        let short = &project_id[..project_id.len().min(8)];
        Self {
            id: id.into(),
            name: format!("MetaOrchestrator: {short}"),
            organization_id: organization_id.into(),
            project_id,
            status: MetaStatus::Idle,
            strategy: SprintStrategy::Sequential,
            max_concurrent: 3,
            task_queue: Vec::new(),
            active_orchestrators: Vec::new(),
            budget_usd: 100.0,
            spent_usd: 0.0,
            cost_alert_threshold: 0.8,
            tasks_completed: 0,
            tasks_failed: 0,
            total_rework_cycles: 0,
            sprint_started_at: None,
        }
    }

    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(
            self.id,
            EntityKind::MetaOrchestrator,
            self.name,
            self.organization_id,
        );
        let meta = &mut entity.metadata;
        put(meta, "project_id", Value::String(self.project_id));
        put(meta, "status", Value::String(self.status.to_string()));
        put(meta, "strategy", Value::String(self.strategy.to_string()));
        put(meta, "max_concurrent", Value::from(self.max_concurrent));
        put_string_vec(meta, "task_queue", &self.task_queue);
        put_string_vec(meta, "active_orchestrators", &self.active_orchestrators);
        put(meta, "budget_usd", Value::from(self.budget_usd));
        put(meta, "spent_usd", Value::from(self.spent_usd));
        put(
            meta,
            "cost_alert_threshold",
            Value::from(self.cost_alert_threshold),
        );
        put(meta, "tasks_completed", Value::from(self.tasks_completed));
        put(meta, "tasks_failed", Value::from(self.tasks_failed));
        put(
            meta,
            "total_rework_cycles",
            Value::from(self.total_rework_cycles),
        );
        put_opt_datetime(meta, "sprint_started_at", self.sprint_started_at);
        entity
    }

    pub fn from_entity(entity: &Entity) -> Result<Self> {
        require_kind(entity, EntityKind::MetaOrchestrator)?;
        let meta = &entity.metadata;
        Ok(Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            organization_id: entity.organization_id.clone(),
            project_id: get_string(meta, "project_id").unwrap_or_default(),
            status: parse_enum(meta, "status", MetaStatus::Idle)?,
            strategy: parse_enum(meta, "strategy", SprintStrategy::Sequential)?,
            max_concurrent: get_u32(meta, "max_concurrent").unwrap_or(3),
            task_queue: get_string_vec(meta, "task_queue"),
            active_orchestrators: get_string_vec(meta, "active_orchestrators"),
            budget_usd: get_f64(meta, "budget_usd").unwrap_or(100.0),
            spent_usd: get_f64(meta, "spent_usd").unwrap_or(0.0),
            cost_alert_threshold: get_f64(meta, "cost_alert_threshold").unwrap_or(0.8),
            tasks_completed: get_u32(meta, "tasks_completed").unwrap_or(0),
            tasks_failed: get_u32(meta, "tasks_failed").unwrap_or(0),
            total_rework_cycles: get_u32(meta, "total_rework_cycles").unwrap_or(0),
            sprint_started_at: get_datetime(meta, "sprint_started_at"),
        })
    }
}

/// A captured learning, written by the learning-episode job.
#[derive(Debug, Clone, PartialEq)]
pub struct Learning {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub content: String,
    pub task_id: Option<String>,
    pub tags: Vec<String>,
}

impl Learning {
    pub fn into_entity(self) -> Entity {
        let mut entity = Entity::new(
            self.id,
            EntityKind::Learning,
            self.name,
            self.organization_id,
        );
        let meta = &mut entity.metadata;
        put(meta, "content", Value::String(self.content));
        put_opt_str(meta, "task_id", self.task_id.as_deref());
        put_string_vec(meta, "tags", &self.tags);
        entity
    }

    pub fn from_entity(entity: &Entity) -> Result<Self> {
        require_kind(entity, EntityKind::Learning)?;
        let meta = &entity.metadata;
        Ok(Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            organization_id: entity.organization_id.clone(),
            content: get_string(meta, "content").unwrap_or_default(),
            task_id: get_string(meta, "task_id"),
            tags: get_string_vec(meta, "tags"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a tenant sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Resuming,
    Running,
    Ready,
    Suspended,
    Error,
    Destroyed,
}

impl SandboxStatus {
    /// Statuses that count as "active" for ensure/reconcile purposes.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Resuming | Self::Running | Self::Ready
        )
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Resuming => "resuming",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Suspended => "suspended",
            Self::Error => "error",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

impl FromStr for SandboxStatus {
    type Err = SandboxStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "resuming" => Ok(Self::Resuming),
            "running" => Ok(Self::Running),
            "ready" => Ok(Self::Ready),
            "suspended" => Ok(Self::Suspended),
            "error" => Ok(Self::Error),
            "destroyed" => Ok(Self::Destroyed),
            other => Err(SandboxStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SandboxStatus`] string.
#[derive(Debug, Clone)]
pub struct SandboxStatusParseError(pub String);

impl fmt::Display for SandboxStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid sandbox status: {:?}", self.0)
    }
}

impl std::error::Error for SandboxStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a durable sandbox task in the dispatch queue.
///
/// `completed`, `failed`, and `canceled` are terminal: no query ever moves a
/// row out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SandboxTaskStatus {
    Queued,
    Retry,
    Dispatched,
    Acked,
    Completed,
    Failed,
    Canceled,
}

impl SandboxTaskStatus {
    /// Statuses eligible for dispatch.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Queued | Self::Retry)
    }

    /// Statuses that participate in idempotency and tenant-drain scans.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Retry | Self::Dispatched | Self::Acked
        )
    }

    /// Terminal sinks.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for SandboxTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Retry => "retry",
            Self::Dispatched => "dispatched",
            Self::Acked => "acked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl FromStr for SandboxTaskStatus {
    type Err = SandboxTaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "retry" => Ok(Self::Retry),
            "dispatched" => Ok(Self::Dispatched),
            "acked" => Ok(Self::Acked),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(SandboxTaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SandboxTaskStatus`] string.
#[derive(Debug, Clone)]
pub struct SandboxTaskStatusParseError(pub String);

impl fmt::Display for SandboxTaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid sandbox task status: {:?}", self.0)
    }
}

impl std::error::Error for SandboxTaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Type of an inter-agent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InterAgentMessageType {
    Progress,
    Query,
    Response,
    Blocker,
    Delegation,
    ReviewRequest,
}

impl fmt::Display for InterAgentMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Progress => "progress",
            Self::Query => "query",
            Self::Response => "response",
            Self::Blocker => "blocker",
            Self::Delegation => "delegation",
            Self::ReviewRequest => "review_request",
        };
        f.write_str(s)
    }
}

impl FromStr for InterAgentMessageType {
    type Err = InterAgentMessageTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "progress" => Ok(Self::Progress),
            "query" => Ok(Self::Query),
            "response" => Ok(Self::Response),
            "blocker" => Ok(Self::Blocker),
            "delegation" => Ok(Self::Delegation),
            "review_request" => Ok(Self::ReviewRequest),
            other => Err(InterAgentMessageTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InterAgentMessageType`] string.
#[derive(Debug, Clone)]
pub struct InterAgentMessageTypeParseError(pub String);

impl fmt::Display for InterAgentMessageTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid inter-agent message type: {:?}", self.0)
    }
}

impl std::error::Error for InterAgentMessageTypeParseError {}

// ---------------------------------------------------------------------------

/// Role of an entry in the per-agent message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentMessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for AgentMessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentMessageRole {
    type Err = AgentMessageRoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(AgentMessageRoleParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentMessageRole`] string.
#[derive(Debug, Clone)]
pub struct AgentMessageRoleParseError(pub String);

impl fmt::Display for AgentMessageRoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent message role: {:?}", self.0)
    }
}

impl std::error::Error for AgentMessageRoleParseError {}

// ---------------------------------------------------------------------------

/// Kind of an entry in the per-agent message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentMessageKind {
    Text,
    ToolUse,
    ToolResult,
    ApprovalRequest,
    StatusHint,
}

impl fmt::Display for AgentMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Text => "text",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::ApprovalRequest => "approval_request",
            Self::StatusHint => "status_hint",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentMessageKind {
    type Err = AgentMessageKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "tool_use" => Ok(Self::ToolUse),
            "tool_result" => Ok(Self::ToolResult),
            "approval_request" => Ok(Self::ApprovalRequest),
            "status_hint" => Ok(Self::StatusHint),
            other => Err(AgentMessageKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentMessageKind`] string.
#[derive(Debug, Clone)]
pub struct AgentMessageKindParseError(pub String);

impl fmt::Display for AgentMessageKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent message kind: {:?}", self.0)
    }
}

impl std::error::Error for AgentMessageKindParseError {}

// ---------------------------------------------------------------------------

/// Status of a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for BackupStatus {
    type Err = BackupStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(BackupStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BackupStatus`] string.
#[derive(Debug, Clone)]
pub struct BackupStatusParseError(pub String);

impl fmt::Display for BackupStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid backup status: {:?}", self.0)
    }
}

impl std::error::Error for BackupStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A tenant sandbox -- a pod-backed execution environment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Sandbox {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub status: SandboxStatus,
    pub runner_id: Option<Uuid>,
    pub pod_name: Option<String>,
    pub context: serde_json::Value,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A durable unit of work queued against a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SandboxTask {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub sandbox_id: Uuid,
    pub task_type: String,
    pub status: SandboxTaskStatus,
    pub payload: serde_json::Value,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub idempotency_key: Option<String>,
    pub runner_id: Option<Uuid>,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A message exchanged between agents; both transport record and audit row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InterAgentMessage {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub from_agent_id: String,
    pub to_agent_id: Option<String>,
    pub message_type: InterAgentMessageType,
    pub subject: String,
    pub content: String,
    pub priority: i32,
    pub requires_response: bool,
    pub response_to_id: Option<Uuid>,
    pub read_at: Option<DateTime<Utc>>,
    pub responded_at: Option<DateTime<Utc>>,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One entry in the per-agent message log.
///
/// `message_num` is strictly monotonic per agent, across resumes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentMessage {
    pub id: i64,
    pub organization_id: Uuid,
    pub agent_id: String,
    pub message_num: i32,
    pub role: AgentMessageRole,
    pub kind: AgentMessageKind,
    pub content: String,
    pub extra: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Operational heartbeat/usage state for a running agent.
///
/// Updated every heartbeat tick; never written to the graph.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentState {
    pub agent_id: String,
    pub organization_id: Uuid,
    pub status: String,
    pub tokens_used: i64,
    pub cost_usd: f64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Bookkeeping row for a backup archive.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Backup {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub status: BackupStatus,
    pub archive_path: Option<String>,
    pub size_bytes: Option<i64>,
    pub pg_entities: Option<i64>,
    pub graph_entities: Option<i64>,
    pub graph_relationships: Option<i64>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_status_display_roundtrip() {
        let variants = [
            SandboxStatus::Creating,
            SandboxStatus::Resuming,
            SandboxStatus::Running,
            SandboxStatus::Ready,
            SandboxStatus::Suspended,
            SandboxStatus::Error,
            SandboxStatus::Destroyed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: SandboxStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn sandbox_status_invalid() {
        assert!("hibernating".parse::<SandboxStatus>().is_err());
    }

    #[test]
    fn sandbox_status_classification() {
        assert!(SandboxStatus::Running.is_active());
        assert!(SandboxStatus::Creating.is_active());
        assert!(!SandboxStatus::Suspended.is_active());
        assert!(SandboxStatus::Destroyed.is_terminal());
        assert!(!SandboxStatus::Error.is_terminal());
    }

    #[test]
    fn sandbox_task_status_display_roundtrip() {
        let variants = [
            SandboxTaskStatus::Queued,
            SandboxTaskStatus::Retry,
            SandboxTaskStatus::Dispatched,
            SandboxTaskStatus::Acked,
            SandboxTaskStatus::Completed,
            SandboxTaskStatus::Failed,
            SandboxTaskStatus::Canceled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: SandboxTaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn sandbox_task_status_invalid() {
        assert!("paused".parse::<SandboxTaskStatus>().is_err());
    }

    #[test]
    fn sandbox_task_status_classification() {
        assert!(SandboxTaskStatus::Queued.is_pending());
        assert!(SandboxTaskStatus::Retry.is_pending());
        assert!(!SandboxTaskStatus::Dispatched.is_pending());
        assert!(SandboxTaskStatus::Acked.is_live());
        assert!(!SandboxTaskStatus::Completed.is_live());
        assert!(SandboxTaskStatus::Completed.is_terminal());
        assert!(SandboxTaskStatus::Failed.is_terminal());
        assert!(SandboxTaskStatus::Canceled.is_terminal());
        assert!(!SandboxTaskStatus::Acked.is_terminal());
    }

    #[test]
    fn inter_agent_message_type_display_roundtrip() {
        let variants = [
            InterAgentMessageType::Progress,
            InterAgentMessageType::Query,
            InterAgentMessageType::Response,
            InterAgentMessageType::Blocker,
            InterAgentMessageType::Delegation,
            InterAgentMessageType::ReviewRequest,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: InterAgentMessageType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn inter_agent_message_type_invalid() {
        assert!("gossip".parse::<InterAgentMessageType>().is_err());
    }

    #[test]
    fn agent_message_role_display_roundtrip() {
        for v in &[
            AgentMessageRole::User,
            AgentMessageRole::Assistant,
            AgentMessageRole::System,
        ] {
            let parsed: AgentMessageRole = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_message_kind_display_roundtrip() {
        for v in &[
            AgentMessageKind::Text,
            AgentMessageKind::ToolUse,
            AgentMessageKind::ToolResult,
            AgentMessageKind::ApprovalRequest,
            AgentMessageKind::StatusHint,
        ] {
            let parsed: AgentMessageKind = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn backup_status_display_roundtrip() {
        for v in &[
            BackupStatus::Pending,
            BackupStatus::InProgress,
            BackupStatus::Completed,
            BackupStatus::Failed,
        ] {
            let parsed: BackupStatus = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn backup_status_invalid() {
        assert!("archived".parse::<BackupStatus>().is_err());
    }
}

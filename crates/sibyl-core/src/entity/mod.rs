//! Org-scoped typed entity graph.
//!
//! The graph engine stores untyped nodes; typed consumers live here. Every
//! entity shares the identity envelope ([`Entity`]) and a free-form
//! `metadata` map. Strongly-typed records ([`records`]) project their
//! fields onto `metadata` on write and coerce back on read -- that
//! projection is the contract between the untyped graph and typed callers.

pub mod graph;
pub mod pending;
pub mod records;
pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of entity kinds the core owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Epic,
    Project,
    Agent,
    Worktree,
    Approval,
    AgentCheckpoint,
    TaskOrchestrator,
    MetaOrchestrator,
    Learning,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Task => "task",
            Self::Epic => "epic",
            Self::Project => "project",
            Self::Agent => "agent",
            Self::Worktree => "worktree",
            Self::Approval => "approval",
            Self::AgentCheckpoint => "agent_checkpoint",
            Self::TaskOrchestrator => "task_orchestrator",
            Self::MetaOrchestrator => "meta_orchestrator",
            Self::Learning => "learning",
        };
        f.write_str(s)
    }
}

impl FromStr for EntityKind {
    type Err = EntityKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "epic" => Ok(Self::Epic),
            "project" => Ok(Self::Project),
            "agent" => Ok(Self::Agent),
            "worktree" => Ok(Self::Worktree),
            "approval" => Ok(Self::Approval),
            "agent_checkpoint" => Ok(Self::AgentCheckpoint),
            "task_orchestrator" => Ok(Self::TaskOrchestrator),
            "meta_orchestrator" => Ok(Self::MetaOrchestrator),
            "learning" => Ok(Self::Learning),
            other => Err(EntityKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EntityKind`] string.
#[derive(Debug, Clone)]
pub struct EntityKindParseError(pub String);

impl fmt::Display for EntityKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid entity kind: {:?}", self.0)
    }
}

impl std::error::Error for EntityKindParseError {}

/// Relationship types between entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    BelongsTo,
    WorksOn,
    ManagedBy,
    Orchestrates,
    RelatedTo,
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BelongsTo => "BELONGS_TO",
            Self::WorksOn => "WORKS_ON",
            Self::ManagedBy => "MANAGED_BY",
            Self::Orchestrates => "ORCHESTRATES",
            Self::RelatedTo => "RELATED_TO",
        };
        f.write_str(s)
    }
}

/// The identity envelope shared by every entity.
///
/// `metadata` carries typed extensions: each record type in [`records`]
/// projects its specific fields here on write and coerces them back on
/// read. Unknown keys round-trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub name: String,
    pub organization_id: String,
    pub created_by: Option<String>,
    pub modified_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl Entity {
    /// Build a fresh entity with empty metadata and `now` timestamps.
    pub fn new(
        id: impl Into<String>,
        kind: EntityKind,
        name: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            organization_id: organization_id.into(),
            created_by: None,
            modified_by: None,
            created_at: now,
            updated_at: now,
            metadata: Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata coercion helpers
// ---------------------------------------------------------------------------
//
// Centralized so every record type normalizes the same way: datetimes as
// ISO-8601 strings, enums as their snake_case value, lists as JSON arrays.

pub(crate) fn get_str<'a>(meta: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    meta.get(key).and_then(Value::as_str)
}

pub(crate) fn get_string(meta: &Map<String, Value>, key: &str) -> Option<String> {
    get_str(meta, key).map(str::to_owned)
}

pub(crate) fn get_bool(meta: &Map<String, Value>, key: &str) -> Option<bool> {
    meta.get(key).and_then(Value::as_bool)
}

pub(crate) fn get_f64(meta: &Map<String, Value>, key: &str) -> Option<f64> {
    meta.get(key).and_then(Value::as_f64)
}

pub(crate) fn get_i64(meta: &Map<String, Value>, key: &str) -> Option<i64> {
    meta.get(key).and_then(Value::as_i64)
}

pub(crate) fn get_u32(meta: &Map<String, Value>, key: &str) -> Option<u32> {
    get_i64(meta, key).and_then(|n| u32::try_from(n).ok())
}

pub(crate) fn get_datetime(meta: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    get_str(meta, key)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn get_string_vec(meta: &Map<String, Value>, key: &str) -> Vec<String> {
    meta.get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn put(meta: &mut Map<String, Value>, key: &str, value: Value) {
    meta.insert(key.to_owned(), value);
}

pub(crate) fn put_opt_str(meta: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        meta.insert(key.to_owned(), Value::String(v.to_owned()));
    }
}

pub(crate) fn put_opt_datetime(
    meta: &mut Map<String, Value>,
    key: &str,
    value: Option<DateTime<Utc>>,
) {
    if let Some(v) = value {
        meta.insert(key.to_owned(), Value::String(v.to_rfc3339()));
    }
}

pub(crate) fn put_datetime(meta: &mut Map<String, Value>, key: &str, value: DateTime<Utc>) {
    meta.insert(key.to_owned(), Value::String(value.to_rfc3339()));
}

pub(crate) fn put_string_vec(meta: &mut Map<String, Value>, key: &str, values: &[String]) {
    meta.insert(
        key.to_owned(),
        Value::Array(values.iter().map(|v| Value::String(v.clone())).collect()),
    );
}

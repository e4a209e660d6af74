//! The graph-engine contract and an in-process implementation.
//!
//! The production deployment fronts a graph store with hybrid
//! keyword+vector search; the core only depends on this trait. Nodes carry
//! primitive properties (nested data is JSON-stringified by the caller)
//! plus an optional embedding vector. Every operation is scoped by
//! `org_id` -- the trait has no way to express a cross-tenant read.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A node as the graph engine stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub org_id: String,
    /// Entity kind label, e.g. "task".
    pub label: String,
    pub name: String,
    /// Flat primitive properties. Nested data arrives JSON-stringified.
    pub properties: Map<String, Value>,
    /// Stored as a vector property; cleared by assigning `None`.
    pub name_embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub org_id: String,
    pub source_id: String,
    pub target_id: String,
    pub edge_type: String,
}

/// A full org export, used by backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphExport {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Minimum query surface the core requires of a graph engine.
///
/// Object-safe so services can hold `Arc<dyn GraphStore>`.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// MERGE-by-id upsert. An existing node keeps its `created_at` and has
    /// its properties overwritten; a new node is inserted as given.
    async fn merge_node(&self, node: GraphNode) -> Result<()>;

    /// `SET n += $props` semantics: merge the given properties into the
    /// node. Returns `false` when the node does not exist in the org.
    async fn set_properties(
        &self,
        org_id: &str,
        id: &str,
        props: Map<String, Value>,
    ) -> Result<bool>;

    /// Fetch a node by id within the org.
    async fn get_node(&self, org_id: &str, id: &str) -> Result<Option<GraphNode>>;

    /// DETACH DELETE: remove the node and every edge touching it.
    /// Idempotent.
    async fn delete_node(&self, org_id: &str, id: &str) -> Result<()>;

    /// List nodes with the given label, newest first. `prop_filters` are
    /// exact matches pushed into the graph query (top-level properties
    /// only; metadata-resident filters are evaluated by the caller).
    async fn list_nodes(
        &self,
        org_id: &str,
        label: &str,
        prop_filters: &Map<String, Value>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GraphNode>>;

    /// Count nodes, optionally narrowed by label.
    async fn count_nodes(&self, org_id: &str, label: Option<&str>) -> Result<u64>;

    /// Create a directed edge. Duplicate edges are a no-op.
    async fn create_edge(&self, edge: GraphEdge) -> Result<()>;

    /// Outgoing edges from a node.
    async fn edges_from(&self, org_id: &str, id: &str) -> Result<Vec<GraphEdge>>;

    /// Incoming edges to a node.
    async fn edges_to(&self, org_id: &str, id: &str) -> Result<Vec<GraphEdge>>;

    /// Hybrid keyword+vector search scoped to the org. Returns nodes with
    /// a descending relevance score. The caller sanitizes the query.
    async fn search(
        &self,
        org_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(GraphNode, f64)>>;

    /// Count edges in the org.
    async fn count_edges(&self, org_id: &str) -> Result<u64>;

    /// Serialize every node and edge in the org.
    async fn export(&self, org_id: &str) -> Result<GraphExport>;
}

// Compile-time assertion: GraphStore must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn GraphStore) {}
};

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryGraphState {
    /// Keyed by (org_id, node_id).
    nodes: HashMap<(String, String), GraphNode>,
    edges: Vec<GraphEdge>,
}

/// In-process [`GraphStore`] used by tests and embedded deployments.
///
/// Search is a naive token-overlap scorer standing in for the engine's
/// hybrid search; relevance ordering is what callers depend on, not
/// absolute scores.
#[derive(Default)]
pub struct MemoryGraph {
    state: RwLock<MemoryGraphState>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

fn token_overlap_score(query: &str, node: &GraphNode) -> f64 {
    let query_tokens: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_owned)
        .collect();
    if query_tokens.is_empty() {
        return 0.0;
    }

    let mut haystack = node.name.to_lowercase();
    for value in node.properties.values() {
        if let Some(s) = value.as_str() {
            haystack.push(' ');
            haystack.push_str(&s.to_lowercase());
        }
    }

    let hits = query_tokens
        .iter()
        .filter(|t| haystack.contains(t.as_str()))
        .count();
    hits as f64 / query_tokens.len() as f64
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn merge_node(&self, node: GraphNode) -> Result<()> {
        let mut state = self.state.write().expect("graph lock poisoned");
        let key = (node.org_id.clone(), node.id.clone());
        match state.nodes.get_mut(&key) {
            Some(existing) => {
                // MERGE semantics: created_at is set once at first write.
                let created_at = existing.created_at;
                *existing = node;
                existing.created_at = created_at;
            }
            None => {
                state.nodes.insert(key, node);
            }
        }
        Ok(())
    }

    async fn set_properties(
        &self,
        org_id: &str,
        id: &str,
        props: Map<String, Value>,
    ) -> Result<bool> {
        let mut state = self.state.write().expect("graph lock poisoned");
        let key = (org_id.to_owned(), id.to_owned());
        match state.nodes.get_mut(&key) {
            Some(node) => {
                for (k, v) in props {
                    match k.as_str() {
                        "name" => {
                            if let Some(s) = v.as_str() {
                                node.name = s.to_owned();
                            }
                        }
                        "updated_at" => {
                            if let Some(ts) = v
                                .as_str()
                                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                            {
                                node.updated_at = ts.with_timezone(&Utc);
                            }
                        }
                        _ => {
                            node.properties.insert(k, v);
                        }
                    }
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_node(&self, org_id: &str, id: &str) -> Result<Option<GraphNode>> {
        let state = self.state.read().expect("graph lock poisoned");
        Ok(state
            .nodes
            .get(&(org_id.to_owned(), id.to_owned()))
            .cloned())
    }

    async fn delete_node(&self, org_id: &str, id: &str) -> Result<()> {
        let mut state = self.state.write().expect("graph lock poisoned");
        state.nodes.remove(&(org_id.to_owned(), id.to_owned()));
        state
            .edges
            .retain(|e| !(e.org_id == org_id && (e.source_id == id || e.target_id == id)));
        Ok(())
    }

    async fn list_nodes(
        &self,
        org_id: &str,
        label: &str,
        prop_filters: &Map<String, Value>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GraphNode>> {
        let state = self.state.read().expect("graph lock poisoned");
        let mut nodes: Vec<GraphNode> = state
            .nodes
            .values()
            .filter(|n| n.org_id == org_id && n.label == label)
            .filter(|n| {
                prop_filters
                    .iter()
                    .all(|(k, v)| n.properties.get(k) == Some(v))
            })
            .cloned()
            .collect();
        nodes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(nodes.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_nodes(&self, org_id: &str, label: Option<&str>) -> Result<u64> {
        let state = self.state.read().expect("graph lock poisoned");
        let count = state
            .nodes
            .values()
            .filter(|n| n.org_id == org_id && label.is_none_or(|l| n.label == l))
            .count();
        Ok(count as u64)
    }

    async fn create_edge(&self, edge: GraphEdge) -> Result<()> {
        let mut state = self.state.write().expect("graph lock poisoned");
        if !state.edges.contains(&edge) {
            state.edges.push(edge);
        }
        Ok(())
    }

    async fn edges_from(&self, org_id: &str, id: &str) -> Result<Vec<GraphEdge>> {
        let state = self.state.read().expect("graph lock poisoned");
        Ok(state
            .edges
            .iter()
            .filter(|e| e.org_id == org_id && e.source_id == id)
            .cloned()
            .collect())
    }

    async fn edges_to(&self, org_id: &str, id: &str) -> Result<Vec<GraphEdge>> {
        let state = self.state.read().expect("graph lock poisoned");
        Ok(state
            .edges
            .iter()
            .filter(|e| e.org_id == org_id && e.target_id == id)
            .cloned()
            .collect())
    }

    async fn search(
        &self,
        org_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(GraphNode, f64)>> {
        let state = self.state.read().expect("graph lock poisoned");
        let mut scored: Vec<(GraphNode, f64)> = state
            .nodes
            .values()
            .filter(|n| n.org_id == org_id)
            .map(|n| (n.clone(), token_overlap_score(query, n)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn count_edges(&self, org_id: &str) -> Result<u64> {
        let state = self.state.read().expect("graph lock poisoned");
        Ok(state.edges.iter().filter(|e| e.org_id == org_id).count() as u64)
    }

    async fn export(&self, org_id: &str) -> Result<GraphExport> {
        let state = self.state.read().expect("graph lock poisoned");
        let mut nodes: Vec<GraphNode> = state
            .nodes
            .values()
            .filter(|n| n.org_id == org_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let edges: Vec<GraphEdge> = state
            .edges
            .iter()
            .filter(|e| e.org_id == org_id)
            .cloned()
            .collect();
        Ok(GraphExport { nodes, edges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(org: &str, id: &str, label: &str, name: &str) -> GraphNode {
        let now = Utc::now();
        GraphNode {
            id: id.to_owned(),
            org_id: org.to_owned(),
            label: label.to_owned(),
            name: name.to_owned(),
            properties: Map::new(),
            name_embedding: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn merge_preserves_created_at() {
        let graph = MemoryGraph::new();
        let first = node("org1", "n1", "task", "original");
        let original_created = first.created_at;
        graph.merge_node(first).await.unwrap();

        let mut second = node("org1", "n1", "task", "replaced");
        second.created_at = Utc::now() + chrono::Duration::hours(1);
        graph.merge_node(second).await.unwrap();

        let fetched = graph.get_node("org1", "n1").await.unwrap().unwrap();
        assert_eq!(fetched.name, "replaced");
        assert_eq!(fetched.created_at, original_created);
    }

    #[tokio::test]
    async fn org_scoping_isolates_nodes() {
        let graph = MemoryGraph::new();
        graph.merge_node(node("org1", "n1", "task", "a")).await.unwrap();
        graph.merge_node(node("org2", "n2", "task", "b")).await.unwrap();

        assert!(graph.get_node("org1", "n2").await.unwrap().is_none());
        assert!(graph.get_node("org2", "n1").await.unwrap().is_none());
        assert_eq!(graph.count_nodes("org1", None).await.unwrap(), 1);

        let listed = graph
            .list_nodes("org1", "task", &Map::new(), 10, 0)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "n1");
    }

    #[tokio::test]
    async fn detach_delete_removes_edges() {
        let graph = MemoryGraph::new();
        graph.merge_node(node("org1", "a", "task", "a")).await.unwrap();
        graph.merge_node(node("org1", "b", "epic", "b")).await.unwrap();
        graph
            .create_edge(GraphEdge {
                org_id: "org1".to_owned(),
                source_id: "a".to_owned(),
                target_id: "b".to_owned(),
                edge_type: "BELONGS_TO".to_owned(),
            })
            .await
            .unwrap();

        graph.delete_node("org1", "a").await.unwrap();
        assert!(graph.edges_to("org1", "b").await.unwrap().is_empty());
        // Deleting again is a no-op.
        graph.delete_node("org1", "a").await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_edges_are_ignored() {
        let graph = MemoryGraph::new();
        let edge = GraphEdge {
            org_id: "org1".to_owned(),
            source_id: "a".to_owned(),
            target_id: "b".to_owned(),
            edge_type: "WORKS_ON".to_owned(),
        };
        graph.create_edge(edge.clone()).await.unwrap();
        graph.create_edge(edge).await.unwrap();
        assert_eq!(graph.count_edges("org1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn search_ranks_by_overlap() {
        let graph = MemoryGraph::new();
        graph
            .merge_node(node("org1", "n1", "task", "implement auth middleware"))
            .await
            .unwrap();
        graph
            .merge_node(node("org1", "n2", "task", "write docs"))
            .await
            .unwrap();

        let results = graph.search("org1", "auth middleware", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, "n1");
        assert!(results[0].1 > 0.9);
    }

    #[tokio::test]
    async fn set_properties_returns_false_for_missing() {
        let graph = MemoryGraph::new();
        let updated = graph
            .set_properties("org1", "ghost", Map::new())
            .await
            .unwrap();
        assert!(!updated);
    }
}

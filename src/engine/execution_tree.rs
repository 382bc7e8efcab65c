//! Execution Tree / Step Log (C2).
//!
//! A per-turn, append-only record of every agent, tool, decision, and
//! synthesis node. Nodes are never deleted; once completed or failed their
//! fields are immutable. The tree tracks a `current_parent` cursor so
//! callers can nest nodes without passing parent ids around everywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// The kind of work a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Agent,
    Tool,
    Decision,
    Synthesis,
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One node in the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub kind: NodeKind,
    pub name: String,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub input_summary: Option<String>,
    pub output_summary: Option<String>,
    pub input_data: Option<serde_json::Value>,
    pub output_data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

struct TreeState {
    nodes: Vec<Node>,
    current_parent: Option<u64>,
    next_id: u64,
}

/// The execution tree for one turn. Safe to share across concurrent
/// sub-tasks within the turn — all mutation goes through an internal lock.
pub struct ExecutionTree {
    state: Mutex<TreeState>,
}

impl ExecutionTree {
    /// Create a tree with a root query node already started and current.
    pub fn new(query_summary: impl Into<String>) -> Self {
        let root = Node {
            id: 0,
            parent_id: None,
            kind: NodeKind::Decision,
            name: "query".to_string(),
            status: NodeStatus::Running,
            started_at: Some(Utc::now()),
            ended_at: None,
            duration_ms: None,
            input_summary: Some(query_summary.into()),
            output_summary: None,
            input_data: None,
            output_data: None,
            error: None,
            metadata: HashMap::new(),
        };
        ExecutionTree {
            state: Mutex::new(TreeState {
                nodes: vec![root],
                current_parent: Some(0),
                next_id: 1,
            }),
        }
    }

    pub fn root_id(&self) -> u64 {
        0
    }

    /// Start a new running node under the current parent (or an explicit
    /// one), returning its id.
    pub fn start_node(
        &self,
        name: impl Into<String>,
        kind: NodeKind,
        parent_id: Option<u64>,
        input_summary: Option<String>,
        input_data: Option<serde_json::Value>,
    ) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let parent = parent_id.or(state.current_parent);
        state.nodes.push(Node {
            id,
            parent_id: parent,
            kind,
            name: name.into(),
            status: NodeStatus::Running,
            started_at: Some(Utc::now()),
            ended_at: None,
            duration_ms: None,
            input_summary,
            output_summary: None,
            input_data,
            output_data: None,
            error: None,
            metadata: HashMap::new(),
        });
        state.current_parent = Some(id);
        id
    }

    /// Mark a node completed, popping the cursor back to its parent.
    pub fn complete_node(
        &self,
        node_id: u64,
        output_summary: impl Into<String>,
        output_data: Option<serde_json::Value>,
    ) {
        let mut state = self.state.lock().unwrap();
        let parent_id = {
            let node = Self::find_mut(&mut state.nodes, node_id);
            let now = Utc::now();
            node.status = NodeStatus::Completed;
            node.ended_at = Some(now);
            node.output_summary = Some(output_summary.into());
            node.output_data = output_data;
            if let Some(started) = node.started_at {
                node.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
            }
            node.parent_id
        };
        state.current_parent = parent_id;
    }

    /// Mark a node failed, popping the cursor back to its parent. Does not
    /// implicitly fail ancestors.
    pub fn fail_node(&self, node_id: u64, error: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        let parent_id = {
            let node = Self::find_mut(&mut state.nodes, node_id);
            let now = Utc::now();
            node.status = NodeStatus::Failed;
            node.ended_at = Some(now);
            node.error = Some(error.into());
            if let Some(started) = node.started_at {
                node.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
            }
            node.parent_id
        };
        state.current_parent = parent_id;
    }

    /// Mark a node skipped. No timing is recorded.
    pub fn skip_node(&self, node_id: u64, reason: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        let node = Self::find_mut(&mut state.nodes, node_id);
        node.status = NodeStatus::Skipped;
        node.error = Some(reason.into());
    }

    /// Attach metadata to an existing node (e.g. a dedup annotation).
    pub fn annotate(&self, node_id: u64, key: impl Into<String>, value: serde_json::Value) {
        let mut state = self.state.lock().unwrap();
        let node = Self::find_mut(&mut state.nodes, node_id);
        node.metadata.insert(key.into(), value);
    }

    fn find_mut(nodes: &mut [Node], id: u64) -> &mut Node {
        nodes
            .iter_mut()
            .find(|n| n.id == id)
            .expect("node id must exist in this tree")
    }

    /// Snapshot every node for persistence or UI rendering.
    pub fn to_dict(&self) -> Vec<Node> {
        self.state.lock().unwrap().nodes.clone()
    }

    /// Count of nodes per status, for metadata summaries.
    pub fn stats(&self) -> HashMap<&'static str, usize> {
        let state = self.state.lock().unwrap();
        let mut stats = HashMap::new();
        for node in &state.nodes {
            let key = match node.status {
                NodeStatus::Pending => "pending",
                NodeStatus::Running => "running",
                NodeStatus::Completed => "completed",
                NodeStatus::Failed => "failed",
                NodeStatus::Skipped => "skipped",
            };
            *stats.entry(key).or_insert(0) += 1;
        }
        stats
    }

    /// Longest root-to-leaf path length, used to enforce the graph depth
    /// bound (§8 invariant 8).
    pub fn max_depth(&self) -> usize {
        let state = self.state.lock().unwrap();
        let mut depth_of: HashMap<u64, usize> = HashMap::new();
        depth_of.insert(0, 0);
        // Nodes are appended after their parent, so a single forward pass
        // suffices.
        for node in &state.nodes {
            if node.id == 0 {
                continue;
            }
            let parent_depth = node.parent_id.and_then(|p| depth_of.get(&p)).copied().unwrap_or(0);
            depth_of.insert(node.id, parent_depth + 1);
        }
        depth_of.values().copied().max().unwrap_or(0)
    }

    /// Number of non-root nodes that reached a terminal status — used to
    /// check §8 invariant 4 (persisted step count).
    pub fn terminal_node_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .iter()
            .filter(|n| {
                n.id != 0
                    && matches!(
                        n.status,
                        NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
                    )
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_starts_running() {
        let tree = ExecutionTree::new("what is the sentiment");
        let nodes = tree.to_dict();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, NodeStatus::Running);
    }

    #[test]
    fn nested_nodes_track_parent_cursor() {
        let tree = ExecutionTree::new("q");
        let agent = tree.start_node("sentiment_analysis", NodeKind::Agent, None, None, None);
        let tool = tree.start_node("get_dataset_data", NodeKind::Tool, None, None, None);
        tree.complete_node(tool, "fetched 40 rows", None);
        tree.complete_node(agent, "done", None);

        let nodes = tree.to_dict();
        let tool_node = nodes.iter().find(|n| n.id == tool).unwrap();
        let agent_node = nodes.iter().find(|n| n.id == agent).unwrap();
        assert_eq!(tool_node.parent_id, Some(agent));
        assert_eq!(agent_node.parent_id, Some(0));
        assert_eq!(agent_node.status, NodeStatus::Completed);
    }

    #[test]
    fn failed_node_does_not_fail_ancestors() {
        let tree = ExecutionTree::new("q");
        let agent = tree.start_node("sentiment_analysis", NodeKind::Agent, None, None, None);
        let tool = tree.start_node("get_dataset_data", NodeKind::Tool, None, None, None);
        tree.fail_node(tool, "downstream unavailable");
        tree.complete_node(agent, "recovered", None);

        let nodes = tree.to_dict();
        let agent_node = nodes.iter().find(|n| n.id == agent).unwrap();
        assert_eq!(agent_node.status, NodeStatus::Completed);
    }

    #[test]
    fn max_depth_reflects_longest_chain() {
        let tree = ExecutionTree::new("q");
        let a = tree.start_node("a", NodeKind::Agent, None, None, None);
        let b = tree.start_node("b", NodeKind::Tool, Some(a), None, None);
        tree.start_node("c", NodeKind::Tool, Some(b), None, None);
        assert_eq!(tree.max_depth(), 3);
    }

    #[test]
    fn terminal_node_count_excludes_root_and_running() {
        let tree = ExecutionTree::new("q");
        let a = tree.start_node("a", NodeKind::Agent, None, None, None);
        tree.complete_node(a, "ok", None);
        let b = tree.start_node("b", NodeKind::Agent, None, None, None);
        tree.fail_node(b, "err");
        tree.start_node("c", NodeKind::Agent, None, None, None);
        assert_eq!(tree.terminal_node_count(), 2);
    }
}

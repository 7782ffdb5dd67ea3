//! Mutable dependency graph with status tracking.
//!
//! The graph holds one node per unit of work and an edge for every
//! "must wait for" relationship. Node status advances `ready → running →
//! finished`; the single exception is a voluntary yield back to `ready`,
//! which only the orchestrator may request when affinity pinning is on.
//!
//! Free-node discovery is O(nodes) but backed by a pending-dependency
//! counter per node, so a scan only compares integers. Cycles are rejected
//! the moment the closing edge is added.

use serde::Serialize;

use crate::error::{CoreError, CoreResult};

/// Index of a node, assigned in insertion order.
pub type NodeId = usize;

/// Lifecycle status of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Not yet started.
    Ready,
    /// Picked up by a worker.
    Running,
    /// Completed; successors no longer wait for it.
    Finished,
}

#[derive(Debug)]
struct NodeEntry<T> {
    payload: T,
    status: NodeStatus,
    /// Immediate predecessors: nodes this one waits for.
    dependencies: Vec<NodeId>,
    /// Immediate successors: nodes waiting for this one.
    dependents: Vec<NodeId>,
    /// Unfinished dependencies remaining.
    pending: usize,
}

/// A dynamic DAG of work items of type `T`.
///
/// # Example
///
/// ```
/// use drover::exec::graph::{DynamicGraph, NodeStatus};
///
/// let mut graph = DynamicGraph::new();
/// let a = graph.add_node("a");
/// let b = graph.add_node("b");
/// graph.add_edge(b, a)?; // b waits for a
///
/// assert_eq!(graph.free_nodes(), vec![a]);
/// graph.set_status(a, NodeStatus::Running)?;
/// graph.set_status(a, NodeStatus::Finished)?;
/// assert_eq!(graph.free_nodes(), vec![b]);
/// # Ok::<(), drover::CoreError>(())
/// ```
#[derive(Debug)]
pub struct DynamicGraph<T> {
    nodes: Vec<NodeEntry<T>>,
    finished: usize,
}

impl<T> Default for DynamicGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DynamicGraph<T> {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            finished: 0,
        }
    }

    /// Adds a node in `ready` status and returns its id.
    pub fn add_node(&mut self, payload: T) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(NodeEntry {
            payload,
            status: NodeStatus::Ready,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            pending: 0,
        });
        id
    }

    /// Declares that `from` must wait until `to` is finished.
    ///
    /// Duplicate edges are ignored.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown ids, self-edges, and
    /// edges that would close a cycle.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> CoreResult<()> {
        if from >= self.nodes.len() || to >= self.nodes.len() {
            return Err(CoreError::Config(format!(
                "edge ({from}, {to}) references a node outside the graph"
            )));
        }
        if from == to {
            return Err(CoreError::Config(format!(
                "node {from} cannot depend on itself"
            )));
        }
        if self.nodes[from].dependencies.contains(&to) {
            return Ok(());
        }
        if self.reaches(to, from) {
            return Err(CoreError::Config(format!(
                "dependency cycle: node {to} already waits for node {from}"
            )));
        }

        self.nodes[from].dependencies.push(to);
        self.nodes[to].dependents.push(from);
        if self.nodes[to].status != NodeStatus::Finished {
            self.nodes[from].pending += 1;
        }
        Ok(())
    }

    /// Depth-first reachability along dependency edges.
    fn reaches(&self, start: NodeId, target: NodeId) -> bool {
        let mut stack = vec![start];
        let mut visited = vec![false; self.nodes.len()];
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if std::mem::replace(&mut visited[node], true) {
                continue;
            }
            stack.extend(self.nodes[node].dependencies.iter().copied());
        }
        false
    }

    /// Advances a node's status.
    ///
    /// Only `ready → running` and `running → finished` are legal here;
    /// yielding back to `ready` goes through [`DynamicGraph::yield_node`].
    ///
    /// # Errors
    ///
    /// Returns a lifecycle error for any other transition.
    pub fn set_status(&mut self, node: NodeId, status: NodeStatus) -> CoreResult<()> {
        let current = self.status_checked(node)?;
        match (current, status) {
            (NodeStatus::Ready, NodeStatus::Running) => {
                self.nodes[node].status = NodeStatus::Running;
                Ok(())
            }
            (NodeStatus::Running, NodeStatus::Finished) => {
                self.nodes[node].status = NodeStatus::Finished;
                self.finished += 1;
                let dependents = self.nodes[node].dependents.clone();
                for dependent in dependents {
                    self.nodes[dependent].pending -= 1;
                }
                Ok(())
            }
            (from, to) => Err(CoreError::Lifecycle(format!(
                "node {node} cannot move from {from:?} to {to:?}"
            ))),
        }
    }

    /// Returns a running node to `ready` after a voluntary yield.
    ///
    /// # Errors
    ///
    /// Returns a lifecycle error when the node is not running.
    pub fn yield_node(&mut self, node: NodeId) -> CoreResult<()> {
        let current = self.status_checked(node)?;
        if current != NodeStatus::Running {
            return Err(CoreError::Lifecycle(format!(
                "node {node} cannot yield from {current:?}"
            )));
        }
        self.nodes[node].status = NodeStatus::Ready;
        Ok(())
    }

    fn status_checked(&self, node: NodeId) -> CoreResult<NodeStatus> {
        self.nodes
            .get(node)
            .map(|entry| entry.status)
            .ok_or_else(|| CoreError::Config(format!("node {node} is outside the graph")))
    }

    /// Current status of a node. Panics on unknown ids, which cannot be
    /// produced through this graph's API.
    pub fn status(&self, node: NodeId) -> NodeStatus {
        self.nodes[node].status
    }

    /// The node's payload.
    pub fn payload(&self, node: NodeId) -> &T {
        &self.nodes[node].payload
    }

    /// Immediate predecessors of a node.
    pub fn dependencies_of(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node].dependencies
    }

    /// Ready nodes whose dependencies are all finished, in insertion
    /// order.
    pub fn free_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.status == NodeStatus::Ready && entry.pending == 0)
            .map(|(id, _)| id)
            .collect()
    }

    /// Total number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of nodes with the given status.
    pub fn node_count_with_status(&self, status: NodeStatus) -> usize {
        if status == NodeStatus::Finished {
            return self.finished;
        }
        self.nodes
            .iter()
            .filter(|entry| entry.status == status)
            .count()
    }

    /// Returns `true` once every node is finished.
    pub fn is_drained(&self) -> bool {
        self.finished == self.nodes.len()
    }

    /// Renders the graph in GraphViz DOT form, labelling nodes with
    /// `label`.
    pub fn to_dot(&self, label: impl Fn(&T) -> String) -> String {
        let mut out = String::from("digraph {\n");
        for (id, entry) in self.nodes.iter().enumerate() {
            out.push_str(&format!("  n{id} [label=\"{}\"];\n", label(&entry.payload)));
        }
        for (id, entry) in self.nodes.iter().enumerate() {
            for dep in &entry.dependencies {
                out.push_str(&format!("  n{id} -> n{dep};\n"));
            }
        }
        out.push_str("}\n");
        out
    }
}

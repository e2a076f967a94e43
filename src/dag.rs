//! Read-only pipeline DAG: execution order and dependency structure.
//!
//! Owned by project authoring; the scheduler only queries it to decide which
//! published tasks are eligible for submission and which tasks sit downstream
//! of a failure.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::models::NodeId;

/// Directed acyclic graph over pipeline nodes, stored as a successor
/// adjacency map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDag {
    adjacency: HashMap<NodeId, Vec<NodeId>>,
}

impl PipelineDag {
    /// Build from explicit node and edge lists. Nodes without edges still
    /// appear in the adjacency map.
    pub fn from_edges(nodes: impl IntoIterator<Item = NodeId>, edges: &[(NodeId, NodeId)]) -> Self {
        let mut adjacency: HashMap<NodeId, Vec<NodeId>> =
            nodes.into_iter().map(|n| (n, Vec::new())).collect();
        for (source, target) in edges {
            adjacency.entry(*source).or_default().push(*target);
            adjacency.entry(*target).or_default();
        }
        Self { adjacency }
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.adjacency.contains_key(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.adjacency.keys()
    }

    pub fn successors(&self, node: &NodeId) -> &[NodeId] {
        self.adjacency.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct upstream dependencies of a node.
    pub fn predecessors(&self, node: &NodeId) -> Vec<NodeId> {
        self.adjacency
            .iter()
            .filter(|(_, targets)| targets.contains(node))
            .map(|(source, _)| *source)
            .collect()
    }

    /// Every node reachable downstream of `node`, excluding `node` itself.
    pub fn descendants(&self, node: &NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeId> = self.successors(node).iter().copied().collect();
        while let Some(current) = queue.pop_front() {
            if seen.insert(current) {
                queue.extend(self.successors(&current).iter().copied());
            }
        }
        seen
    }
}

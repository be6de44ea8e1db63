use crate::command::ResolveFn;
use crate::error::{FixtureError, Result};
use crate::fixture::Slot;
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::{Directed, Direction};
use std::collections::HashMap;

/// Graph vertex identity: `(table, key)`.
pub type NodeLabel = (String, String);

/// A deferred write-back: once the owning node's writer call has returned,
/// `resolve` reads the backend-assigned value and `slot` addresses the
/// dependent field to store it in.
pub struct NodeCallback {
    pub resolve: ResolveFn,
    pub slot: Slot,
}

struct NodeData {
    label: NodeLabel,
    callbacks: Vec<NodeCallback>,
}

/// The record dependency graph for one fixture run.
///
/// Edges are stored dependency → dependent, so a topological sort of the
/// stored graph is directly the write order. All mutation goes through the
/// wrapper methods; the graph is read-only during sorting and apply.
#[derive(Default)]
pub struct DependencyGraph {
    graph: StableGraph<NodeData, (), Directed, u32>,
    by_label: HashMap<NodeLabel, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> DependencyGraph {
        DependencyGraph::default()
    }

    /// Look up or create the node for a label. Exactly one node exists per
    /// distinct label.
    pub fn get_node(&mut self, label: &NodeLabel) -> NodeIndex {
        if let Some(&idx) = self.by_label.get(label) {
            return idx;
        }

        let idx = self.graph.add_node(NodeData {
            label: label.clone(),
            callbacks: Vec::new(),
        });
        self.by_label.insert(label.clone(), idx);
        idx
    }

    pub fn label(&self, idx: NodeIndex) -> Option<&NodeLabel> {
        self.graph.node_weight(idx).map(|data| &data.label)
    }

    /// Record that `dependent` must be written after `dependency`.
    pub fn add_dependency(&mut self, dependency: NodeIndex, dependent: NodeIndex) {
        self.graph.update_edge(dependency, dependent, ());
    }

    pub fn push_callback(&mut self, idx: NodeIndex, callback: NodeCallback) {
        if let Some(data) = self.graph.node_weight_mut(idx) {
            data.callbacks.push(callback);
        }
    }

    pub fn take_callbacks(&mut self, idx: NodeIndex) -> Vec<NodeCallback> {
        match self.graph.node_weight_mut(idx) {
            Some(data) => std::mem::take(&mut data.callbacks),
            None => Vec::new(),
        }
    }

    pub fn nodes(&self) -> Vec<NodeIndex> {
        self.graph.node_indices().collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Outbound neighbors: the nodes that depend on `idx`.
    pub fn from(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect()
    }

    /// Inbound neighbors: the nodes `idx` depends on.
    pub fn to(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect()
    }

    pub fn has_edge_from_to(&self, u: NodeIndex, v: NodeIndex) -> bool {
        self.graph.find_edge(u, v).is_some()
    }

    pub fn has_edge_between(&self, u: NodeIndex, v: NodeIndex) -> bool {
        self.has_edge_from_to(u, v) || self.has_edge_from_to(v, u)
    }

    /// The oriented edge between two nodes, if any, as a
    /// (dependency, dependent) pair.
    pub fn edge(&self, u: NodeIndex, v: NodeIndex) -> Option<(NodeIndex, NodeIndex)> {
        if self.has_edge_from_to(u, v) {
            Some((u, v))
        } else if self.has_edge_from_to(v, u) {
            Some((v, u))
        } else {
            None
        }
    }

    /// Topologically sorted node set, dependencies first. A cycle fails the
    /// sort, naming one participant.
    pub fn sorted(&self) -> Result<Vec<NodeIndex>> {
        toposort(&self.graph, None).map_err(|cycle| {
            match self.graph.node_weight(cycle.node_id()) {
                Some(data) => FixtureError::Cycle {
                    table: data.label.0.clone(),
                    key: data.label.1.clone(),
                },
                None => FixtureError::Other("topological sort failed".to_string()),
            }
        })
    }
}

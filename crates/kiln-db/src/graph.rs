//! Dependency graph export.
//!
//! Builds a petgraph [`DiGraph`] with one node per query record or leaf
//! input and an edge from each record to every node it read, for debugging
//! rebuilds and for graphviz rendering.

use std::collections::HashMap;

use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use kiln_core::DepNode;

use crate::record::QueryRecord;

const READS: &str = "reads";

/// A node of the exported graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub node: DepNode,
    pub dirty: bool,
}

impl std::fmt::Display for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.dirty {
            write!(f, "{} (dirty)", self.node)
        } else {
            write!(f, "{}", self.node)
        }
    }
}

pub struct DependencyGraph {
    graph: DiGraph<GraphNode, &'static str>,
    index: HashMap<DepNode, NodeIndex>,
}

impl DependencyGraph {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a QueryRecord>) -> Self {
        let mut records: Vec<&QueryRecord> = records.into_iter().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));

        let mut out = DependencyGraph {
            graph: DiGraph::new(),
            index: HashMap::new(),
        };
        for record in &records {
            let idx = out.node(DepNode::Query(record.key.clone()));
            out.graph[idx].dirty = record.dirty;
        }
        for record in &records {
            let from = out.index[&DepNode::Query(record.key.clone())];
            for dep in &record.dependencies {
                let to = out.node(dep.node.clone());
                out.graph.update_edge(from, to, READS);
            }
        }
        out
    }

    fn node(&mut self, node: DepNode) -> NodeIndex {
        if let Some(idx) = self.index.get(&node) {
            return *idx;
        }
        let idx = self.graph.add_node(GraphNode {
            node: node.clone(),
            dirty: false,
        });
        self.index.insert(node, idx);
        idx
    }

    pub fn graph(&self) -> &DiGraph<GraphNode, &'static str> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Nodes `node` reads.
    pub fn dependencies(&self, node: &DepNode) -> Vec<&DepNode> {
        self.neighbors(node, Direction::Outgoing)
    }

    /// Queries that read `node`.
    pub fn dependents(&self, node: &DepNode) -> Vec<&DepNode> {
        self.neighbors(node, Direction::Incoming)
    }

    fn neighbors(&self, node: &DepNode, direction: Direction) -> Vec<&DepNode> {
        let Some(idx) = self.index.get(node) else {
            return Vec::new();
        };
        let mut nodes: Vec<&DepNode> = self
            .graph
            .neighbors_directed(*idx, direction)
            .map(|n| &self.graph[n].node)
            .collect();
        nodes.sort();
        nodes
    }

    /// Renders the graph in graphviz DOT format.
    pub fn to_dot(&self) -> String {
        format!("{}", Dot::with_config(&self.graph, &[Config::EdgeNoLabel]))
    }
}

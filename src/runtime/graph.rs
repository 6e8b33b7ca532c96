/// Graph Builder
///
/// Turns persisted node and connection records into a petgraph `DiGraph`,
/// keeping an id → index map for lookups. Building is pure: it validates and
/// allocates, nothing else.

use crate::error::{EngineError, Result};
use crate::workflow::types::{Connection, Node};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;

/// In-memory directed workflow graph
///
/// Edge weights are the declared connections. Neighbour queries return
/// connections in their declared order, which keeps planning deterministic.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: DiGraph<Node, Connection>,
    node_id_to_index: HashMap<String, NodeIndex>,
}

/// Build a graph from node and connection records.
///
/// Fails with `Validation` when the node set is empty, a node id is repeated,
/// or a connection references a node that does not exist.
pub fn build_graph(nodes: &[Node], connections: &[Connection]) -> Result<WorkflowGraph> {
    if nodes.is_empty() {
        return Err(EngineError::Validation("workflow has no nodes".to_string()));
    }

    let mut graph = DiGraph::with_capacity(nodes.len(), connections.len());
    let mut node_id_to_index = HashMap::with_capacity(nodes.len());

    for node in nodes {
        let index = graph.add_node(node.clone());
        if node_id_to_index.insert(node.id.clone(), index).is_some() {
            return Err(EngineError::Validation(format!(
                "duplicate node id: {}",
                node.id
            )));
        }
    }

    for connection in connections {
        let source = lookup(&node_id_to_index, &connection.source_node_id, &connection.id)?;
        let target = lookup(&node_id_to_index, &connection.target_node_id, &connection.id)?;
        graph.add_edge(source, target, connection.clone());
    }

    tracing::debug!(
        nodes = graph.node_count(),
        connections = graph.edge_count(),
        "Built workflow graph"
    );

    Ok(WorkflowGraph {
        graph,
        node_id_to_index,
    })
}

fn lookup(
    index: &HashMap<String, NodeIndex>,
    node_id: &str,
    connection_id: &str,
) -> Result<NodeIndex> {
    index.get(node_id).copied().ok_or_else(|| {
        EngineError::Validation(format!(
            "connection {} references unknown node {}",
            connection_id, node_id
        ))
    })
}

impl WorkflowGraph {
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.node_id_to_index.contains_key(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.node_id_to_index.get(node_id).map(|&idx| &self.graph[idx])
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_indices().map(move |idx| &self.graph[idx])
    }

    /// Nodes with zero incoming connections, in declaration order
    pub fn entry_nodes(&self) -> Vec<&Node> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .edges_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Incoming connections of a node, in declaration order
    pub fn incoming(&self, node_id: &str) -> Vec<&Connection> {
        self.connections(node_id, Direction::Incoming)
    }

    /// Outgoing connections of a node, in declaration order
    pub fn outgoing(&self, node_id: &str) -> Vec<&Connection> {
        self.connections(node_id, Direction::Outgoing)
    }

    /// Distinct predecessor ids, in connection order
    pub fn predecessors(&self, node_id: &str) -> Vec<&str> {
        let mut seen = Vec::new();
        for connection in self.incoming(node_id) {
            let source = connection.source_node_id.as_str();
            if !seen.contains(&source) {
                seen.push(source);
            }
        }
        seen
    }

    /// Distinct successor ids, in connection order
    pub fn successors(&self, node_id: &str) -> Vec<&str> {
        let mut seen = Vec::new();
        for connection in self.outgoing(node_id) {
            let target = connection.target_node_id.as_str();
            if !seen.contains(&target) {
                seen.push(target);
            }
        }
        seen
    }

    /// Whether a connection links the two nodes in either direction
    pub fn has_direct_edge(&self, a: &str, b: &str) -> bool {
        match (self.node_id_to_index.get(a), self.node_id_to_index.get(b)) {
            (Some(&ia), Some(&ib)) => {
                self.graph.find_edge(ia, ib).is_some() || self.graph.find_edge(ib, ia).is_some()
            }
            _ => false,
        }
    }

    fn connections(&self, node_id: &str, direction: Direction) -> Vec<&Connection> {
        let Some(&idx) = self.node_id_to_index.get(node_id) else {
            return Vec::new();
        };
        // petgraph walks adjacency lists newest-first; sort back to insertion order
        let mut edges: Vec<(EdgeIndex, &Connection)> = self
            .graph
            .edges_directed(idx, direction)
            .map(|edge| (edge.id(), edge.weight()))
            .collect();
        edges.sort_by_key(|(id, _)| *id);
        edges.into_iter().map(|(_, connection)| connection).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (Vec<Node>, Vec<Connection>) {
        (
            vec![
                Node::new("T", "trigger"),
                Node::new("H", "http-request"),
                Node::new("D", "delay"),
            ],
            vec![Connection::new("c1", "T", "H"), Connection::new("c2", "H", "D")],
        )
    }

    #[test]
    fn builds_chain() {
        let (nodes, connections) = chain();
        let graph = build_graph(&nodes, &connections).unwrap();

        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.entry_nodes().len(), 1);
        assert_eq!(graph.entry_nodes()[0].id, "T");
        assert_eq!(graph.predecessors("D"), vec!["H"]);
        assert_eq!(graph.successors("T"), vec!["H"]);
        assert!(graph.has_direct_edge("H", "T"));
        assert!(!graph.has_direct_edge("T", "D"));
    }

    #[test]
    fn rejects_empty_node_set() {
        let err = build_graph(&[], &[]).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn rejects_dangling_connection() {
        let nodes = vec![Node::new("A", "trigger")];
        let connections = vec![Connection::new("c1", "A", "ghost")];
        let err = build_graph(&nodes, &connections).unwrap_err();
        assert!(matches!(err, EngineError::Validation(msg) if msg.contains("ghost")));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let nodes = vec![Node::new("A", "trigger"), Node::new("A", "delay")];
        assert!(build_graph(&nodes, &[]).is_err());
    }

    #[test]
    fn neighbours_keep_declaration_order() {
        let nodes = vec![
            Node::new("S", "trigger"),
            Node::new("X", "delay"),
            Node::new("Y", "delay"),
            Node::new("Z", "delay"),
        ];
        let connections = vec![
            Connection::new("c1", "S", "X"),
            Connection::new("c2", "S", "Y"),
            Connection::new("c3", "S", "Z"),
        ];
        let graph = build_graph(&nodes, &connections).unwrap();
        assert_eq!(graph.successors("S"), vec!["X", "Y", "Z"]);
    }
}

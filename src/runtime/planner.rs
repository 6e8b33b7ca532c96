/// Execution Planner
///
/// Orders the graph topologically, detects cycles and partitions nodes into
/// parallel-execution groups. Planning is synchronous and side-effect free, so
/// a malformed graph is rejected before anything reaches the task queue.

use crate::error::{EngineError, Result};
use crate::runtime::graph::WorkflowGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Immutable plan computed once per execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Node ids in topological order
    pub execution_order: Vec<String>,
    /// Groups of mutually non-adjacent nodes, in consumption order
    pub parallel_groups: Vec<Vec<String>>,
    pub estimated_duration_ms: u64,
    pub resource_estimate: ResourceEstimate,
}

/// Rough resource footprint of one execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEstimate {
    pub memory_mb: u64,
    pub cpu_units: f64,
    pub network_mb: u64,
}

/// Plan an execution of `graph`.
///
/// Fails with `Validation("no entry point ...")` when every node has an
/// incoming connection, naming a node on the cycle this implies, and with
/// `CyclicGraph` naming the node where a cycle closed.
pub fn plan(graph: &WorkflowGraph) -> Result<ExecutionPlan> {
    let entry_nodes: Vec<&str> = graph.entry_nodes().iter().map(|n| n.id.as_str()).collect();
    if entry_nodes.is_empty() {
        let message = match node_on_cycle(graph) {
            Some(node_id) => format!("no entry point: cycle through node {}", node_id),
            None => "no entry point".to_string(),
        };
        return Err(EngineError::Validation(message));
    }

    let execution_order = topological_order(graph, &entry_nodes)?;
    let parallel_groups = parallel_groups(graph, &execution_order);

    let plan = ExecutionPlan {
        estimated_duration_ms: estimate_duration_ms(graph),
        resource_estimate: estimate_resources(graph),
        execution_order,
        parallel_groups,
    };

    tracing::debug!(
        order = ?plan.execution_order,
        groups = plan.parallel_groups.len(),
        estimated_ms = plan.estimated_duration_ms,
        "Planned execution"
    );

    Ok(plan)
}

/// Depth-first post-order from the entry nodes, reversed.
///
/// Iterative so deep graphs cannot overflow the stack. A node met again while
/// still on the active path closes a cycle. Nodes never reached from an entry
/// node can only sit on a cycle, which is reported as well.
fn topological_order(graph: &WorkflowGraph, entry_nodes: &[&str]) -> Result<Vec<String>> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut visiting: HashSet<&str> = HashSet::new();
    let mut finished: Vec<String> = Vec::with_capacity(graph.node_count());

    for &entry in entry_nodes {
        if visited.contains(entry) {
            continue;
        }

        // (node, successors, next successor to visit)
        let mut stack: Vec<(&str, Vec<&str>, usize)> = vec![(entry, graph.successors(entry), 0)];
        visiting.insert(entry);

        while let Some((node, successors, cursor)) = stack.last_mut() {
            if let Some(&next) = successors.get(*cursor) {
                *cursor += 1;
                if visiting.contains(next) {
                    return Err(EngineError::CyclicGraph {
                        node_id: next.to_string(),
                    });
                }
                if !visited.contains(next) {
                    visiting.insert(next);
                    stack.push((next, graph.successors(next), 0));
                }
            } else {
                let node = *node;
                visiting.remove(node);
                visited.insert(node);
                finished.push(node.to_string());
                stack.pop();
            }
        }
    }

    if let Some(unreached) = graph.nodes().find(|n| !visited.contains(n.id.as_str())) {
        return Err(EngineError::CyclicGraph {
            node_id: unreached.id.clone(),
        });
    }

    finished.reverse();
    Ok(finished)
}

/// Walk first predecessors from the first node until one repeats.
///
/// Only meaningful when every node has a predecessor, in which case the walk
/// always ends on a cycle.
fn node_on_cycle(graph: &WorkflowGraph) -> Option<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut current = graph.nodes().next()?.id.as_str();
    while seen.insert(current) {
        current = *graph.predecessors(current).first()?;
    }
    Some(current.to_string())
}

/// Greedy compatibility grouping over the topological order.
///
/// Each unprocessed node seeds a group; later unprocessed nodes join when they
/// share no direct edge with any member already in the group. Ties go to the
/// earliest node in topological order.
fn parallel_groups(graph: &WorkflowGraph, order: &[String]) -> Vec<Vec<String>> {
    let mut processed: HashSet<&str> = HashSet::new();
    let mut groups = Vec::new();

    for seed in order {
        if processed.contains(seed.as_str()) {
            continue;
        }
        processed.insert(seed);
        let mut group = vec![seed.clone()];

        for candidate in order {
            if processed.contains(candidate.as_str()) {
                continue;
            }
            let compatible = group
                .iter()
                .all(|member| !graph.has_direct_edge(member, candidate));
            if compatible {
                processed.insert(candidate);
                group.push(candidate.clone());
            }
        }

        groups.push(group);
    }

    groups
}

fn estimate_duration_ms(graph: &WorkflowGraph) -> u64 {
    graph
        .nodes()
        .map(|node| match node.node_type.as_str() {
            "http-request" => 2000,
            "delay" => node
                .configuration
                .get("duration")
                .or_else(|| node.configuration.get("delay"))
                .and_then(|v| v.as_u64())
                .unwrap_or(1000),
            _ => 500,
        })
        .fold(0u64, u64::saturating_add)
}

fn estimate_resources(graph: &WorkflowGraph) -> ResourceEstimate {
    let nodes = graph.node_count() as u64;
    let http = graph
        .nodes()
        .filter(|n| n.node_type == "http-request")
        .count() as u64;
    ResourceEstimate {
        memory_mb: nodes * 10,
        cpu_units: nodes as f64 * 0.1,
        network_mb: http * 5,
    }
}

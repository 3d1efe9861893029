/// Structural workflow validation
///
/// Builds a petgraph `DiGraph` from the node/edge lists and checks that:
/// 1. node ids are unique,
/// 2. every edge references existing nodes,
/// 3. at least one trigger node exists,
/// 4. every non-trigger node is reachable from some trigger.
///
/// Cycles are *not* rejected: loop and sub_workflow constructs rely on them and
/// the engine bounds them with its own counters.

use crate::error::EngineError;
use crate::workflow::params::{self, SwitchConfig};
use crate::workflow::types::{NodeType, Workflow};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};

/// Structural checks run before every execution start
pub fn validate_graph(workflow: &Workflow) -> Result<(), EngineError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    for node in &workflow.nodes {
        if index.contains_key(node.id.as_str()) {
            return Err(EngineError::malformed(&node.id, "duplicate node id"));
        }
        index.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }

    for edge in &workflow.edges {
        let from = index
            .get(edge.from.as_str())
            .ok_or_else(|| EngineError::malformed(&edge.from, "edge source does not exist"))?;
        let to = index
            .get(edge.to.as_str())
            .ok_or_else(|| EngineError::malformed(&edge.to, "edge target does not exist"))?;
        graph.add_edge(*from, *to, ());
    }

    let triggers: Vec<NodeIndex> = workflow
        .triggers()
        .map(|n| index[n.id.as_str()])
        .collect();
    if triggers.is_empty() {
        return Err(EngineError::malformed(&workflow.id, "workflow has no trigger node"));
    }

    let mut reached: HashSet<NodeIndex> = HashSet::new();
    for start in triggers {
        let mut bfs = Bfs::new(&graph, start);
        while let Some(ix) = bfs.next(&graph) {
            reached.insert(ix);
        }
    }

    for node in workflow.nodes.iter().filter(|n| !n.node_type.is_trigger()) {
        if !reached.contains(&index[node.id.as_str()]) {
            return Err(EngineError::malformed(&node.id, "unreachable from any trigger node"));
        }
    }

    Ok(())
}

/// Full edit-time validation: structure, parameter schemas and branch labels
pub fn validate_workflow(workflow: &Workflow) -> Result<(), EngineError> {
    validate_graph(workflow)?;

    for node in &workflow.nodes {
        params::check_schema(node)?;

        match node.node_type {
            NodeType::IfElse => {
                for edge in workflow.outgoing(&node.id) {
                    match edge.label.as_deref() {
                        Some("true") | Some("false") => {}
                        other => {
                            return Err(EngineError::malformed(
                                &node.id,
                                format!("if_else edge to '{}' has label {:?}, expected \"true\" or \"false\"", edge.to, other),
                            ));
                        }
                    }
                }
            }
            NodeType::Switch => {
                let config = SwitchConfig::from_node(node)?;
                let labels: HashSet<&str> = config.cases.values().map(String::as_str).collect();
                for edge in workflow.outgoing(&node.id) {
                    if let Some(label) = edge.label.as_deref() {
                        if !labels.contains(label) {
                            return Err(EngineError::malformed(
                                &node.id,
                                format!("switch edge label '{}' matches no case", label),
                            ));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Edge, Node};
    use serde_json::json;

    fn wf(nodes: Vec<Node>, edges: Vec<Edge>) -> Workflow {
        Workflow {
            id: "wf".into(),
            name: "test".into(),
            user_id: "u1".into(),
            nodes,
            edges,
            active: true,
        }
    }

    fn http(id: &str) -> Node {
        Node::new(id, NodeType::HttpRequest, json!({ "url": "https://example.com" }))
    }

    #[test]
    fn linear_chain_is_valid() {
        let w = wf(
            vec![Node::new("t", NodeType::TriggerManual, json!({})), http("a"), http("b")],
            vec![Edge::new("t", "a"), Edge::new("a", "b")],
        );
        assert!(validate_workflow(&w).is_ok());
    }

    #[test]
    fn missing_trigger_is_rejected() {
        let w = wf(vec![http("a")], vec![]);
        let err = validate_graph(&w).unwrap_err();
        assert!(matches!(err, EngineError::MalformedGraph { ref node_id, .. } if node_id == "wf"));
    }

    #[test]
    fn dangling_edge_cites_missing_id() {
        let w = wf(
            vec![Node::new("t", NodeType::TriggerManual, json!({})), http("a")],
            vec![Edge::new("t", "a"), Edge::new("a", "ghost")],
        );
        match validate_graph(&w).unwrap_err() {
            EngineError::MalformedGraph { node_id, .. } => assert_eq!(node_id, "ghost"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unreachable_node_is_rejected() {
        let w = wf(
            vec![Node::new("t", NodeType::TriggerManual, json!({})), http("a"), http("island")],
            vec![Edge::new("t", "a")],
        );
        match validate_graph(&w).unwrap_err() {
            EngineError::MalformedGraph { node_id, .. } => assert_eq!(node_id, "island"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cycles_are_allowed() {
        let w = wf(
            vec![
                Node::new("t", NodeType::TriggerManual, json!({})),
                Node::new("l", NodeType::Loop, json!({ "iterations": 2 })),
                http("body"),
            ],
            vec![
                Edge::new("t", "l"),
                Edge::labeled("l", "body", "body"),
                Edge::new("body", "l"),
            ],
        );
        assert!(validate_workflow(&w).is_ok());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let w = wf(
            vec![Node::new("t", NodeType::TriggerManual, json!({})), http("a"), http("a")],
            vec![Edge::new("t", "a")],
        );
        assert!(validate_graph(&w).is_err());
    }

    #[test]
    fn if_else_labels_are_checked_at_edit_time() {
        let w = wf(
            vec![
                Node::new("t", NodeType::TriggerManual, json!({})),
                Node::new("c", NodeType::IfElse, json!({ "conditions": [] })),
                http("a"),
            ],
            vec![Edge::new("t", "c"), Edge::labeled("c", "a", "maybe")],
        );
        assert!(validate_graph(&w).is_ok());
        assert!(validate_workflow(&w).is_err());
    }
}

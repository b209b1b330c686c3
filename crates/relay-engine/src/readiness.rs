//! Readiness evaluation over a graph snapshot. Pure and lock-free.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::graph::{NodeKind, NodeStatus, PipelineGraph};

/// Pending nodes whose forward predecessors have all succeeded, in
/// declaration order.
///
/// Start and exit nodes are markers, never dispatched; a start node counts as
/// satisfied for its successors.
pub fn dispatchable(graph: &PipelineGraph) -> Vec<String> {
    let satisfied = |id: &str| {
        graph
            .node(id)
            .is_some_and(|n| n.kind == NodeKind::Start || n.status.is_success())
    };
    let mut out: Vec<String> = Vec::new();
    for node in graph.all_nodes() {
        if node.status != NodeStatus::Pending
            || node.kind == NodeKind::Start
            || node.kind.is_exit()
            || out.contains(&node.id)
        {
            continue;
        }
        if graph.forward_predecessors(&node.id).all(satisfied) {
            out.push(node.id.clone());
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSummary {
    pub name: String,
    pub checkpoint_seq: u64,
    pub counts: BTreeMap<NodeStatus, usize>,
    pub dispatchable: Vec<String>,
    pub stuck: Vec<String>,
    pub complete: bool,
}

pub fn summarize(graph: &PipelineGraph) -> PipelineSummary {
    let mut counts = BTreeMap::new();
    for node in graph.all_nodes() {
        *counts.entry(node.status).or_insert(0) += 1;
    }
    PipelineSummary {
        name: graph.name.clone(),
        checkpoint_seq: graph.checkpoint_seq,
        counts,
        dispatchable: dispatchable(graph),
        stuck: graph
            .all_nodes()
            .filter(|n| n.status == NodeStatus::Stuck)
            .map(|n| n.id.clone())
            .collect(),
        complete: graph.is_complete(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAN: &str = r#"digraph F {
        start [kind="start"]
        a [kind="work", worker_role="r", acceptance="a"]
        b [kind="work", worker_role="r", acceptance="b"]
        c [kind="work", worker_role="r", acceptance="c"]
        gate [kind="validation-gate"]
        done [kind="exit-success"]
        start -> a
        start -> b
        a -> c
        b -> c [condition="on-success"]
        c -> gate
        gate -> a [condition="on-failure"]
        gate -> done
    }"#;

    fn set(graph: &mut PipelineGraph, id: &str, status: NodeStatus) {
        graph.node_mut(id).unwrap().status = status;
    }

    #[test]
    fn roots_after_start_are_dispatchable() {
        let g = PipelineGraph::parse(FAN).unwrap();
        assert_eq!(dispatchable(&g), vec!["a", "b"]);
    }

    #[test]
    fn join_waits_for_every_forward_predecessor() {
        let mut g = PipelineGraph::parse(FAN).unwrap();
        set(&mut g, "a", NodeStatus::Merged);
        set(&mut g, "b", NodeStatus::ImplComplete);
        assert!(dispatchable(&g).is_empty());
        set(&mut g, "b", NodeStatus::Validated);
        assert_eq!(dispatchable(&g), vec!["c"]);
    }

    #[test]
    fn failure_edges_are_not_dependencies() {
        let mut g = PipelineGraph::parse(FAN).unwrap();
        for id in ["a", "b", "c"] {
            set(&mut g, id, NodeStatus::Merged);
        }
        // gate -> a is on-failure, so gate is ready and a stays merged
        assert_eq!(dispatchable(&g), vec!["gate"]);
    }

    #[test]
    fn failed_predecessor_blocks() {
        let mut g = PipelineGraph::parse(FAN).unwrap();
        set(&mut g, "a", NodeStatus::Failed);
        set(&mut g, "b", NodeStatus::Validated);
        assert!(dispatchable(&g).is_empty());
    }

    #[test]
    fn exit_nodes_are_never_dispatched() {
        let mut g = PipelineGraph::parse(FAN).unwrap();
        for id in ["a", "b", "c", "gate"] {
            set(&mut g, id, NodeStatus::Validated);
        }
        assert!(dispatchable(&g).is_empty());
    }

    #[test]
    fn dispatchable_is_deterministic() {
        let g = PipelineGraph::parse(FAN).unwrap();
        let first = dispatchable(&g);
        for _ in 0..10 {
            assert_eq!(dispatchable(&g), first);
        }
        let reparsed = PipelineGraph::parse(&g.render()).unwrap();
        assert_eq!(dispatchable(&reparsed), first);
    }

    #[test]
    fn summary_reports_stuck_and_completion() {
        let mut g = PipelineGraph::parse(FAN).unwrap();
        set(&mut g, "a", NodeStatus::Merged);
        set(&mut g, "b", NodeStatus::Stuck);
        let s = summarize(&g);
        assert_eq!(s.stuck, vec!["b"]);
        assert!(!s.complete);
        assert_eq!(s.counts.get(&NodeStatus::Pending), Some(&4));

        set(&mut g, "c", NodeStatus::Merged);
        assert!(summarize(&g).complete);

        let json = serde_json::to_value(summarize(&g)).unwrap();
        assert_eq!(json["counts"]["merged"], 2);
    }
}

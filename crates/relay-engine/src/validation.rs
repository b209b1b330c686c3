//! Pipeline validation: lint rules and diagnostics.
//!
//! Each rule inspects a [`PipelineGraph`] and reports [`Diagnostic`]s. Call
//! [`validate`] for the full [`ValidationReport`] or [`validate_or_raise`] to
//! turn any error into a `ValidationError`. Validation never mutates the graph.

use std::collections::{HashMap, HashSet, VecDeque};

use relay_types::{RelayError, Result};
use serde::Serialize;

use crate::graph::{NodeKind, NodeStatus, PipelineGraph};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge: Option<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

impl Diagnostic {
    fn error(rule: &str, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message,
            node_id: None,
            edge: None,
        }
    }

    fn warning(rule: &str, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule, message)
        }
    }

    fn on_node(mut self, id: &str) -> Self {
        self.node_id = Some(id.to_string());
        self
    }

    fn on_edge(mut self, from: &str, to: &str) -> Self {
        self.edge = Some((from.to_string(), to.to_string()));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_rule(&self, rule: &str) -> bool {
        self.errors.iter().chain(&self.warnings).any(|d| d.rule == rule)
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Structural rules
// ---------------------------------------------------------------------------

struct DuplicateNodeIdRule;
impl LintRule for DuplicateNodeIdRule {
    fn name(&self) -> &str { "duplicate_node_id" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        let mut diags = Vec::new();
        for node in graph.all_nodes() {
            if !seen.insert(node.id.as_str()) && reported.insert(node.id.as_str()) {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        format!("Node id '{}' is declared more than once (line {})", node.id, node.line),
                    )
                    .on_node(&node.id),
                );
            }
        }
        diags
    }
}

struct EdgeEndpointsExistRule;
impl LintRule for EdgeEndpointsExistRule {
    fn name(&self) -> &str { "edge_endpoints_exist" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for edge in graph.all_edges() {
            for endpoint in [&edge.from, &edge.to] {
                if graph.node(endpoint).is_none() {
                    diags.push(
                        Diagnostic::error(
                            self.name(),
                            format!("Edge {} -> {} references unknown node '{}'", edge.from, edge.to, endpoint),
                        )
                        .on_edge(&edge.from, &edge.to),
                    );
                }
            }
        }
        diags
    }
}

struct NoSelfLoopRule;
impl LintRule for NoSelfLoopRule {
    fn name(&self) -> &str { "no_self_loop" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_edges()
            .iter()
            .filter(|e| e.from == e.to)
            .map(|e| {
                Diagnostic::error(self.name(), format!("Node '{}' has an edge to itself", e.from))
                    .on_edge(&e.from, &e.to)
            })
            .collect()
    }
}

/// Kahn's algorithm over unconditional/on-success edges.
struct AcyclicRule;
impl LintRule for AcyclicRule {
    fn name(&self) -> &str { "acyclic" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut in_degree: HashMap<&str, usize> =
            graph.all_nodes().map(|n| (n.id.as_str(), 0)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in graph.all_edges() {
            if !edge.condition.is_forward() || edge.from == edge.to {
                continue;
            }
            if !in_degree.contains_key(edge.from.as_str()) {
                continue;
            }
            let Some(d) = in_degree.get_mut(edge.to.as_str()) else {
                continue;
            };
            *d += 1;
            adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for &next in adjacency.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if visited == in_degree.len() {
            return vec![];
        }
        let mut cyclic: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .collect();
        cyclic.sort_unstable();
        vec![Diagnostic::error(
            self.name(),
            format!(
                "Unconditional/on-success edges form a cycle through: {}",
                cyclic.join(", ")
            ),
        )]
    }
}

// ---------------------------------------------------------------------------
// Semantic rules
// ---------------------------------------------------------------------------

struct StartNodeRule;
impl LintRule for StartNodeRule {
    fn name(&self) -> &str { "start_node" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let starts: Vec<_> = graph.start_nodes().map(|n| n.id.as_str()).collect();
        match starts.len() {
            0 => vec![Diagnostic::error(
                self.name(),
                "Pipeline has no start node (kind=start or shape=Mdiamond)".into(),
            )],
            1 => vec![],
            n => vec![Diagnostic::error(
                self.name(),
                format!("Pipeline has {n} start nodes: {}; expected exactly one", starts.join(", ")),
            )],
        }
    }
}

struct ExitNodeRule;
impl LintRule for ExitNodeRule {
    fn name(&self) -> &str { "exit_node" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        if graph.exit_nodes().next().is_none() {
            vec![Diagnostic::error(
                self.name(),
                "Pipeline has no exit node (kind=exit-success/exit-failure or shape=Msquare)".into(),
            )]
        } else {
            vec![]
        }
    }
}

struct StartNoIncomingRule;
impl LintRule for StartNoIncomingRule {
    fn name(&self) -> &str { "start_no_incoming" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .start_nodes()
            .filter(|n| graph.incoming(&n.id).next().is_some())
            .map(|n| {
                Diagnostic::error(self.name(), format!("Start node '{}' has incoming edges", n.id))
                    .on_node(&n.id)
            })
            .collect()
    }
}

struct ExitNoOutgoingRule;
impl LintRule for ExitNoOutgoingRule {
    fn name(&self) -> &str { "exit_no_outgoing" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .exit_nodes()
            .filter(|n| graph.outgoing(&n.id).next().is_some())
            .map(|n| {
                Diagnostic::error(self.name(), format!("Exit node '{}' has outgoing edges", n.id))
                    .on_node(&n.id)
            })
            .collect()
    }
}

struct WorkAttributesRule;
impl LintRule for WorkAttributesRule {
    fn name(&self) -> &str { "work_attributes" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in graph.nodes_of_kind(NodeKind::Work) {
            let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
            if blank(&node.worker_role) {
                diags.push(
                    Diagnostic::error(self.name(), format!("Work node '{}' has no worker_role", node.id))
                        .on_node(&node.id),
                );
            }
            if blank(&node.acceptance) {
                diags.push(
                    Diagnostic::error(self.name(), format!("Work node '{}' has no acceptance", node.id))
                        .on_node(&node.id),
                );
            }
        }
        diags
    }
}

struct DecisionNoAcceptanceRule;
impl LintRule for DecisionNoAcceptanceRule {
    fn name(&self) -> &str { "decision_no_acceptance" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .nodes_of_kind(NodeKind::Decision)
            .filter(|n| n.acceptance.is_some())
            .map(|n| {
                Diagnostic::error(
                    self.name(),
                    format!("Decision node '{}' must not carry acceptance criteria", n.id),
                )
                .on_node(&n.id)
            })
            .collect()
    }
}

/// Reverse BFS from each gate over every edge.
struct GateReachableFromWorkRule;
impl LintRule for GateReachableFromWorkRule {
    fn name(&self) -> &str { "gate_reachable_from_work" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for gate in graph.nodes_of_kind(NodeKind::ValidationGate) {
            let mut visited = HashSet::from([gate.id.as_str()]);
            let mut queue = VecDeque::from([gate.id.as_str()]);
            let mut found = false;
            while let Some(id) = queue.pop_front() {
                for edge in graph.incoming(id) {
                    let src = edge.from.as_str();
                    if !visited.insert(src) {
                        continue;
                    }
                    if graph.node(src).is_some_and(|n| n.kind == NodeKind::Work) {
                        found = true;
                        break;
                    }
                    queue.push_back(src);
                }
                if found {
                    break;
                }
            }
            if !found {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        format!("Validation gate '{}' is not reachable from any work node", gate.id),
                    )
                    .on_node(&gate.id),
                );
            }
        }
        diags
    }
}

// ---------------------------------------------------------------------------
// Acceptance immutability
// ---------------------------------------------------------------------------

struct AcceptanceImmutableRule;
impl LintRule for AcceptanceImmutableRule {
    fn name(&self) -> &str { "acceptance_immutable" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in graph.all_nodes() {
            let Some(stored) = node.acceptance_hash.as_deref() else {
                if crate::guard::requires_acceptance_pin(node) {
                    diags.push(
                        Diagnostic::error(
                            self.name(),
                            format!(
                                "Node '{}' is {} but its acceptance_hash is missing",
                                node.id, node.status
                            ),
                        )
                        .on_node(&node.id),
                    );
                }
                continue;
            };
            let message = match node.acceptance_digest() {
                Some(current) if current == stored => continue,
                Some(_) => format!(
                    "Acceptance of node '{}' changed after it was first validated",
                    node.id
                ),
                None => format!(
                    "Acceptance of node '{}' was removed after it was first validated",
                    node.id
                ),
            };
            diags.push(Diagnostic::error(self.name(), message).on_node(&node.id));
        }
        diags
    }
}

// ---------------------------------------------------------------------------
// Advisory rules
// ---------------------------------------------------------------------------

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let Some(start) = graph.start_nodes().next() else {
            return vec![];
        };
        let mut visited = HashSet::from([start.id.as_str()]);
        let mut queue = VecDeque::from([start.id.as_str()]);
        while let Some(id) = queue.pop_front() {
            for edge in graph.outgoing(id) {
                if visited.insert(edge.to.as_str()) {
                    queue.push_back(edge.to.as_str());
                }
            }
        }
        graph
            .all_nodes()
            .filter(|n| !visited.contains(n.id.as_str()))
            .map(|n| {
                Diagnostic::warning(
                    self.name(),
                    format!("Node '{}' is not reachable from start node '{}'", n.id, start.id),
                )
                .on_node(&n.id)
            })
            .collect()
    }
}

struct StuckNodesRule;
impl LintRule for StuckNodesRule {
    fn name(&self) -> &str { "stuck_nodes" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter(|n| n.status == NodeStatus::Stuck)
            .map(|n| {
                Diagnostic::warning(
                    self.name(),
                    format!("Node '{}' is stuck after {} retries", n.id, n.retry_count),
                )
                .on_node(&n.id)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

fn built_in_rules() -> Vec<Box<dyn LintRule>> {
    vec![
        Box::new(DuplicateNodeIdRule),
        Box::new(EdgeEndpointsExistRule),
        Box::new(NoSelfLoopRule),
        Box::new(AcyclicRule),
        Box::new(StartNodeRule),
        Box::new(ExitNodeRule),
        Box::new(StartNoIncomingRule),
        Box::new(ExitNoOutgoingRule),
        Box::new(WorkAttributesRule),
        Box::new(DecisionNoAcceptanceRule),
        Box::new(GateReachableFromWorkRule),
        Box::new(AcceptanceImmutableRule),
        Box::new(ReachabilityRule),
        Box::new(StuckNodesRule),
    ]
}

/// Run every built-in rule.
pub fn validate(graph: &PipelineGraph) -> ValidationReport {
    let mut report = ValidationReport::default();
    for rule in built_in_rules() {
        for diag in rule.apply(graph) {
            match diag.severity {
                Severity::Error => report.errors.push(diag),
                Severity::Warning => report.warnings.push(diag),
            }
        }
    }
    report
}

/// Validate and return `ValidationError` listing every error, if any.
pub fn validate_or_raise(graph: &PipelineGraph) -> Result<ValidationReport> {
    let report = validate(graph);
    if report.is_valid() {
        return Ok(report);
    }
    let messages: Vec<String> = report
        .errors
        .iter()
        .map(|d| format!("[{}] {}", d.rule, d.message))
        .collect();
    Err(RelayError::ValidationError(messages.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeCondition, PipelineEdge, PipelineNode};

    fn parse(src: &str) -> PipelineGraph {
        PipelineGraph::parse(src).unwrap()
    }

    const VALID: &str = r#"digraph G {
        start [kind="start"]
        api [kind="work", worker_role="rust", acceptance="tests pass"]
        gate [kind="validation-gate"]
        done [kind="exit-success"]
        start -> api
        api -> gate [condition="on-success"]
        gate -> api [condition="on-failure"]
        gate -> done
    }"#;

    #[test]
    fn valid_pipeline_has_no_errors() {
        let report = validate(&parse(VALID));
        assert!(report.is_valid(), "unexpected errors: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "unexpected warnings: {:?}", report.warnings);
    }

    #[test]
    fn failure_edges_may_point_backward() {
        let report = validate(&parse(VALID));
        assert!(!report.has_rule("acyclic"));
    }

    #[test]
    fn unconditional_cycle_is_error() {
        let g = parse(r#"digraph G {
            start [kind="start"]
            a [kind="work", worker_role="r", acceptance="x"]
            b [kind="work", worker_role="r", acceptance="y"]
            done [kind="exit-success"]
            start -> a -> b
            b -> a [condition="on-success"]
            b -> done
        }"#);
        let report = validate(&g);
        let diag = report.errors.iter().find(|d| d.rule == "acyclic").unwrap();
        assert!(diag.message.contains("a, b"), "{}", diag.message);
    }

    #[test]
    fn self_loop_is_error() {
        let g = parse(r#"digraph G {
            start [kind="start"]
            a [kind="work", worker_role="r", acceptance="x"]
            done [kind="exit-success"]
            start -> a -> done
            a -> a [condition="on-failure"]
        }"#);
        assert!(validate(&g).errors.iter().any(|d| d.rule == "no_self_loop"));
    }

    #[test]
    fn duplicate_ids_reported_once() {
        let g = parse(r#"digraph G {
            start [kind="start"]
            a [kind="work", worker_role="r", acceptance="x"]
            a [kind="work", worker_role="r", acceptance="x"]
            a [kind="work", worker_role="r", acceptance="x"]
            done [kind="exit-success"]
            start -> a -> done
        }"#);
        let dups: Vec<_> = validate(&g)
            .errors
            .into_iter()
            .filter(|d| d.rule == "duplicate_node_id")
            .collect();
        assert_eq!(dups.len(), 1);
    }

    #[test]
    fn dangling_endpoint_built_in_code_is_error() {
        let mut g = PipelineGraph::new("G");
        g.add_node(PipelineNode::new("start", NodeKind::Start));
        g.add_node(PipelineNode::new("done", NodeKind::ExitSuccess));
        g.add_edge(PipelineEdge::new("start", "done", EdgeCondition::Unconditional));
        g.add_edge(PipelineEdge::new("start", "ghost", EdgeCondition::Unconditional));
        assert!(validate(&g).errors.iter().any(|d| d.rule == "edge_endpoints_exist"));
    }

    #[test]
    fn start_and_exit_counts() {
        let none = parse(r#"digraph G { a [kind="decision"] }"#);
        let report = validate(&none);
        assert!(report.errors.iter().any(|d| d.rule == "start_node"));
        assert!(report.errors.iter().any(|d| d.rule == "exit_node"));

        let two = parse(r#"digraph G {
            s1 [kind="start"]
            s2 [shape="Mdiamond"]
            done [kind="exit-failure"]
            s1 -> done
            s2 -> done
        }"#);
        let report = validate(&two);
        let diag = report.errors.iter().find(|d| d.rule == "start_node").unwrap();
        assert!(diag.message.contains("2 start nodes"));
        assert!(!report.has_rule("exit_node"));
    }

    #[test]
    fn work_node_requires_role_and_acceptance() {
        let g = parse(r#"digraph G {
            start [kind="start"]
            a [kind="work"]
            done [kind="exit-success"]
            start -> a -> done
        }"#);
        let errs: Vec<_> = validate(&g)
            .errors
            .into_iter()
            .filter(|d| d.rule == "work_attributes")
            .collect();
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn decision_with_acceptance_is_error() {
        let g = parse(r#"digraph G {
            start [kind="start"]
            choose [kind="decision", acceptance="nope"]
            done [kind="exit-success"]
            start -> choose -> done
        }"#);
        assert!(validate(&g).errors.iter().any(|d| d.rule == "decision_no_acceptance"));
    }

    #[test]
    fn orphan_gate_is_error() {
        let g = parse(r#"digraph G {
            start [kind="start"]
            gate [kind="validation-gate"]
            done [kind="exit-success"]
            start -> gate -> done
        }"#);
        assert!(validate(&g).errors.iter().any(|d| d.rule == "gate_reachable_from_work"));
    }

    #[test]
    fn start_with_incoming_and_exit_with_outgoing() {
        let g = parse(r#"digraph G {
            start [kind="start"]
            a [kind="work", worker_role="r", acceptance="x"]
            done [kind="exit-success"]
            start -> a -> done
            done -> start [condition="on-failure"]
        }"#);
        let report = validate(&g);
        assert!(report.has_rule("start_no_incoming"));
        assert!(report.has_rule("exit_no_outgoing"));
    }

    #[test]
    fn acceptance_hash_mismatch_is_error() {
        let mut g = parse(VALID);
        let digest = g.node("api").unwrap().acceptance_digest();
        g.node_mut("api").unwrap().acceptance_hash = digest;
        assert!(validate(&g).is_valid());

        g.node_mut("api").unwrap().acceptance = Some("tests mostly pass".into());
        assert!(validate(&g).errors.iter().any(|d| d.rule == "acceptance_immutable"));

        g.node_mut("api").unwrap().acceptance = None;
        let report = validate(&g);
        let diag = report.errors.iter().find(|d| d.rule == "acceptance_immutable").unwrap();
        assert!(diag.message.contains("removed"));
    }

    #[test]
    fn validated_work_without_pin_is_error() {
        let mut g = parse(VALID);
        g.node_mut("api").unwrap().status = NodeStatus::MergeReady;
        let report = validate(&g);
        let diag = report.errors.iter().find(|d| d.rule == "acceptance_immutable").unwrap();
        assert!(diag.message.contains("missing"));

        let digest = g.node("api").unwrap().acceptance_digest();
        g.node_mut("api").unwrap().acceptance_hash = digest;
        assert!(validate(&g).is_valid());
    }

    #[test]
    fn unreachable_and_stuck_are_warnings() {
        let mut g = parse(r#"digraph G {
            start [kind="start"]
            a [kind="work", worker_role="r", acceptance="x"]
            island [kind="work", worker_role="r", acceptance="y"]
            done [kind="exit-success"]
            start -> a -> done
        }"#);
        g.node_mut("a").unwrap().status = NodeStatus::Stuck;
        let report = validate(&g);
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|d| d.rule == "reachability"
            && d.node_id.as_deref() == Some("island")));
        assert!(report.warnings.iter().any(|d| d.rule == "stuck_nodes"));
    }

    #[test]
    fn validate_or_raise_collects_errors() {
        let g = parse(r#"digraph G { a [kind="work"] }"#);
        match validate_or_raise(&g) {
            Err(RelayError::ValidationError(msg)) => {
                assert!(msg.contains("[start_node]"));
                assert!(msg.contains("[work_attributes]"));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
        assert!(validate_or_raise(&parse(VALID)).is_ok());
    }

    #[test]
    fn validation_does_not_mutate() {
        let g = parse(VALID);
        let before = g.clone();
        let _ = validate(&g);
        assert_eq!(g, before);
    }
}

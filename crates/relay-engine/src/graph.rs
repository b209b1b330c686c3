//! Typed pipeline graph over the DOT AST.
//!
//! [`PipelineGraph::from_dot`] lifts a [`DotGraph`] into typed nodes and edges,
//! rejecting unknown enum values and dangling edge endpoints.
//! [`PipelineGraph::to_dot`] lowers it back, preserving declaration order and
//! every attribute the engine does not interpret.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use relay_dot::{AttributeValue, Attrs, DotGraph, EdgeDef, NodeDef};
use relay_types::{RelayError, Result};
use serde::{Deserialize, Serialize};

use crate::fsio;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Start,
    ExitSuccess,
    ExitFailure,
    Work,
    ValidationGate,
    Decision,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::ExitSuccess => "exit-success",
            NodeKind::ExitFailure => "exit-failure",
            NodeKind::Work => "work",
            NodeKind::ValidationGate => "validation-gate",
            NodeKind::Decision => "decision",
        }
    }

    /// Kind implied by a Graphviz shape when no explicit `kind` is given.
    pub fn from_shape(shape: Option<&str>) -> Self {
        match shape {
            Some("Mdiamond") => NodeKind::Start,
            Some("Msquare") => NodeKind::ExitSuccess,
            Some("diamond") => NodeKind::Decision,
            Some("hexagon") => NodeKind::ValidationGate,
            _ => NodeKind::Work,
        }
    }

    /// Default shape written for nodes that do not carry one.
    pub fn shape(&self) -> &'static str {
        match self {
            NodeKind::Start => "Mdiamond",
            NodeKind::ExitSuccess | NodeKind::ExitFailure => "Msquare",
            NodeKind::Decision => "diamond",
            NodeKind::ValidationGate => "hexagon",
            NodeKind::Work => "box",
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, NodeKind::ExitSuccess | NodeKind::ExitFailure)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "start" => Ok(NodeKind::Start),
            "exit-success" => Ok(NodeKind::ExitSuccess),
            "exit-failure" => Ok(NodeKind::ExitFailure),
            "work" => Ok(NodeKind::Work),
            "validation-gate" => Ok(NodeKind::ValidationGate),
            "decision" => Ok(NodeKind::Decision),
            other => Err(format!("unknown node kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Active,
    ImplComplete,
    Validated,
    Failed,
    MergeReady,
    Merged,
    Stuck,
}

impl NodeStatus {
    pub const ALL: [NodeStatus; 8] = [
        NodeStatus::Pending,
        NodeStatus::Active,
        NodeStatus::ImplComplete,
        NodeStatus::Validated,
        NodeStatus::Failed,
        NodeStatus::MergeReady,
        NodeStatus::Merged,
        NodeStatus::Stuck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Active => "active",
            NodeStatus::ImplComplete => "impl_complete",
            NodeStatus::Validated => "validated",
            NodeStatus::Failed => "failed",
            NodeStatus::MergeReady => "merge_ready",
            NodeStatus::Merged => "merged",
            NodeStatus::Stuck => "stuck",
        }
    }

    /// Satisfies a downstream dependency.
    pub fn is_success(&self) -> bool {
        matches!(self, NodeStatus::Validated | NodeStatus::Merged)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        NodeStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown node status '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Handler {
    Delegated,
    Tool,
}

impl Handler {
    pub fn as_str(&self) -> &'static str {
        match self {
            Handler::Delegated => "delegated",
            Handler::Tool => "tool",
        }
    }
}

impl FromStr for Handler {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "delegated" => Ok(Handler::Delegated),
            "tool" => Ok(Handler::Tool),
            other => Err(format!("unknown handler '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeCondition {
    #[default]
    Unconditional,
    OnSuccess,
    OnFailure,
}

impl EdgeCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeCondition::Unconditional => "unconditional",
            EdgeCondition::OnSuccess => "on-success",
            EdgeCondition::OnFailure => "on-failure",
        }
    }

    /// Edges that carry dependency order. `on-failure` edges are retry routes
    /// and may point backward.
    pub fn is_forward(&self) -> bool {
        !matches!(self, EdgeCondition::OnFailure)
    }
}

impl FromStr for EdgeCondition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unconditional" => Ok(EdgeCondition::Unconditional),
            "on-success" => Ok(EdgeCondition::OnSuccess),
            "on-failure" => Ok(EdgeCondition::OnFailure),
            other => Err(format!("unknown edge condition '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes and edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineNode {
    pub id: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    pub handler: Option<Handler>,
    pub worker_role: Option<String>,
    pub acceptance: Option<String>,
    /// SHA-256 of `acceptance`, stored on the first `validated` transition.
    pub acceptance_hash: Option<String>,
    pub evidence_path: Option<String>,
    pub evidence_hash: Option<String>,
    pub retry_count: u32,
    pub bead_ref: Option<String>,
    pub spec_ref: Option<String>,
    /// Actor that took the node to `active`/`impl_complete`.
    pub implemented_by: Option<String>,
    /// RFC 3339 time of the last `impl_complete` transition.
    pub impl_completed_at: Option<String>,
    /// Whether a validated work node goes through the merge queue. Written
    /// as `merge=false` for work that never integrates.
    pub merge: bool,
    /// Attributes the engine does not interpret, kept verbatim.
    pub extra: Attrs,
    pub line: usize,
}

impl PipelineNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            status: NodeStatus::Pending,
            handler: None,
            worker_role: None,
            acceptance: None,
            acceptance_hash: None,
            evidence_path: None,
            evidence_hash: None,
            retry_count: 0,
            bead_ref: None,
            spec_ref: None,
            implemented_by: None,
            impl_completed_at: None,
            merge: true,
            extra: Attrs::new(),
            line: 0,
        }
    }

    /// A work node with its two required attributes.
    pub fn work(id: impl Into<String>, role: &str, acceptance: &str) -> Self {
        let mut node = Self::new(id, NodeKind::Work);
        node.worker_role = Some(role.to_string());
        node.acceptance = Some(acceptance.to_string());
        node.handler = Some(Handler::Delegated);
        node
    }

    /// SHA-256 of the current acceptance text.
    pub fn acceptance_digest(&self) -> Option<String> {
        self.acceptance
            .as_deref()
            .map(|a| fsio::sha256_hex(a.as_bytes()))
    }

    /// Work nodes that reach `merge_ready` and `merged`.
    pub fn integrates(&self) -> bool {
        self.kind == NodeKind::Work && self.merge
    }

    /// No further transition will move this node. `validated` only counts for
    /// nodes that never merge.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            NodeStatus::Merged | NodeStatus::Stuck => true,
            NodeStatus::Validated => !self.integrates(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineEdge {
    pub from: String,
    pub to: String,
    pub condition: EdgeCondition,
    pub extra: Attrs,
    pub line: usize,
}

impl PipelineEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, condition: EdgeCondition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition,
            extra: Attrs::new(),
            line: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineGraph {
    pub name: String,
    pub spec_ref: Option<String>,
    pub checkpoint_seq: u64,
    /// Graph attributes other than `spec_ref` and `checkpoint_seq`.
    pub attrs: Attrs,
    nodes: Vec<PipelineNode>,
    edges: Vec<PipelineEdge>,
    /// First occurrence of each node id.
    index: HashMap<String, usize>,
}

// --- Attribute extraction helpers ---

fn take_string(attrs: &mut Attrs, key: &str) -> Option<String> {
    attrs.remove(key).map(|v| match v {
        AttributeValue::String(s) => s,
        other => other.to_string(),
    })
}

fn take_parsed<T: FromStr<Err = String>>(
    attrs: &mut Attrs,
    key: &str,
    line: usize,
) -> Result<Option<T>> {
    match take_string(attrs, key) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|message| RelayError::ParseError {
            line,
            col: 0,
            message,
            source_snippet: None,
        }),
        None => Ok(None),
    }
}

fn take_count(attrs: &mut Attrs, key: &str, line: usize) -> Result<u32> {
    match attrs.remove(key) {
        None => Ok(0),
        Some(v) => v
            .as_int()
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| RelayError::ParseError {
                line,
                col: 0,
                message: format!("{key} must be a non-negative integer, got {v}"),
                source_snippet: None,
            }),
    }
}

fn take_flag(attrs: &mut Attrs, key: &str, line: usize) -> Result<Option<bool>> {
    match attrs.remove(key) {
        None => Ok(None),
        Some(v) => v.as_bool().map(Some).ok_or_else(|| RelayError::ParseError {
            line,
            col: 0,
            message: format!("{key} must be true or false, got {v}"),
            source_snippet: None,
        }),
    }
}

fn node_from_def(def: &NodeDef) -> Result<PipelineNode> {
    let mut attrs = def.attrs.clone();
    let line = def.line;
    let kind = match take_parsed::<NodeKind>(&mut attrs, "kind", line)? {
        Some(kind) => kind,
        None => NodeKind::from_shape(attrs.get("shape").and_then(|v| v.as_str())),
    };
    Ok(PipelineNode {
        id: def.id.clone(),
        kind,
        status: take_parsed(&mut attrs, "status", line)?.unwrap_or(NodeStatus::Pending),
        handler: take_parsed(&mut attrs, "handler", line)?,
        worker_role: take_string(&mut attrs, "worker_role"),
        acceptance: take_string(&mut attrs, "acceptance"),
        acceptance_hash: take_string(&mut attrs, "acceptance_hash"),
        evidence_path: take_string(&mut attrs, "evidence_path"),
        evidence_hash: take_string(&mut attrs, "evidence_hash"),
        retry_count: take_count(&mut attrs, "retry_count", line)?,
        bead_ref: take_string(&mut attrs, "bead_ref"),
        spec_ref: take_string(&mut attrs, "spec_ref"),
        implemented_by: take_string(&mut attrs, "implemented_by"),
        impl_completed_at: take_string(&mut attrs, "impl_completed_at"),
        merge: take_flag(&mut attrs, "merge", line)?.unwrap_or(true),
        extra: attrs,
        line,
    })
}

fn edge_from_def(def: &EdgeDef) -> Result<PipelineEdge> {
    let mut attrs = def.attrs.clone();
    let condition = take_parsed(&mut attrs, "condition", def.line)?.unwrap_or_default();
    Ok(PipelineEdge {
        from: def.from.clone(),
        to: def.to.clone(),
        condition,
        extra: attrs,
        line: def.line,
    })
}

fn put(attrs: &mut Attrs, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        attrs.insert(key.to_string(), AttributeValue::String(v.clone()));
    }
}

impl PipelineGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec_ref: None,
            checkpoint_seq: 0,
            attrs: Attrs::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Append a node. Duplicate ids are kept so the validator can report them.
    pub fn add_node(&mut self, node: PipelineNode) {
        self.index.entry(node.id.clone()).or_insert(self.nodes.len());
        self.nodes.push(node);
    }

    /// Append an edge without checking its endpoints.
    pub fn add_edge(&mut self, edge: PipelineEdge) {
        self.edges.push(edge);
    }

    pub fn from_dot(dot: &DotGraph) -> Result<Self> {
        let mut attrs = dot.attrs.clone();
        let spec_ref = take_string(&mut attrs, "spec_ref");
        let checkpoint_seq = match attrs.remove("checkpoint_seq") {
            None => 0,
            Some(v) => v
                .as_int()
                .and_then(|i| u64::try_from(i).ok())
                .ok_or_else(|| RelayError::ParseError {
                    line: 1,
                    col: 0,
                    message: format!("checkpoint_seq must be a non-negative integer, got {v}"),
                    source_snippet: None,
                })?,
        };

        let mut graph = PipelineGraph {
            name: dot.name.clone(),
            spec_ref,
            checkpoint_seq,
            attrs,
            nodes: Vec::with_capacity(dot.nodes.len()),
            edges: Vec::with_capacity(dot.edges.len()),
            index: HashMap::new(),
        };

        for def in &dot.nodes {
            graph.add_node(node_from_def(def)?);
        }
        for def in &dot.edges {
            for endpoint in [&def.from, &def.to] {
                if !graph.index.contains_key(endpoint.as_str()) {
                    return Err(RelayError::UnresolvedReference {
                        reference: endpoint.clone(),
                        message: format!(
                            "edge {} -> {} on line {} has no node statement for '{}'",
                            def.from, def.to, def.line, endpoint
                        ),
                    });
                }
            }
            graph.add_edge(edge_from_def(def)?);
        }
        Ok(graph)
    }

    pub fn to_dot(&self) -> DotGraph {
        let mut attrs = self.attrs.clone();
        put(&mut attrs, "spec_ref", &self.spec_ref);
        attrs.insert(
            "checkpoint_seq".into(),
            AttributeValue::Integer(self.checkpoint_seq as i64),
        );

        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                let mut a = n.extra.clone();
                a.entry("shape".into())
                    .or_insert_with(|| AttributeValue::from(n.kind.shape()));
                a.insert("kind".into(), n.kind.as_str().into());
                a.insert("status".into(), n.status.as_str().into());
                a.insert("retry_count".into(), AttributeValue::Integer(n.retry_count as i64));
                put(&mut a, "handler", &n.handler.map(|h| h.as_str().to_string()));
                put(&mut a, "worker_role", &n.worker_role);
                put(&mut a, "acceptance", &n.acceptance);
                put(&mut a, "acceptance_hash", &n.acceptance_hash);
                put(&mut a, "evidence_path", &n.evidence_path);
                put(&mut a, "evidence_hash", &n.evidence_hash);
                put(&mut a, "bead_ref", &n.bead_ref);
                put(&mut a, "spec_ref", &n.spec_ref);
                put(&mut a, "implemented_by", &n.implemented_by);
                put(&mut a, "impl_completed_at", &n.impl_completed_at);
                if !n.merge {
                    a.insert("merge".into(), AttributeValue::Boolean(false));
                }
                NodeDef {
                    id: n.id.clone(),
                    attrs: a,
                    line: n.line,
                }
            })
            .collect();

        let edges = self
            .edges
            .iter()
            .map(|e| {
                let mut a = e.extra.clone();
                if e.condition != EdgeCondition::Unconditional {
                    a.insert("condition".into(), e.condition.as_str().into());
                }
                EdgeDef {
                    from: e.from.clone(),
                    to: e.to.clone(),
                    attrs: a,
                    line: e.line,
                }
            })
            .collect();

        DotGraph {
            name: self.name.clone(),
            attrs,
            nodes,
            edges,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Self::from_dot(&relay_dot::parse(text)?)
    }

    pub fn render(&self) -> String {
        relay_dot::render(&self.to_dot())
    }

    /// Read and parse a graph file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let graph = Self::parse(&text)?;
        tracing::debug!(
            path = %path.display(),
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            seq = graph.checkpoint_seq,
            "Graph loaded"
        );
        Ok(graph)
    }

    /// Bump `checkpoint_seq` and replace the file atomically.
    ///
    /// Callers that race with other writers must hold the graph lock
    /// ([`crate::lock::FileLock::acquire_for`]).
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.checkpoint_seq += 1;
        fsio::atomic_write(path, self.render().as_bytes())?;
        tracing::debug!(path = %path.display(), seq = self.checkpoint_seq, "Graph saved");
        Ok(())
    }

    // --- Accessors ---

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut PipelineNode> {
        match self.index.get(id) {
            Some(&i) => self.nodes.get_mut(i),
            None => None,
        }
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.iter()
    }

    pub fn all_edges(&self) -> &[PipelineEdge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a PipelineEdge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a PipelineEdge> + 'a {
        self.edges.iter().filter(move |e| e.to == id)
    }

    /// Sources of unconditional/on-success edges into `id`.
    pub fn forward_predecessors<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.incoming(id)
            .filter(|e| e.condition.is_forward())
            .map(|e| e.from.as_str())
    }

    pub fn nodes_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.iter().filter(move |n| n.kind == kind)
    }

    pub fn start_nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.nodes_of_kind(NodeKind::Start)
    }

    pub fn exit_nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.iter().filter(|n| n.kind.is_exit())
    }

    /// Every work node is terminal.
    pub fn is_complete(&self) -> bool {
        self.nodes_of_kind(NodeKind::Work).all(|n| n.is_terminal())
    }
}

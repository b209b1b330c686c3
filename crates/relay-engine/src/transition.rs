//! The transition engine: the only path by which a node's status changes.
//!
//! Every call runs one lock-scoped read-modify-write cycle on the graph file:
//! lock, reload, check legality, validate, apply guard rails, mutate, append
//! the audit line, write atomically, unlock. A rejected transition writes
//! nothing.

use std::path::{Path, PathBuf};

use relay_types::{RelayError, Result};

use crate::audit::{AuditLog, AuditRecord};
use crate::config::RelayConfig;
use crate::graph::{NodeStatus, PipelineGraph};
use crate::guard;
use crate::lock::FileLock;
use crate::retry::LockPolicy;
use crate::validation;

/// Statuses reachable from `from` by an ordinary transition.
///
/// `stuck` is absent: only the engine enters it, when the retry cap is hit.
pub fn allowed_targets(from: NodeStatus) -> &'static [NodeStatus] {
    use NodeStatus::*;
    match from {
        Pending => &[Active],
        Active => &[ImplComplete],
        ImplComplete => &[Validated, Failed],
        Failed => &[Active],
        Validated => &[MergeReady],
        MergeReady => &[Merged],
        Merged | Stuck => &[],
    }
}

pub fn is_legal(from: NodeStatus, to: NodeStatus) -> bool {
    allowed_targets(from).contains(&to)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub node_id: String,
    pub to: NodeStatus,
    pub actor: String,
    pub evidence: Option<PathBuf>,
}

impl TransitionRequest {
    pub fn new(node_id: impl Into<String>, to: NodeStatus, actor: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            to,
            actor: actor.into(),
            evidence: None,
        }
    }

    pub fn with_evidence(mut self, path: impl Into<PathBuf>) -> Self {
        self.evidence = Some(path.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct TransitionEngine {
    audit: AuditLog,
    max_retries: u32,
    lock_policy: LockPolicy,
}

impl TransitionEngine {
    pub fn new(audit_path: impl Into<PathBuf>, max_retries: u32, lock_policy: LockPolicy) -> Self {
        Self {
            audit: AuditLog::new(audit_path),
            max_retries,
            lock_policy,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            config.layout().audit_log(),
            config.max_retries,
            config.lock_policy(),
        )
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn lock_policy(&self) -> &LockPolicy {
        &self.lock_policy
    }

    /// Apply one transition to the graph at `graph_path`.
    ///
    /// Returns the audit record that was appended. When the retry cap is
    /// exhausted the node is persisted as `stuck` and `RetriesExhausted` is
    /// returned.
    pub fn transition(&self, graph_path: &Path, req: &TransitionRequest) -> Result<AuditRecord> {
        let _lock = FileLock::acquire_for(graph_path, &self.lock_policy)?;
        let mut graph = PipelineGraph::load(graph_path)?;

        let node = graph
            .node(&req.node_id)
            .ok_or_else(|| RelayError::NodeNotFound {
                node: req.node_id.clone(),
            })?;
        let from = node.status;

        if !is_legal(from, req.to) {
            tracing::info!(
                node = %req.node_id,
                %from,
                to = %req.to,
                actor = %req.actor,
                "Illegal transition rejected"
            );
            return Err(RelayError::IllegalTransition {
                node: req.node_id.clone(),
                from: from.to_string(),
                to: req.to.to_string(),
            });
        }

        validation::validate_or_raise(&graph)?;

        if from == NodeStatus::Failed && node.retry_count >= self.max_retries {
            let attempts = node.retry_count;
            self.force_stuck(&mut graph, graph_path, req)?;
            return Err(RelayError::RetriesExhausted {
                node: req.node_id.clone(),
                attempts,
            });
        }

        let effects = guard::check(node, req.to, &req.actor, req.evidence.as_deref())?;

        let node = graph
            .node_mut(&req.node_id)
            .ok_or_else(|| RelayError::NodeNotFound {
                node: req.node_id.clone(),
            })?;
        node.status = req.to;
        match (from, req.to) {
            (NodeStatus::Failed, NodeStatus::Active) => {
                node.retry_count += 1;
                node.implemented_by = Some(req.actor.clone());
            }
            (_, NodeStatus::Active) => node.implemented_by = Some(req.actor.clone()),
            (_, NodeStatus::ImplComplete) => {
                node.implemented_by = Some(req.actor.clone());
                node.impl_completed_at = Some(crate::now_rfc3339());
            }
            _ => {}
        }
        if effects.evidence_path.is_some() {
            node.evidence_path = effects.evidence_path;
            node.evidence_hash = effects.evidence_hash.clone();
        }
        if effects.acceptance_hash.is_some() {
            node.acceptance_hash = effects.acceptance_hash;
        }
        let retry_count = node.retry_count;

        let record = AuditRecord::now(&req.node_id, from, req.to, &req.actor, effects.evidence_hash);
        self.audit.append(&record)?;
        graph.save(graph_path)?;

        tracing::info!(
            node = %req.node_id,
            %from,
            to = %req.to,
            actor = %req.actor,
            retry_count,
            seq = graph.checkpoint_seq,
            "Transition applied"
        );
        Ok(record)
    }

    fn force_stuck(
        &self,
        graph: &mut PipelineGraph,
        graph_path: &Path,
        req: &TransitionRequest,
    ) -> Result<()> {
        let node = graph
            .node_mut(&req.node_id)
            .ok_or_else(|| RelayError::NodeNotFound {
                node: req.node_id.clone(),
            })?;
        node.status = NodeStatus::Stuck;
        let retries = node.retry_count;
        self.audit.append(&AuditRecord::now(
            &req.node_id,
            NodeStatus::Failed,
            NodeStatus::Stuck,
            &req.actor,
            None,
        ))?;
        graph.save(graph_path)?;
        tracing::warn!(
            node = %req.node_id,
            retries,
            max = self.max_retries,
            "Retry cap reached, node is stuck"
        );
        Ok(())
    }
}

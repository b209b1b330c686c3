//! Anti-gaming guard rails applied by the transition engine.
//!
//! Guards run after the legality check and before any mutation. A refusal is
//! a `GuardRail` error naming the rule; nothing is written. On success the
//! guards return the [`GuardEffects`] the engine must apply to the node.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_types::{RelayError, Result};

use crate::fsio;
use crate::graph::{NodeKind, NodeStatus, PipelineNode};

/// Tolerance between the evidence file's mtime and `impl_completed_at`, for
/// filesystems with coarse timestamps.
pub const EVIDENCE_CLOCK_SLACK: Duration = Duration::from_secs(2);

pub const RULE_ACCEPTANCE: &str = "acceptance_immutable";
pub const RULE_MERGE_ELIGIBILITY: &str = "merge_eligibility";
pub const RULE_SEPARATION: &str = "separation";
pub const RULE_EVIDENCE_REQUIRED: &str = "evidence_required";
pub const RULE_EVIDENCE_MISSING: &str = "evidence_missing";
pub const RULE_EVIDENCE_STALE: &str = "evidence_stale";

/// Node updates implied by a transition that passed every guard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardEffects {
    pub evidence_path: Option<String>,
    pub evidence_hash: Option<String>,
    /// Acceptance digest to pin, set on the first `validated`.
    pub acceptance_hash: Option<String>,
}

fn refuse(node: &PipelineNode, rule: &str, message: String) -> RelayError {
    tracing::warn!(node = %node.id, rule, %message, "Guard rail refused transition");
    RelayError::GuardRail {
        node: node.id.clone(),
        rule: rule.to_string(),
        message,
    }
}

/// Check every guard for moving `node` to `to` on behalf of `actor`.
pub fn check(
    node: &PipelineNode,
    to: NodeStatus,
    actor: &str,
    evidence: Option<&Path>,
) -> Result<GuardEffects> {
    check_acceptance_intact(node)?;
    check_merge_eligibility(node, to)?;
    check_separation(node, to, actor)?;

    let mut effects = GuardEffects::default();
    match (to, evidence) {
        (NodeStatus::Validated, None) => {
            return Err(refuse(
                node,
                RULE_EVIDENCE_REQUIRED,
                "validation requires an evidence file".into(),
            ));
        }
        (NodeStatus::Validated, Some(path)) => {
            effects.evidence_hash = Some(check_evidence_fresh(node, path)?);
            effects.evidence_path = Some(path.display().to_string());
            if node.acceptance_hash.is_none() {
                effects.acceptance_hash = node.acceptance_digest();
            }
        }
        (_, Some(path)) => {
            if !path.is_file() {
                return Err(refuse(
                    node,
                    RULE_EVIDENCE_MISSING,
                    format!("evidence file {} does not exist", path.display()),
                ));
            }
            effects.evidence_hash = Some(fsio::file_sha256(path)?);
        }
        (_, None) => {}
    }
    Ok(effects)
}

/// Work past validation must carry a pin.
pub fn requires_acceptance_pin(node: &PipelineNode) -> bool {
    node.kind == NodeKind::Work
        && matches!(
            node.status,
            NodeStatus::Validated | NodeStatus::MergeReady | NodeStatus::Merged
        )
}

/// The acceptance text must still hash to the pinned digest.
pub fn check_acceptance_intact(node: &PipelineNode) -> Result<()> {
    let Some(stored) = node.acceptance_hash.as_deref() else {
        if requires_acceptance_pin(node) {
            return Err(refuse(
                node,
                RULE_ACCEPTANCE,
                format!("node is {} but has no acceptance_hash", node.status),
            ));
        }
        return Ok(());
    };
    match node.acceptance_digest() {
        Some(current) if current == stored => Ok(()),
        _ => Err(refuse(
            node,
            RULE_ACCEPTANCE,
            "acceptance criteria changed after the node was first validated".into(),
        )),
    }
}

fn check_merge_eligibility(node: &PipelineNode, to: NodeStatus) -> Result<()> {
    let merging = matches!(to, NodeStatus::MergeReady | NodeStatus::Merged);
    if merging && node.kind != NodeKind::Work {
        return Err(refuse(
            node,
            RULE_MERGE_ELIGIBILITY,
            format!("only work nodes can merge, this node is {}", node.kind),
        ));
    }
    if merging && !node.merge {
        return Err(refuse(
            node,
            RULE_MERGE_ELIGIBILITY,
            "node is marked merge=false".into(),
        ));
    }
    Ok(())
}

fn check_separation(node: &PipelineNode, to: NodeStatus, actor: &str) -> Result<()> {
    let judging = node.status == NodeStatus::ImplComplete
        && matches!(to, NodeStatus::Validated | NodeStatus::Failed);
    if judging && node.implemented_by.as_deref() == Some(actor) {
        return Err(refuse(
            node,
            RULE_SEPARATION,
            format!("'{actor}' implemented this node and cannot judge it"),
        ));
    }
    Ok(())
}

/// Evidence must exist and must not predate the implementation it vouches for.
/// Returns its SHA-256.
fn check_evidence_fresh(node: &PipelineNode, path: &Path) -> Result<String> {
    let meta = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        _ => {
            return Err(refuse(
                node,
                RULE_EVIDENCE_MISSING,
                format!("evidence file {} does not exist", path.display()),
            ))
        }
    };

    if let Some(completed) = node.impl_completed_at.as_deref() {
        let completed = DateTime::parse_from_rfc3339(completed)
            .map_err(|e| {
                RelayError::Other(format!(
                    "node '{}' has an unreadable impl_completed_at '{completed}': {e}",
                    node.id
                ))
            })?
            .with_timezone(&Utc);
        let modified: DateTime<Utc> = meta.modified()?.into();
        let slack = chrono::Duration::from_std(EVIDENCE_CLOCK_SLACK)
            .unwrap_or_else(|_| chrono::Duration::zero());
        if modified + slack < completed {
            return Err(refuse(
                node,
                RULE_EVIDENCE_STALE,
                format!(
                    "evidence {} was last modified at {} before implementation completed at {}",
                    path.display(),
                    modified.to_rfc3339(),
                    completed.to_rfc3339()
                ),
            ));
        }
    }

    fsio::file_sha256(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn completed_node(implementer: &str) -> PipelineNode {
        let mut node = PipelineNode::work("api", "rust", "cargo test passes");
        node.status = NodeStatus::ImplComplete;
        node.implemented_by = Some(implementer.to_string());
        node.impl_completed_at = Some(Utc::now().to_rfc3339());
        node
    }

    fn rule_of(err: RelayError) -> String {
        match err {
            RelayError::GuardRail { rule, .. } => rule,
            other => panic!("expected GuardRail, got {other:?}"),
        }
    }

    #[test]
    fn implementer_cannot_validate_own_work() {
        let dir = tempfile::tempdir().unwrap();
        let evidence = dir.path().join("ev.txt");
        std::fs::write(&evidence, "ok").unwrap();
        let node = completed_node("impl-1");

        let err = check(&node, NodeStatus::Validated, "impl-1", Some(&evidence)).unwrap_err();
        assert_eq!(rule_of(err), RULE_SEPARATION);
        let err = check(&node, NodeStatus::Failed, "impl-1", None).unwrap_err();
        assert_eq!(rule_of(err), RULE_SEPARATION);

        assert!(check(&node, NodeStatus::Validated, "supervisor", Some(&evidence)).is_ok());
    }

    #[test]
    fn validation_requires_existing_evidence() {
        let node = completed_node("impl-1");
        let err = check(&node, NodeStatus::Validated, "sup", None).unwrap_err();
        assert_eq!(rule_of(err), RULE_EVIDENCE_REQUIRED);

        let err = check(&node, NodeStatus::Validated, "sup", Some(Path::new("/no/such/file")))
            .unwrap_err();
        assert_eq!(rule_of(err), RULE_EVIDENCE_MISSING);
    }

    #[test]
    fn stale_evidence_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let evidence = dir.path().join("old.log");
        std::fs::write(&evidence, "from yesterday").unwrap();
        let file = std::fs::File::options().write(true).open(&evidence).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600)).unwrap();
        drop(file);

        let node = completed_node("impl-1");
        let err = check(&node, NodeStatus::Validated, "sup", Some(&evidence)).unwrap_err();
        assert_eq!(rule_of(err), RULE_EVIDENCE_STALE);
    }

    #[test]
    fn first_validation_pins_acceptance_and_hashes_evidence() {
        let dir = tempfile::tempdir().unwrap();
        let evidence = dir.path().join("ev.txt");
        std::fs::write(&evidence, "abc").unwrap();
        let node = completed_node("impl-1");

        let effects = check(&node, NodeStatus::Validated, "sup", Some(&evidence)).unwrap();
        assert_eq!(effects.acceptance_hash, node.acceptance_digest());
        assert_eq!(effects.evidence_hash.as_deref(), Some(fsio::sha256_hex(b"abc").as_str()));
        assert_eq!(effects.evidence_path, Some(evidence.display().to_string()));
    }

    #[test]
    fn changed_acceptance_blocks_every_transition() {
        let mut node = PipelineNode::work("api", "rust", "cargo test passes");
        node.status = NodeStatus::Validated;
        node.acceptance_hash = node.acceptance_digest();
        assert!(check(&node, NodeStatus::MergeReady, "queue", None).is_ok());

        node.acceptance = Some("cargo build passes".into());
        let err = check(&node, NodeStatus::MergeReady, "queue", None).unwrap_err();
        assert_eq!(rule_of(err), RULE_ACCEPTANCE);
    }

    #[test]
    fn only_work_nodes_merge() {
        let mut node = PipelineNode::new("gate", NodeKind::ValidationGate);
        node.status = NodeStatus::Validated;
        let err = check(&node, NodeStatus::MergeReady, "queue", None).unwrap_err();
        assert_eq!(rule_of(err), RULE_MERGE_ELIGIBILITY);
    }

    #[test]
    fn removed_pin_blocks_transitions() {
        let mut node = PipelineNode::work("api", "rust", "cargo test passes");
        node.status = NodeStatus::Validated;
        let err = check(&node, NodeStatus::MergeReady, "queue", None).unwrap_err();
        assert_eq!(rule_of(err), RULE_ACCEPTANCE);

        node.status = NodeStatus::ImplComplete;
        node.implemented_by = Some("impl-1".into());
        assert!(check_acceptance_intact(&node).is_ok());
    }

    #[test]
    fn non_integrating_work_does_not_merge() {
        let mut node = PipelineNode::work("docs", "writer", "docs build");
        node.status = NodeStatus::Validated;
        node.acceptance_hash = node.acceptance_digest();
        node.merge = false;
        let err = check(&node, NodeStatus::MergeReady, "queue", None).unwrap_err();
        assert_eq!(rule_of(err), RULE_MERGE_ELIGIBILITY);
    }

    #[test]
    fn optional_evidence_on_failure_is_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let evidence = dir.path().join("fail.log");
        std::fs::write(&evidence, "boom").unwrap();
        let node = completed_node("impl-1");
        let effects = check(&node, NodeStatus::Failed, "sup", Some(&evidence)).unwrap();
        assert_eq!(effects.evidence_hash, Some(fsio::sha256_hex(b"boom")));
        assert!(effects.acceptance_hash.is_none());
    }
}

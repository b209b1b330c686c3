//! Append-only audit trail of node transitions (JSON lines).

use std::path::{Path, PathBuf};

use relay_types::Result;
use serde::{Deserialize, Serialize};

use crate::fsio;
use crate::graph::NodeStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub node_id: String,
    pub from: NodeStatus,
    pub to: NodeStatus,
    pub actor: String,
    pub evidence_hash: Option<String>,
}

impl AuditRecord {
    pub fn now(
        node_id: &str,
        from: NodeStatus,
        to: NodeStatus,
        actor: &str,
        evidence_hash: Option<String>,
    ) -> Self {
        Self {
            timestamp: crate::now_rfc3339(),
            node_id: node_id.to_string(),
            from,
            to,
            actor: actor.to_string(),
            evidence_hash,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        fsio::append_json_line(&self.path, record)
    }

    pub fn read_all(&self) -> Result<Vec<AuditRecord>> {
        fsio::read_json_lines(&self.path)
    }

    /// Records for one node, oldest first.
    pub fn history(&self, node_id: &str) -> Result<Vec<AuditRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.node_id == node_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_filter_history() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        log.append(&AuditRecord::now("a", NodeStatus::Pending, NodeStatus::Active, "w1", None))
            .unwrap();
        log.append(&AuditRecord::now("b", NodeStatus::Pending, NodeStatus::Active, "w2", None))
            .unwrap();
        log.append(&AuditRecord::now(
            "a",
            NodeStatus::Active,
            NodeStatus::ImplComplete,
            "w1",
            Some("abc".into()),
        ))
        .unwrap();

        assert_eq!(log.read_all().unwrap().len(), 3);
        let history = log.history("a").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].to, NodeStatus::ImplComplete);
        assert_eq!(history[1].evidence_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn line_format_uses_status_names() {
        let record = AuditRecord::now("n", NodeStatus::ImplComplete, NodeStatus::Validated, "s", None);
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["from"], "impl_complete");
        assert_eq!(json["to"], "validated");
        assert!(json["evidence_hash"].is_null());
    }
}

//! Strictly serial merge queue.
//!
//! Entries are integrated one at a time in FIFO order: rebase onto the
//! integration branch, run the tests, fast-forward, delete the branch, mark
//! the node `merged`. An entry that fails is held as `conflict` at the head
//! of the queue and nothing behind it is attempted until it is resolved or
//! skipped.
//!
//! The queue file is only locked while it is read or rewritten; the
//! integration itself runs unlocked, with the head entry marked `processing`
//! and stamped with the processor's pid. A merged entry stays at the head,
//! marked `merged`, until its node has been moved to `merged`.
//!
//! Lock acquisition backs off with blocking sleeps, so the async entry point
//! runs every locked section on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use relay_types::{RelayError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::fsio;
use crate::graph::{NodeStatus, PipelineGraph};
use crate::identity::{is_process_alive, IdentityRegistry};
use crate::integrator::{Integrator, RebaseOutcome};
use crate::lock::FileLock;
use crate::retry::LockPolicy;
use crate::transition::{TransitionEngine, TransitionRequest};

/// Actor recorded in the audit log for transitions made by the queue.
pub const QUEUE_ACTOR: &str = "merge-queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Queued,
    Processing,
    Merged,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeQueueEntry {
    pub id: String,
    pub identity_name: String,
    pub branch_ref: String,
    pub node_id: String,
    pub requested_at: String,
    pub status: EntryStatus,
    #[serde(default)]
    pub conflicting_files: Vec<String>,
    pub reason: Option<String>,
    pub processor_pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Merged,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedEntry {
    pub entry: MergeQueueEntry,
    pub archived_at: String,
    pub disposition: Disposition,
}

/// Result of one [`MergeQueue::process_next`] call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged { entry: MergeQueueEntry },
    Conflict {
        entry: MergeQueueEntry,
        conflicting_files: Vec<String>,
    },
    /// The head entry is in conflict; nothing behind it may proceed.
    Blocked { entry: MergeQueueEntry },
    /// Another live process is integrating the head entry.
    Busy { entry: MergeQueueEntry },
    Empty,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    entries: Vec<MergeQueueEntry>,
}

enum Integration {
    Success,
    Failure {
        conflicting_files: Vec<String>,
        reason: String,
    },
}

#[derive(Clone)]
pub struct MergeQueue {
    queue_path: PathBuf,
    archive_path: PathBuf,
    integration_branch: String,
    graph_path: PathBuf,
    integrator: Arc<dyn Integrator>,
    engine: TransitionEngine,
    lock_policy: LockPolicy,
    registry: Option<IdentityRegistry>,
}

impl MergeQueue {
    pub fn new(config: &RelayConfig, graph_path: impl Into<PathBuf>, integrator: Arc<dyn Integrator>) -> Self {
        let layout = config.layout();
        Self {
            queue_path: layout.merge_queue(),
            archive_path: layout.merge_archive(),
            integration_branch: config.integration_branch.clone(),
            graph_path: graph_path.into(),
            integrator,
            engine: TransitionEngine::from_config(config),
            lock_policy: config.lock_policy(),
            registry: None,
        }
    }

    /// Require every enqueued identity name to be registered.
    pub fn with_registry(mut self, registry: IdentityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn queue_path(&self) -> &Path {
        &self.queue_path
    }

    fn lock(&self) -> Result<FileLock> {
        FileLock::acquire_for(&self.queue_path, &self.lock_policy)
    }

    fn load(&self) -> Result<QueueFile> {
        Ok(fsio::read_json(&self.queue_path)?.unwrap_or_default())
    }

    fn store(&self, queue: &QueueFile) -> Result<()> {
        fsio::atomic_write_json(&self.queue_path, queue)
    }

    fn archive(&self, entry: MergeQueueEntry, disposition: Disposition) -> Result<ArchivedEntry> {
        let archived = ArchivedEntry {
            entry,
            archived_at: crate::now_rfc3339(),
            disposition,
        };
        fsio::append_json_line(&self.archive_path, &archived)?;
        Ok(archived)
    }

    /// Add a branch to the tail of the queue and move its node to
    /// `merge_ready`.
    pub fn enqueue(&self, identity_name: &str, branch_ref: &str, node_id: &str) -> Result<MergeQueueEntry> {
        if let Some(registry) = &self.registry {
            if registry.find_by_name(identity_name)?.is_empty() {
                return Err(RelayError::IdentityNotFound(identity_name.to_string()));
            }
        }

        let _lock = self.lock()?;
        let mut queue = self.load()?;
        if queue.entries.iter().any(|e| e.branch_ref == branch_ref) {
            return Err(RelayError::DuplicateQueueEntry(branch_ref.to_string()));
        }

        let graph = PipelineGraph::load(&self.graph_path)?;
        let status = graph
            .node(node_id)
            .map(|n| n.status)
            .ok_or_else(|| RelayError::NodeNotFound {
                node: node_id.to_string(),
            })?;
        if status != NodeStatus::MergeReady {
            self.engine.transition(
                &self.graph_path,
                &TransitionRequest::new(node_id, NodeStatus::MergeReady, identity_name),
            )?;
        }

        let entry = MergeQueueEntry {
            id: Uuid::new_v4().to_string(),
            identity_name: identity_name.to_string(),
            branch_ref: branch_ref.to_string(),
            node_id: node_id.to_string(),
            requested_at: crate::now_rfc3339(),
            status: EntryStatus::Queued,
            conflicting_files: Vec::new(),
            reason: None,
            processor_pid: None,
        };
        queue.entries.push(entry.clone());
        self.store(&queue)?;
        tracing::info!(branch = %branch_ref, node = %node_id, identity = %identity_name, position = queue.entries.len(), "Enqueued for merge");
        Ok(entry)
    }

    /// Integrate the head of the queue.
    ///
    /// A head already marked `merged` is not integrated again; only its node
    /// transition is retried.
    pub async fn process_next(&self) -> Result<MergeOutcome> {
        let Some(claim) = self.blocking(|q| q.claim_head()).await? else {
            return Ok(MergeOutcome::Empty);
        };
        let entry = match claim {
            Claim::Ready(entry) => entry,
            Claim::Integrated(entry) => {
                tracing::info!(branch = %entry.branch_ref, node = %entry.node_id, "Recording earlier merge");
                return self.blocking(move |q| q.record_merged(entry)).await;
            }
            Claim::Blocked(entry) => return Ok(MergeOutcome::Blocked { entry }),
            Claim::Busy(entry) => return Ok(MergeOutcome::Busy { entry }),
        };

        tracing::info!(branch = %entry.branch_ref, node = %entry.node_id, "Integrating");
        match self.integrate(&entry).await {
            Integration::Success => self.blocking(move |q| q.finish_merged(entry)).await,
            Integration::Failure {
                conflicting_files,
                reason,
            } => {
                self.blocking(move |q| q.finish_conflict(entry, conflicting_files, reason))
                    .await
            }
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(MergeQueue) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || f(queue))
            .await
            .map_err(|e| RelayError::Other(format!("merge queue task failed: {e}")))?
    }

    fn claim_head(&self) -> Result<Option<Claim>> {
        let _lock = self.lock()?;
        let mut queue = self.load()?;
        let Some(head) = queue.entries.first_mut() else {
            return Ok(None);
        };
        match head.status {
            EntryStatus::Conflict => return Ok(Some(Claim::Blocked(head.clone()))),
            EntryStatus::Processing => {
                let own = std::process::id();
                match head.processor_pid {
                    Some(pid) if pid != own && is_process_alive(pid) => {
                        return Ok(Some(Claim::Busy(head.clone())));
                    }
                    pid => tracing::warn!(
                        branch = %head.branch_ref,
                        pid = ?pid,
                        "Reclaiming entry left processing by a dead processor"
                    ),
                }
            }
            EntryStatus::Merged => return Ok(Some(Claim::Integrated(head.clone()))),
            EntryStatus::Queued => {}
        }
        head.status = EntryStatus::Processing;
        head.processor_pid = Some(std::process::id());
        let claimed = head.clone();
        self.store(&queue)?;
        Ok(Some(Claim::Ready(claimed)))
    }

    async fn integrate(&self, entry: &MergeQueueEntry) -> Integration {
        let branch = entry.branch_ref.as_str();
        let onto = self.integration_branch.as_str();
        let failure = |files: Vec<String>, reason: String| Integration::Failure {
            conflicting_files: files,
            reason,
        };

        match self.integrator.rebase(branch, onto).await {
            Ok(RebaseOutcome::Clean) => {}
            Ok(RebaseOutcome::Conflict(files)) => {
                return failure(files, format!("rebase onto {onto} conflicted"));
            }
            Err(e) => return failure(Vec::new(), format!("rebase failed: {e}")),
        }
        match self.integrator.run_tests(branch).await {
            Ok(t) if t.passed => {}
            Ok(t) => return failure(Vec::new(), format!("tests failed: {}", t.summary)),
            Err(e) => return failure(Vec::new(), format!("test run failed: {e}")),
        }
        if let Err(e) = self.integrator.fast_forward(branch, onto).await {
            return failure(Vec::new(), format!("fast-forward failed: {e}"));
        }
        if let Err(e) = self.integrator.delete_branch(branch).await {
            tracing::warn!(%branch, error = %e, "Merged branch could not be deleted");
        }
        Integration::Success
    }

    fn finish_merged(&self, mut entry: MergeQueueEntry) -> Result<MergeOutcome> {
        entry.status = EntryStatus::Merged;
        entry.processor_pid = None;
        {
            let _lock = self.lock()?;
            let mut queue = self.load()?;
            match queue.entries.iter_mut().find(|e| e.id == entry.id) {
                Some(slot) => *slot = entry.clone(),
                None => return Err(RelayError::QueueEntryNotFound(entry.branch_ref)),
            }
            self.store(&queue)?;
        }
        tracing::info!(branch = %entry.branch_ref, node = %entry.node_id, "Merged");
        self.record_merged(entry)
    }

    /// Move the node of a merged head entry to `merged`, then archive the
    /// entry. On failure the entry stays at the head.
    fn record_merged(&self, entry: MergeQueueEntry) -> Result<MergeOutcome> {
        let graph = PipelineGraph::load(&self.graph_path)?;
        let status = graph
            .node(&entry.node_id)
            .map(|n| n.status)
            .ok_or_else(|| RelayError::NodeNotFound {
                node: entry.node_id.clone(),
            })?;
        if status != NodeStatus::Merged {
            let req = TransitionRequest::new(&entry.node_id, NodeStatus::Merged, QUEUE_ACTOR);
            if let Err(e) = self.engine.transition(&self.graph_path, &req) {
                tracing::warn!(
                    branch = %entry.branch_ref,
                    node = %entry.node_id,
                    error = %e,
                    "Node not marked merged, entry kept at head"
                );
                return Err(e);
            }
        }

        let _lock = self.lock()?;
        let mut queue = self.load()?;
        queue.entries.retain(|e| e.id != entry.id);
        self.store(&queue)?;
        self.archive(entry.clone(), Disposition::Merged)?;
        Ok(MergeOutcome::Merged { entry })
    }

    fn finish_conflict(
        &self,
        mut entry: MergeQueueEntry,
        conflicting_files: Vec<String>,
        reason: String,
    ) -> Result<MergeOutcome> {
        let _lock = self.lock()?;
        let mut queue = self.load()?;
        entry.status = EntryStatus::Conflict;
        entry.conflicting_files = conflicting_files.clone();
        entry.reason = Some(reason);
        entry.processor_pid = None;
        match queue.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(slot) => *slot = entry.clone(),
            None => return Err(RelayError::QueueEntryNotFound(entry.branch_ref)),
        }
        self.store(&queue)?;
        tracing::warn!(
            branch = %entry.branch_ref,
            reason = ?entry.reason,
            files = ?entry.conflicting_files,
            "Merge conflict, queue held"
        );
        Ok(MergeOutcome::Conflict {
            entry,
            conflicting_files,
        })
    }

    /// Put a conflicting entry back in line, keeping its position.
    pub fn resolve(&self, branch_ref: &str) -> Result<MergeQueueEntry> {
        let _lock = self.lock()?;
        let mut queue = self.load()?;
        let entry = queue
            .entries
            .iter_mut()
            .find(|e| e.branch_ref == branch_ref && e.status == EntryStatus::Conflict)
            .ok_or_else(|| RelayError::QueueEntryNotFound(branch_ref.to_string()))?;
        entry.status = EntryStatus::Queued;
        entry.conflicting_files.clear();
        entry.reason = None;
        let resolved = entry.clone();
        self.store(&queue)?;
        tracing::info!(branch = %branch_ref, "Conflict resolved, entry re-queued");
        Ok(resolved)
    }

    /// Drop an entry from the queue and archive it as abandoned.
    pub fn skip(&self, branch_ref: &str) -> Result<ArchivedEntry> {
        let _lock = self.lock()?;
        let mut queue = self.load()?;
        let pos = queue
            .entries
            .iter()
            .position(|e| e.branch_ref == branch_ref)
            .ok_or_else(|| RelayError::QueueEntryNotFound(branch_ref.to_string()))?;
        let entry = &queue.entries[pos];
        if entry.status == EntryStatus::Merged {
            return Err(RelayError::Other(format!(
                "branch '{branch_ref}' is already merged, process the queue to record it"
            )));
        }
        if entry.status == EntryStatus::Processing
            && entry.processor_pid.is_some_and(|pid| pid != std::process::id() && is_process_alive(pid))
        {
            return Err(RelayError::Other(format!(
                "branch '{branch_ref}' is being integrated by another process"
            )));
        }
        let entry = queue.entries.remove(pos);
        self.store(&queue)?;
        tracing::info!(branch = %branch_ref, "Entry skipped");
        self.archive(entry, Disposition::Abandoned)
    }

    /// Entries still in the queue, head first.
    pub fn list(&self) -> Result<Vec<MergeQueueEntry>> {
        Ok(self.load()?.entries)
    }

    pub fn archived(&self) -> Result<Vec<ArchivedEntry>> {
        fsio::read_json_lines(&self.archive_path)
    }
}

enum Claim {
    Ready(MergeQueueEntry),
    /// Head already integrated; its node transition is outstanding.
    Integrated(MergeQueueEntry),
    Blocked(MergeQueueEntry),
    Busy(MergeQueueEntry),
}

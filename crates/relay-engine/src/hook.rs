//! Per-identity hooks: the persistent work state a successor resumes from.
//!
//! A worker records every phase change in its hook. When the worker crashes,
//! its successor consumes the hook exactly once through
//! [`HookManager::resume_from`] and receives a resumption brief.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use relay_types::{RelayError, Result};
use serde::{Deserialize, Serialize};

use crate::config::RelayConfig;
use crate::fsio;
use crate::lock::FileLock;
use crate::retry::LockPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Executing,
    Validating,
    Merging,
    Done,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Planning,
        Phase::Executing,
        Phase::Validating,
        Phase::Merging,
        Phase::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Executing => "executing",
            Phase::Validating => "validating",
            Phase::Merging => "merging",
            Phase::Done => "done",
        }
    }

    /// Phases strictly before this one.
    pub fn completed(&self) -> Vec<Phase> {
        Phase::ALL.into_iter().filter(|p| p < self).collect()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    pub identity_id: String,
    pub phase: Phase,
    pub work_summary: String,
    pub last_checkpoint_at: String,
    pub resumption_instructions: Option<String>,
    /// Successor that consumed this hook.
    pub consumed_by: Option<String>,
    /// Predecessor this hook was seeded from.
    pub inherited_from: Option<String>,
}

/// Render the brief handed to a successor. It restates recorded state only.
pub fn build_resumption_brief(hook: &Hook) -> String {
    let completed = hook.phase.completed();
    let completed = if completed.is_empty() {
        "(none)".to_string()
    } else {
        completed.iter().map(Phase::as_str).collect::<Vec<_>>().join(", ")
    };
    let mut brief = String::new();
    brief.push_str("## Resumption brief\n");
    brief.push_str(&format!("predecessor: {}\n", hook.identity_id));
    brief.push_str(&format!("last_phase: {}\n", hook.phase));
    brief.push_str(&format!("completed_phases: {completed}\n"));
    brief.push_str(&format!("last_checkpoint_at: {}\n", hook.last_checkpoint_at));
    brief.push_str("work_summary:\n");
    brief.push_str(&hook.work_summary);
    brief.push('\n');
    brief.push_str("resumption_instructions:\n");
    brief.push_str(hook.resumption_instructions.as_deref().unwrap_or("(none)"));
    brief.push('\n');
    brief
}

#[derive(Debug, Clone)]
pub struct HookManager {
    dir: PathBuf,
    lock_policy: LockPolicy,
}

impl HookManager {
    pub fn new(dir: impl Into<PathBuf>, lock_policy: LockPolicy) -> Self {
        Self {
            dir: dir.into(),
            lock_policy,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.layout().hooks_dir(), config.lock_policy())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, identity_id: &str) -> Result<PathBuf> {
        fsio::check_file_key(identity_id)?;
        Ok(self.dir.join(format!("{identity_id}.json")))
    }

    pub fn create(&self, identity_id: &str, initial_phase: Phase) -> Result<Hook> {
        let path = self.path_of(identity_id)?;
        let _lock = FileLock::acquire_for(&path, &self.lock_policy)?;
        if path.exists() {
            return Err(RelayError::HookExists(identity_id.to_string()));
        }
        let hook = Hook {
            identity_id: identity_id.to_string(),
            phase: initial_phase,
            work_summary: String::new(),
            last_checkpoint_at: crate::now_rfc3339(),
            resumption_instructions: None,
            consumed_by: None,
            inherited_from: None,
        };
        fsio::atomic_write_json(&path, &hook)?;
        tracing::info!(identity = %identity_id, phase = %initial_phase, "Hook created");
        Ok(hook)
    }

    /// Record a phase transition. Instructions are kept unless replaced.
    pub fn update_phase(
        &self,
        identity_id: &str,
        phase: Phase,
        summary: &str,
        instructions: Option<&str>,
    ) -> Result<Hook> {
        let path = self.path_of(identity_id)?;
        let _lock = FileLock::acquire_for(&path, &self.lock_policy)?;
        let mut hook: Hook = fsio::read_json(&path)?
            .ok_or_else(|| RelayError::HookNotFound(identity_id.to_string()))?;
        if phase < hook.phase {
            tracing::warn!(identity = %identity_id, from = %hook.phase, to = %phase, "Hook phase moved backwards");
        }
        hook.phase = phase;
        hook.work_summary = summary.to_string();
        hook.last_checkpoint_at = crate::now_rfc3339();
        if let Some(text) = instructions {
            hook.resumption_instructions = Some(text.to_string());
        }
        fsio::atomic_write_json(&path, &hook)?;
        tracing::debug!(identity = %identity_id, %phase, "Hook updated");
        Ok(hook)
    }

    pub fn read(&self, identity_id: &str) -> Result<Option<Hook>> {
        fsio::read_json(&self.path_of(identity_id)?)
    }

    /// Consume the predecessor's hook on behalf of `successor_id`.
    ///
    /// Seeds the successor hook with the same phase, summary and
    /// instructions, marks the predecessor hook consumed, and returns the
    /// brief. A hook can be consumed once. A successor hook already seeded
    /// from this predecessor means an earlier call stopped between the two
    /// writes; the call finishes it.
    pub fn resume_from(&self, predecessor_id: &str, successor_id: &str) -> Result<String> {
        let pred_path = self.path_of(predecessor_id)?;
        let succ_path = self.path_of(successor_id)?;
        let _pred_lock = FileLock::acquire_for(&pred_path, &self.lock_policy)?;
        let _succ_lock = FileLock::acquire_for(&succ_path, &self.lock_policy)?;

        let mut pred: Hook = fsio::read_json(&pred_path)?
            .ok_or_else(|| RelayError::HookNotFound(predecessor_id.to_string()))?;
        if let Some(consumed_by) = pred.consumed_by.clone() {
            return Err(RelayError::HookConsumed {
                identity: predecessor_id.to_string(),
                consumed_by,
            });
        }
        let brief = build_resumption_brief(&pred);
        if let Some(existing) = fsio::read_json::<Hook>(&succ_path)? {
            if existing.inherited_from.as_deref() != Some(predecessor_id) {
                return Err(RelayError::HookExists(successor_id.to_string()));
            }
            tracing::warn!(
                predecessor = %predecessor_id,
                successor = %successor_id,
                "Completing interrupted resumption"
            );
            pred.consumed_by = Some(successor_id.to_string());
            fsio::atomic_write_json(&pred_path, &pred)?;
            return Ok(brief);
        }

        let seeded = Hook {
            identity_id: successor_id.to_string(),
            phase: pred.phase,
            work_summary: pred.work_summary.clone(),
            last_checkpoint_at: crate::now_rfc3339(),
            resumption_instructions: pred.resumption_instructions.clone(),
            consumed_by: None,
            inherited_from: Some(predecessor_id.to_string()),
        };
        fsio::atomic_write_json(&succ_path, &seeded)?;

        pred.consumed_by = Some(successor_id.to_string());
        fsio::atomic_write_json(&pred_path, &pred)?;
        tracing::info!(
            predecessor = %predecessor_id,
            successor = %successor_id,
            phase = %pred.phase,
            "Hook consumed for resumption"
        );
        Ok(brief)
    }
}

//! Engine configuration and the on-disk layout of the state directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_types::Result;
use serde::{Deserialize, Serialize};

use crate::retry::{BackoffPolicy, LockPolicy};

/// Name of the optional configuration file inside the state directory.
pub const CONFIG_FILE: &str = "config.json";

/// Tunables shared by every component.
///
/// Loaded from `<state_dir>/config.json` when that file exists; missing keys
/// fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub state_dir: PathBuf,
    /// `failed -> active` transitions allowed before a node is forced `stuck`.
    pub max_retries: u32,
    pub lock_attempts: usize,
    pub lock_backoff_base_ms: u64,
    pub lock_backoff_max_ms: u64,
    pub signal_poll_interval_ms: u64,
    pub stale_timeout_secs: u64,
    pub integration_branch: String,
    pub repo_root: PathBuf,
    /// Shell command run by the merge queue after a clean rebase.
    pub test_command: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".relay"),
            max_retries: 3,
            lock_attempts: 20,
            lock_backoff_base_ms: 25,
            lock_backoff_max_ms: 1000,
            signal_poll_interval_ms: 250,
            stale_timeout_secs: 300,
            integration_branch: "main".to_string(),
            repo_root: PathBuf::from("."),
            test_command: None,
        }
    }
}

impl RelayConfig {
    /// Load `<state_dir>/config.json`, or defaults when it is absent.
    ///
    /// The returned config always points at `state_dir`, whatever the file
    /// says.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "Loaded config");
                serde_json::from_str::<RelayConfig>(&text)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RelayConfig::default(),
            Err(e) => return Err(e.into()),
        };
        config.state_dir = state_dir.to_path_buf();
        Ok(config)
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout::new(&self.state_dir)
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            attempts: self.lock_attempts.max(1),
            backoff: BackoffPolicy::Exponential {
                base: Duration::from_millis(self.lock_backoff_base_ms),
                max: Duration::from_millis(self.lock_backoff_max_ms),
            },
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.signal_poll_interval_ms.max(1))
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }
}

/// Every path the engine writes, derived from the state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn signals_dir(&self) -> PathBuf {
        self.root.join("signals")
    }

    pub fn identities_dir(&self) -> PathBuf {
        self.root.join("identities")
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.root.join("hooks")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join("audit.jsonl")
    }

    pub fn merge_queue(&self) -> PathBuf {
        self.root.join("merge-queue.json")
    }

    pub fn merge_archive(&self) -> PathBuf {
        self.root.join("merge-archive.jsonl")
    }

    /// Create every directory of the layout.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.signals_dir(),
            self.identities_dir(),
            self.hooks_dir(),
            self.checkpoints_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RelayConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.integration_branch, "main");
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.stale_timeout(), Duration::from_secs(300));
        assert!(config.test_command.is_none());
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load(dir.path()).unwrap();
        assert_eq!(config.state_dir, dir.path());
        assert_eq!(config.lock_attempts, 20);
    }

    #[test]
    fn load_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"max_retries": 5, "integration_branch": "trunk", "state_dir": "/elsewhere"}"#,
        )
        .unwrap();
        let config = RelayConfig::load(dir.path()).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.integration_branch, "trunk");
        assert_eq!(config.signal_poll_interval_ms, 250);
        assert_eq!(config.state_dir, dir.path());
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ nope").unwrap();
        assert!(RelayConfig::load(dir.path()).is_err());
    }

    #[test]
    fn lock_policy_follows_config() {
        let config = RelayConfig {
            lock_attempts: 0,
            lock_backoff_base_ms: 10,
            lock_backoff_max_ms: 40,
            ..Default::default()
        };
        let policy = config.lock_policy();
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.backoff.delay_for_attempt(5), Duration::from_millis(40));
    }

    #[test]
    fn layout_paths_and_ensure() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(dir.path().join("state"));
        layout.ensure().unwrap();
        assert!(layout.signals_dir().is_dir());
        assert!(layout.identities_dir().is_dir());
        assert!(layout.hooks_dir().is_dir());
        assert!(layout.checkpoints_dir().is_dir());
        assert_eq!(layout.audit_log(), dir.path().join("state/audit.jsonl"));
        assert_eq!(layout.merge_queue().file_name().unwrap(), "merge-queue.json");
    }
}

//! Identity registry: liveness and lineage of worker processes.
//!
//! One JSON file per identity under the identities directory. Identities are
//! never deleted; a crashed worker's successor registers with
//! `predecessor_id` pointing at it. All mutations take the registry lock so a
//! heartbeat cannot overwrite a monitor's `crashed` verdict.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_types::{RelayError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::fsio;
use crate::lock::FileLock;
use crate::retry::LockPolicy;

const LOCK_FILE: &str = ".registry.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Active,
    Crashed,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub role: String,
    pub name: String,
    pub session_ref: Option<String>,
    pub pid: Option<u32>,
    pub worktree_path: Option<String>,
    pub hook_ref: Option<String>,
    pub node_id: Option<String>,
    pub created_at: String,
    pub last_seen: String,
    pub status: IdentityStatus,
    pub predecessor_id: Option<String>,
}

impl Identity {
    fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.last_seen)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Optional fields supplied at registration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityMeta {
    pub session_ref: Option<String>,
    pub pid: Option<u32>,
    pub worktree_path: Option<String>,
    /// Defaults to the identity's own id.
    pub hook_ref: Option<String>,
    pub node_id: Option<String>,
    pub predecessor_id: Option<String>,
}

fn slug(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Whether a process with this pid exists (POSIX `kill(pid, 0)`).
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    dir: PathBuf,
    lock_policy: LockPolicy,
}

impl IdentityRegistry {
    pub fn new(dir: impl Into<PathBuf>, lock_policy: LockPolicy) -> Self {
        Self {
            dir: dir.into(),
            lock_policy,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.layout().identities_dir(), config.lock_policy())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, id: &str) -> Result<PathBuf> {
        fsio::check_file_key(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(&self.dir.join(LOCK_FILE), &self.lock_policy)
    }

    fn write(&self, identity: &Identity) -> Result<()> {
        fsio::atomic_write_json(&self.path_of(&identity.id)?, identity)
    }

    /// Register a new active identity.
    ///
    /// Refuses a second active identity with the same role and name, and a
    /// `predecessor_id` that is not registered.
    pub fn register(&self, role: &str, name: &str, meta: IdentityMeta) -> Result<Identity> {
        let _lock = self.lock()?;
        if let Some(existing) = self.find_active(role, name)? {
            return Err(RelayError::IdentityActive {
                role: role.to_string(),
                name: name.to_string(),
                id: existing.id,
            });
        }
        if let Some(pred) = meta.predecessor_id.as_deref() {
            self.get(pred)?;
        }
        if let Some(hook_ref) = meta.hook_ref.as_deref() {
            fsio::check_file_key(hook_ref)?;
        }

        let uuid = Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}-{}", slug(role), slug(name), &uuid[..8]);
        let now = crate::now_rfc3339();
        let identity = Identity {
            hook_ref: Some(meta.hook_ref.unwrap_or_else(|| id.clone())),
            id,
            role: role.to_string(),
            name: name.to_string(),
            session_ref: meta.session_ref,
            pid: meta.pid,
            worktree_path: meta.worktree_path,
            node_id: meta.node_id,
            created_at: now.clone(),
            last_seen: now,
            status: IdentityStatus::Active,
            predecessor_id: meta.predecessor_id,
        };
        self.write(&identity)?;
        tracing::info!(
            id = %identity.id,
            %role,
            %name,
            predecessor = ?identity.predecessor_id,
            "Identity registered"
        );
        Ok(identity)
    }

    /// Refresh `last_seen` of the active identity with this role and name.
    pub fn heartbeat(&self, role: &str, name: &str) -> Result<Identity> {
        let _lock = self.lock()?;
        let mut identity = self
            .find_active(role, name)?
            .ok_or_else(|| RelayError::IdentityNotFound(format!("{role}/{name}")))?;
        identity.last_seen = crate::now_rfc3339();
        self.write(&identity)?;
        tracing::debug!(id = %identity.id, "Heartbeat");
        Ok(identity)
    }

    /// Refresh `last_seen` by id. Only active identities beat.
    pub fn heartbeat_id(&self, id: &str) -> Result<Identity> {
        let _lock = self.lock()?;
        let mut identity = self.get(id)?;
        if identity.status != IdentityStatus::Active {
            return Err(RelayError::IdentityNotFound(format!("{id} (not active)")));
        }
        identity.last_seen = crate::now_rfc3339();
        self.write(&identity)?;
        Ok(identity)
    }

    /// Active identities whose `last_seen` is older than `timeout`.
    pub fn find_stale(&self, timeout: Duration) -> Result<Vec<Identity>> {
        self.find_stale_as_of(Utc::now(), timeout)
    }

    pub fn find_stale_as_of(&self, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<Identity>> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| RelayError::Other(format!("stale timeout out of range: {e}")))?;
        let cutoff = now - timeout;
        let stale: Vec<Identity> = self
            .list()?
            .into_iter()
            .filter(|i| i.status == IdentityStatus::Active)
            .filter(|i| i.last_seen_at().map_or(true, |seen| seen < cutoff))
            .collect();
        for identity in &stale {
            tracing::warn!(id = %identity.id, last_seen = %identity.last_seen, "Identity is stale");
        }
        Ok(stale)
    }

    /// Active identities whose recorded pid no longer exists.
    pub fn find_dead(&self) -> Result<Vec<Identity>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|i| i.status == IdentityStatus::Active)
            .filter(|i| i.pid.is_some_and(|pid| !is_process_alive(pid)))
            .collect())
    }

    pub fn mark_crashed(&self, id: &str) -> Result<Identity> {
        self.finish(id, IdentityStatus::Crashed)
    }

    pub fn mark_terminated(&self, id: &str) -> Result<Identity> {
        self.finish(id, IdentityStatus::Terminated)
    }

    /// Leave `active` for a final status. A finished identity is returned as is.
    fn finish(&self, id: &str, status: IdentityStatus) -> Result<Identity> {
        let _lock = self.lock()?;
        let mut identity = self.get(id)?;
        if identity.status != IdentityStatus::Active {
            tracing::debug!(%id, current = ?identity.status, requested = ?status, "Identity already finished");
            return Ok(identity);
        }
        identity.status = status;
        self.write(&identity)?;
        tracing::info!(%id, ?status, "Identity finished");
        Ok(identity)
    }

    pub fn get(&self, id: &str) -> Result<Identity> {
        fsio::read_json(&self.path_of(id)?)?.ok_or_else(|| RelayError::IdentityNotFound(id.to_string()))
    }

    pub fn find_active(&self, role: &str, name: &str) -> Result<Option<Identity>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|i| i.status == IdentityStatus::Active && i.role == role && i.name == name))
    }

    pub fn find_by_name(&self, name: &str) -> Result<Vec<Identity>> {
        Ok(self.list()?.into_iter().filter(|i| i.name == name).collect())
    }

    /// Every identity, oldest first.
    pub fn list(&self) -> Result<Vec<Identity>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(identity) = fsio::read_json::<Identity>(&path)? {
                out.push(identity);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    /// The identity and its predecessors, newest first.
    pub fn lineage(&self, id: &str) -> Result<Vec<Identity>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(id.to_string());
        while let Some(current) = next {
            if !seen.insert(current.clone()) {
                tracing::warn!(id = %current, "Predecessor cycle in identity lineage");
                break;
            }
            let identity = self.get(&current)?;
            next = identity.predecessor_id.clone();
            chain.push(identity);
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &Path) -> IdentityRegistry {
        IdentityRegistry::new(dir.join("identities"), LockPolicy::default())
    }

    #[test]
    fn register_creates_active_identity() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let id = reg
            .register(
                "implementer",
                "api",
                IdentityMeta {
                    pid: Some(std::process::id()),
                    node_id: Some("api".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(id.id.starts_with("implementer-api-"));
        assert_eq!(id.status, IdentityStatus::Active);
        assert_eq!(id.hook_ref.as_deref(), Some(id.id.as_str()));
        assert_eq!(reg.get(&id.id).unwrap(), id);
    }

    #[test]
    fn path_like_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert!(matches!(reg.get("../../etc/passwd"), Err(RelayError::InvalidId(_))));
        assert!(matches!(reg.mark_crashed("a/b"), Err(RelayError::InvalidId(_))));
        let meta = IdentityMeta {
            hook_ref: Some("../hooks-elsewhere".into()),
            ..Default::default()
        };
        assert!(matches!(
            reg.register("implementer", "api", meta),
            Err(RelayError::InvalidId(_))
        ));
        assert!(reg.list().unwrap().is_empty());
    }

    #[test]
    fn second_active_registration_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let first = reg.register("implementer", "api", IdentityMeta::default()).unwrap();
        let err = reg
            .register("implementer", "api", IdentityMeta::default())
            .unwrap_err();
        assert!(matches!(err, RelayError::IdentityActive { id, .. } if id == first.id));

        reg.mark_crashed(&first.id).unwrap();
        assert!(reg.register("implementer", "api", IdentityMeta::default()).is_ok());
    }

    #[test]
    fn unknown_predecessor_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let err = reg
            .register(
                "implementer",
                "api",
                IdentityMeta {
                    predecessor_id: Some("ghost".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, RelayError::IdentityNotFound(_)));
    }

    #[test]
    fn stale_detection_uses_last_seen() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let a = reg.register("implementer", "a", IdentityMeta::default()).unwrap();
        let b = reg.register("implementer", "b", IdentityMeta::default()).unwrap();

        let later = Utc::now() + chrono::Duration::seconds(600);
        assert!(reg.find_stale(Duration::from_secs(300)).unwrap().is_empty());
        assert_eq!(reg.find_stale_as_of(later, Duration::from_secs(300)).unwrap().len(), 2);

        reg.mark_terminated(&b.id).unwrap();
        let stale = reg.find_stale_as_of(later, Duration::from_secs(300)).unwrap();
        assert_eq!(stale.iter().map(|i| &i.id).collect::<Vec<_>>(), vec![&a.id]);
    }

    #[test]
    fn heartbeat_refreshes_and_crash_is_final() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let a = reg.register("supervisor", "api", IdentityMeta::default()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let beat = reg.heartbeat("supervisor", "api").unwrap();
        assert!(beat.last_seen > a.last_seen);

        reg.mark_crashed(&a.id).unwrap();
        assert!(matches!(
            reg.heartbeat("supervisor", "api"),
            Err(RelayError::IdentityNotFound(_))
        ));
        let after = reg.mark_terminated(&a.id).unwrap();
        assert_eq!(after.status, IdentityStatus::Crashed);
    }

    #[test]
    fn lineage_walks_predecessors() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let first = reg.register("implementer", "api", IdentityMeta::default()).unwrap();
        reg.mark_crashed(&first.id).unwrap();
        let second = reg
            .register(
                "implementer",
                "api",
                IdentityMeta {
                    predecessor_id: Some(first.id.clone()),
                    ..Default::default()
                },
            )
            .unwrap();

        let chain: Vec<_> = reg.lineage(&second.id).unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(chain, vec![second.id.clone(), first.id.clone()]);
        assert_eq!(reg.find_by_name("api").unwrap().len(), 2);
        assert_eq!(reg.list().unwrap().len(), 2);
    }

    #[test]
    fn dead_pid_is_detected() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));

        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let gone = reg
            .register("implementer", "x", IdentityMeta { pid: Some(pid), ..Default::default() })
            .unwrap();
        reg.register(
            "implementer",
            "y",
            IdentityMeta { pid: Some(std::process::id()), ..Default::default() },
        )
        .unwrap();

        let dead: Vec<_> = reg.find_dead().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(dead, vec![gone.id]);
    }
}

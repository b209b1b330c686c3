//! File-based signal protocol between process layers.
//!
//! A signal is one JSON file in a signal directory, named
//! `{timestamp}-{from}-{to}-{type}.json` so that lexical order is emission
//! order. A consumer claims a signal by renaming it into `processed/`; the
//! rename is the commit point, so each signal is consumed exactly once even
//! with several processes polling the same directory.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::Regex;
use relay_types::{RelayError, Result};
use serde::{Deserialize, Serialize};

pub const PROCESSED_DIR: &str = "processed";
pub const REJECTED_DIR: &str = "rejected";

const EMIT_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalType {
    Dispatch,
    ImplComplete,
    ValidationPassed,
    ValidationFailed,
    MergeReady,
    Merged,
    Stall,
    Escalate,
    Shutdown,
    Other(String),
}

impl SignalType {
    pub fn as_str(&self) -> &str {
        match self {
            SignalType::Dispatch => "DISPATCH",
            SignalType::ImplComplete => "IMPL_COMPLETE",
            SignalType::ValidationPassed => "VALIDATION_PASSED",
            SignalType::ValidationFailed => "VALIDATION_FAILED",
            SignalType::MergeReady => "MERGE_READY",
            SignalType::Merged => "MERGED",
            SignalType::Stall => "STALL",
            SignalType::Escalate => "ESCALATE",
            SignalType::Shutdown => "SHUTDOWN",
            SignalType::Other(s) => s,
        }
    }
}

impl From<String> for SignalType {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "DISPATCH" => SignalType::Dispatch,
            "IMPL_COMPLETE" => SignalType::ImplComplete,
            "VALIDATION_PASSED" => SignalType::ValidationPassed,
            "VALIDATION_FAILED" => SignalType::ValidationFailed,
            "MERGE_READY" => SignalType::MergeReady,
            "MERGED" => SignalType::Merged,
            "STALL" => SignalType::Stall,
            "ESCALATE" => SignalType::Escalate,
            "SHUTDOWN" => SignalType::Shutdown,
            _ => SignalType::Other(s),
        }
    }
}

impl From<&str> for SignalType {
    fn from(s: &str) -> Self {
        SignalType::from(s.to_string())
    }
}

impl From<SignalType> for String {
    fn from(t: SignalType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, timestamped message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: String,
}

/// Matches signals on any combination of sender, recipient and type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub signal_type: Option<SignalType>,
}

impl SignalFilter {
    pub fn matches(&self, signal: &Signal) -> bool {
        self.from.as_ref().map_or(true, |f| *f == signal.from)
            && self.to.as_ref().map_or(true, |t| *t == signal.to)
            && self
                .signal_type
                .as_ref()
                .map_or(true, |t| *t == signal.signal_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceivedSignal {
    pub signal: Signal,
    pub file_name: String,
    pub archived_to: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AwaitOutcome {
    Received(ReceivedSignal),
    Timeout { waited: Duration },
}

const SIGNAL_FILE_PATTERN: &str = r"^\d{8}T\d{12}Z-[A-Za-z0-9_.-]+\.json$";

fn signal_file_re() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SIGNAL_FILE_PATTERN))
        .as_ref()
        .map_err(|e| RelayError::Other(format!("signal file pattern: {e}")))
}

/// Whether `name` looks like a signal file written by [`emit`].
pub fn is_signal_file(name: &str) -> Result<bool> {
    Ok(signal_file_re()?.is_match(name))
}

fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Write a signal into `dir` atomically. Returns the new file's path.
pub fn emit(
    dir: &Path,
    from: &str,
    to: &str,
    signal_type: SignalType,
    payload: serde_json::Value,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let (from_c, to_c, type_c) = (sanitize(from), sanitize(to), sanitize(signal_type.as_str()));

    for _ in 0..EMIT_ATTEMPTS {
        let now = Utc::now();
        let name = format!(
            "{}-{from_c}-{to_c}-{type_c}.json",
            now.format("%Y%m%dT%H%M%S%6fZ")
        );
        let signal = Signal {
            from: from.to_string(),
            to: to.to_string(),
            signal_type: signal_type.clone(),
            payload: payload.clone(),
            timestamp: now.to_rfc3339(),
        };

        let mut tmp = tempfile::Builder::new().prefix(".tmp-").tempfile_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(&signal)?)?;
        tmp.as_file().sync_all()?;
        let target = dir.join(&name);
        match tmp.persist_noclobber(&target) {
            Ok(_) => {
                tracing::info!(%from, %to, signal_type = %signal.signal_type, file = %name, "Signal emitted");
                return Ok(target);
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                std::thread::yield_now();
            }
            Err(e) => return Err(e.error.into()),
        }
    }
    Err(RelayError::Other(format!(
        "could not find a free signal file name in {}",
        dir.display()
    )))
}

async fn signal_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if is_signal_file(name)? {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

async fn read_signals(dir: &Path) -> Result<Vec<(String, Signal)>> {
    let mut out = Vec::new();
    for name in signal_files(dir).await? {
        let bytes = match tokio::fs::read(dir.join(&name)).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Signal>(&bytes) {
            Ok(signal) => out.push((name, signal)),
            Err(e) => tracing::warn!(file = %name, error = %e, "Skipping malformed signal"),
        }
    }
    Ok(out)
}

/// Unconsumed signals in lexical order. Malformed files are skipped.
pub async fn pending(dir: &Path) -> Result<Vec<(String, Signal)>> {
    read_signals(dir).await
}

/// Consumed signals in lexical order.
pub async fn processed(dir: &Path) -> Result<Vec<(String, Signal)>> {
    read_signals(&dir.join(PROCESSED_DIR)).await
}

/// Claim one signal file by moving it into `processed/`.
///
/// `Ok(None)` means another consumer claimed it first.
async fn try_consume(dir: &Path, name: &str) -> Result<Option<PathBuf>> {
    let archive = dir.join(PROCESSED_DIR);
    tokio::fs::create_dir_all(&archive).await?;
    let target = archive.join(name);
    match tokio::fs::rename(dir.join(name), &target).await {
        Ok(()) => Ok(Some(target)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn quarantine(dir: &Path, name: &str) {
    let rejected = dir.join(REJECTED_DIR);
    if let Err(e) = tokio::fs::create_dir_all(&rejected).await {
        tracing::warn!(error = %e, "Cannot create rejected signal directory");
        return;
    }
    match tokio::fs::rename(dir.join(name), rejected.join(name)).await {
        Ok(()) => tracing::warn!(file = %name, "Malformed signal moved to rejected/"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(file = %name, error = %e, "Cannot quarantine malformed signal"),
    }
}

/// Wait for the first signal in lexical order that satisfies `predicate`,
/// consuming it. Polls every `poll` until `timeout` elapses.
pub async fn await_signal<F>(
    dir: &Path,
    predicate: F,
    timeout: Duration,
    poll: Duration,
) -> Result<AwaitOutcome>
where
    F: Fn(&Signal) -> bool,
{
    let started = Instant::now();
    loop {
        for name in signal_files(dir).await? {
            let bytes = match tokio::fs::read(dir.join(&name)).await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let signal: Signal = match serde_json::from_slice(&bytes) {
                Ok(s) => s,
                Err(_) => {
                    quarantine(dir, &name).await;
                    continue;
                }
            };
            if !predicate(&signal) {
                continue;
            }
            if let Some(archived_to) = try_consume(dir, &name).await? {
                tracing::info!(
                    file = %name,
                    from = %signal.from,
                    to = %signal.to,
                    signal_type = %signal.signal_type,
                    "Signal consumed"
                );
                return Ok(AwaitOutcome::Received(ReceivedSignal {
                    signal,
                    file_name: name,
                    archived_to,
                }));
            }
            tracing::debug!(file = %name, "Signal claimed by another consumer");
        }

        let waited = started.elapsed();
        if waited >= timeout {
            tracing::debug!(dir = %dir.display(), waited_ms = %waited.as_millis(), "Signal await timed out");
            return Ok(AwaitOutcome::Timeout { waited });
        }
        tokio::time::sleep(poll.min(timeout - waited)).await;
    }
}

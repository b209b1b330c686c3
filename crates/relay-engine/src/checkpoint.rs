//! Numbered graph snapshots for recovery and inspection.
//!
//! [`save_checkpoint`] bumps the graph's `checkpoint_seq` and copies the result
//! to `<dir>/<stem>-<seq>.dot`. [`latest_checkpoint`] finds the newest
//! snapshot so an operator can restore it.

use std::path::{Path, PathBuf};

use relay_types::Result;

use crate::fsio;
use crate::graph::PipelineGraph;
use crate::lock::FileLock;
use crate::retry::LockPolicy;

fn stem_of(graph_path: &Path) -> String {
    graph_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pipeline".to_string())
}

fn checkpoint_name(stem: &str, seq: u64) -> String {
    format!("{stem}-{seq:06}.dot")
}

/// Snapshot the graph under its lock. Returns the snapshot path.
pub fn save_checkpoint(graph_path: &Path, dir: &Path, policy: &LockPolicy) -> Result<PathBuf> {
    let _lock = FileLock::acquire_for(graph_path, policy)?;
    let mut graph = PipelineGraph::load(graph_path)?;
    graph.save(graph_path)?;

    let target = dir.join(checkpoint_name(&stem_of(graph_path), graph.checkpoint_seq));
    fsio::atomic_write(&target, graph.render().as_bytes())?;
    tracing::info!(
        graph = %graph_path.display(),
        seq = graph.checkpoint_seq,
        path = %target.display(),
        "Checkpoint saved"
    );
    Ok(target)
}

/// Snapshots of `graph_path` in `dir`, oldest first, with their sequence.
pub fn list_checkpoints(graph_path: &Path, dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let prefix = format!("{}-", stem_of(graph_path));
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let seq = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".dot"))
            .and_then(|digits| digits.parse::<u64>().ok());
        if let Some(seq) = seq {
            found.push((seq, entry.path()));
        }
    }
    found.sort();
    Ok(found)
}

pub fn latest_checkpoint(graph_path: &Path, dir: &Path) -> Result<Option<PathBuf>> {
    Ok(list_checkpoints(graph_path, dir)?.pop().map(|(_, p)| p))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAPH: &str = r#"digraph C {
        start [kind="start"]
        done [kind="exit-success"]
        start -> done
    }"#;

    #[test]
    fn snapshots_are_numbered_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let graph_path = dir.path().join("build.dot");
        let cp_dir = dir.path().join("checkpoints");
        std::fs::write(&graph_path, GRAPH).unwrap();

        let first = save_checkpoint(&graph_path, &cp_dir, &LockPolicy::no_wait()).unwrap();
        let second = save_checkpoint(&graph_path, &cp_dir, &LockPolicy::no_wait()).unwrap();
        assert_eq!(first.file_name().unwrap(), "build-000001.dot");
        assert_eq!(second.file_name().unwrap(), "build-000002.dot");

        let snapshot = PipelineGraph::load(&second).unwrap();
        assert_eq!(snapshot.checkpoint_seq, 2);
        assert_eq!(std::fs::read(&second).unwrap(), std::fs::read(&graph_path).unwrap());

        let listed = list_checkpoints(&graph_path, &cp_dir).unwrap();
        assert_eq!(listed.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(latest_checkpoint(&graph_path, &cp_dir).unwrap(), Some(second));
    }

    #[test]
    fn listing_ignores_other_graphs_and_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let graph_path = dir.path().join("a.dot");
        assert!(list_checkpoints(&graph_path, &dir.path().join("none")).unwrap().is_empty());

        std::fs::write(dir.path().join("b-000003.dot"), GRAPH).unwrap();
        std::fs::write(dir.path().join("a-notanumber.dot"), GRAPH).unwrap();
        assert!(latest_checkpoint(&graph_path, dir.path()).unwrap().is_none());
    }
}

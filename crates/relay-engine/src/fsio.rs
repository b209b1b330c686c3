//! Crash-safe file primitives.
//!
//! A write lands in a temp file in the destination directory, is fsynced, and
//! is then renamed over the target. Readers see either the old or the new
//! content, never a torn file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use relay_types::{RelayError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Ids that name a file inside a state directory must stay inside it.
pub fn check_file_key(key: &str) -> Result<()> {
    let escapes = key.is_empty()
        || key.contains(['/', '\\', '\0'])
        || key.contains("..");
    if escapes {
        return Err(RelayError::InvalidId(key.to_string()));
    }
    Ok(())
}

/// Replace `path` with `contents` atomically.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new().prefix(".tmp-").tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir);
    tracing::debug!(path = %path.display(), bytes = contents.len(), "Atomic write");
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(value)?;
    json.push(b'\n');
    atomic_write(path, &json)
}

/// Read a JSON file, `None` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Append one JSON line to `path`, creating it if needed.
pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    std::fs::create_dir_all(parent_dir(path))?;
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    file.sync_data()?;
    Ok(())
}

/// Read every line of a JSON-lines file. A missing file is empty.
pub fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(Into::into))
        .collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of a file's contents, hex encoded.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Best-effort fsync of a directory so a rename survives power loss.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn file_keys_stay_inside_their_directory() {
        assert!(check_file_key("implementer-api-1a2b3c4d").is_ok());
        assert!(check_file_key("v1.2").is_ok());
        for bad in ["", "../x", "a/b", "..", "a\\b", "x..y"] {
            assert!(matches!(check_file_key(bad), Err(RelayError::InvalidId(_))), "{bad:?}");
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        n: u32,
        s: String,
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["f.txt".to_string()]);
    }

    #[test]
    fn json_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/row.json");
        assert!(read_json::<Row>(&path).unwrap().is_none());
        let row = Row { n: 7, s: "x".into() };
        atomic_write_json(&path, &row).unwrap();
        assert_eq!(read_json::<Row>(&path).unwrap(), Some(row));
    }

    #[test]
    fn json_lines_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        assert!(read_json_lines::<Row>(&path).unwrap().is_empty());
        append_json_line(&path, &Row { n: 1, s: "a".into() }).unwrap();
        append_json_line(&path, &Row { n: 2, s: "b".into() }).unwrap();
        let rows: Vec<Row> = read_json_lines(&path).unwrap();
        assert_eq!(rows.iter().map(|r| r.n).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(file_sha256(&path).unwrap(), sha256_hex(b"abc"));
    }
}

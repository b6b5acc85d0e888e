//! File-backed persistence primitives for the Patze control plane.
//!
//! Three building blocks shared by the stores:
//! - [`JsonStore`] — keyed JSON snapshot store (load whole map, save whole map)
//! - [`write_atomic`] — tmp-write + rename replace, the only way state files
//!   and the cron spool are ever rewritten
//! - [`JsonlReader`] / [`append_jsonl`] — forward-only JSONL spool access

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// ─── Atomic replace ───────────────────────────────────────────────────────────

/// Write `bytes` to `path` atomically: write to a sibling tmp file, then
/// rename over the destination. Readers never observe a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp = tmp_sibling(path);
    std::fs::write(&tmp, bytes)?;
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Like [`write_atomic`] but chmods the result to owner-only (0600).
/// Used for `auth.json` and `ssh-connections.json`.
#[cfg(unix)]
pub fn write_atomic_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    write_atomic(path, bytes)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub fn write_atomic_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    write_atomic(path, bytes)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

// ─── JSON snapshot store ──────────────────────────────────────────────────────

/// A keyed JSON snapshot store for one domain of data.
///
/// Keeps nothing in memory itself; callers load the whole map, mutate under
/// their own lock, and save the whole map. Saves go through [`write_atomic`].
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Store for the given domain under `state_path/state/{domain}.json`.
    pub fn new(state_path: &Path, domain: &str) -> Self {
        let path = state_path.join("state").join(format!("{domain}.json"));
        Self { path }
    }

    /// Store at an explicit file path.
    pub fn at_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load data from disk. Returns an empty map if the file is missing;
    /// a corrupt file is logged and treated as empty.
    pub fn load<T: for<'de> Deserialize<'de>>(&self) -> HashMap<String, T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                HashMap::new()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                HashMap::new()
            }
        }
    }

    /// Save the whole map atomically.
    pub fn save<T: Serialize>(&self, data: &HashMap<String, T>) -> std::io::Result<()> {
        let content = serde_json::to_vec_pretty(data).map_err(std::io::Error::other)?;
        write_atomic(&self.path, &content)
    }
}

// ─── JSONL spool ──────────────────────────────────────────────────────────────

/// Append one record as a JSON line. Creates the file and parents on first
/// use; the file only ever grows.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(record).map_err(std::io::Error::other)?;
    line.push(b'\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(&line)
}

/// Forward-only reader over a JSONL file. The caller keeps the returned
/// offset and passes it back on the next read; lines written in between are
/// the delta. A malformed line is skipped with a warning rather than
/// poisoning the whole spool.
pub struct JsonlReader;

impl JsonlReader {
    /// Read records appended after `offset` bytes. Returns the parsed
    /// records and the new offset. A missing file yields no records and an
    /// unchanged offset.
    pub fn read_from<T: for<'de> Deserialize<'de>>(
        path: &Path,
        offset: u64,
    ) -> std::io::Result<(Vec<T>, u64)> {
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), offset)),
            Err(e) => return Err(e),
        };

        let len = file.metadata()?.len();
        // Truncated/rotated spool: restart from the top.
        let start = if offset > len { 0 } else { offset };

        let mut reader = std::io::BufReader::new(file);
        reader.seek(SeekFrom::Start(start))?;

        let mut records = Vec::new();
        let mut consumed = start;
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            // Only count complete lines; a partial trailing line is left for
            // the next read once the writer finishes it.
            if !line.ends_with('\n') {
                break;
            }
            consumed += n as u64;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(trimmed) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed spool line");
                }
            }
        }

        Ok((records, consumed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rec {
        id: String,
        n: u32,
    }

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("file.json");

        write_atomic(&path, b"{\"a\":1}").expect("first write");
        write_atomic(&path, b"{\"a\":2}").expect("second write");

        let content = std::fs::read_to_string(&path).expect("read");
        assert_eq!(content, "{\"a\":2}");
        // No tmp residue left behind.
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .expect("read_dir")
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_private_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("auth.json");
        write_atomic_private(&path, b"{}").expect("write");
        let mode = std::fs::metadata(&path).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_json_store_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path(), "things");

        let mut data = HashMap::new();
        data.insert(
            "a".to_string(),
            Rec {
                id: "a".to_string(),
                n: 1,
            },
        );
        store.save(&data).expect("save");

        let loaded: HashMap<String, Rec> = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("a").unwrap().n, 1);
    }

    #[test]
    fn test_json_store_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_dir = dir.path().join("state");
        std::fs::create_dir_all(&state_dir).expect("mkdir");
        std::fs::write(state_dir.join("bad.json"), "not json").expect("write");

        let store = JsonStore::new(dir.path(), "bad");
        let loaded: HashMap<String, Rec> = store.load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_jsonl_forward_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runs.jsonl");

        append_jsonl(
            &path,
            &Rec {
                id: "r1".to_string(),
                n: 1,
            },
        )
        .expect("append");
        let (first, offset): (Vec<Rec>, u64) = JsonlReader::read_from(&path, 0).expect("read");
        assert_eq!(first.len(), 1);

        append_jsonl(
            &path,
            &Rec {
                id: "r2".to_string(),
                n: 2,
            },
        )
        .expect("append");
        let (delta, offset2): (Vec<Rec>, u64) = JsonlReader::read_from(&path, offset).expect("read");
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].id, "r2");
        assert!(offset2 > offset);

        // Nothing new: empty delta, same offset.
        let (none, offset3): (Vec<Rec>, u64) = JsonlReader::read_from(&path, offset2).expect("read");
        assert!(none.is_empty());
        assert_eq!(offset3, offset2);
    }

    #[test]
    fn test_jsonl_skips_malformed_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runs.jsonl");
        std::fs::write(&path, "{\"id\":\"a\",\"n\":1}\ngarbage\n{\"id\":\"b\",\"n\":2}\n")
            .expect("write");

        let (records, _): (Vec<Rec>, u64) = JsonlReader::read_from(&path, 0).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id, "b");
    }

    #[test]
    fn test_jsonl_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (records, offset): (Vec<Rec>, u64) =
            JsonlReader::read_from(&dir.path().join("absent.jsonl"), 42).expect("read");
        assert!(records.is_empty());
        assert_eq!(offset, 42);
    }

    #[test]
    fn test_jsonl_truncated_spool_restarts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runs.jsonl");
        std::fs::write(&path, "{\"id\":\"a\",\"n\":1}\n").expect("write");

        // Offset beyond the file (spool was rewritten shorter).
        let (records, _): (Vec<Rec>, u64) = JsonlReader::read_from(&path, 9999).expect("read");
        assert_eq!(records.len(), 1);
    }
}

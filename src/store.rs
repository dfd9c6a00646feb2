//! Shared-state store: two persistence primitives over the shared directory.
//!
//! - [`AtomicSnapshot`]: read-merge-write-rename over a single JSON file keyed by a primary
//! key. Used for `registry.json` and `projects.json`. Never observed half-written: every write
//! goes to `name.tmp` then `rename`s over `name`, which is atomic on the same filesystem.
//! - [`AppendLog`]: newline-delimited JSON, one record per line, append-only. Used for
//! `messages.jsonl`, `deliveries.jsonl`, and `inboxes/{agentId}.jsonl`. Readers track a byte
//! offset so catch-up never rereads already-seen lines. A malformed line is skipped with a
//! `log::warn!` rather than aborting the read.
//!
//! Grounded in a hash-chained thought-log's open/append/reload discipline (durability via
//! `OpenOptions::append` + immediate flush), generalized from a single hash-chained file to the
//! general-purpose snapshot/log pair this runtime needs.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Errors from the store primitives.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Serde(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "store io error: {}", e),
            StoreError::Serde(e) => write!(f, "store serialization error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

impl From<StoreError> for crate::errors::RuntimeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(e) => crate::errors::RuntimeError::IoError(e.to_string()),
            StoreError::Serde(e) => crate::errors::RuntimeError::ParseError(e.to_string()),
        }
    }
}

/// Atomic JSON snapshot keyed by a primary key extracted from each record.
///
/// `T` is the per-record value type (e.g. `AgentRegistration`); records live in the file as
/// `HashMap<String, T>`.
pub struct AtomicSnapshot {
    path: PathBuf,
}

impl AtomicSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        AtomicSnapshot { path: path.into() }
    }

    /// Read the full snapshot, or an empty map if the file does not exist yet.
    pub fn read<T: DeserializeOwned>(&self) -> Result<HashMap<String, T>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let data = fs::read_to_string(&self.path)?;
        if data.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&data)?)
    }

    /// Merge `record` into the snapshot under `key` and write it back atomically.
    ///
    /// `merge` receives the previous value for `key` (if any) and the map's full prior contents
    /// are preserved for every other key; `merge` returns the new value to store. The write path
    /// is write-to-`.tmp`-then-`rename`, so a crash mid-write never corrupts `path`.
    pub fn update<T, F>(&self, key: &str, merge: F) -> Result<T, StoreError>
    where
    T: Serialize + DeserializeOwned + Clone,
    F: FnOnce(Option<T>) -> T,
    {
        let mut map: HashMap<String, T> = self.read()?;
        let previous = map.get(key).cloned();
        let updated = merge(previous);
        map.insert(key.to_string(), updated.clone());
        self.write_all(&map)?;
        Ok(updated)
    }

    /// Overwrite the entire snapshot (used when the caller already holds the merged map, e.g.
    /// task-pool operations that read-modify-write a whole project's task list at once).
    pub fn write_all<T: Serialize>(&self, map: &HashMap<String, T>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        let json = serde_json::to_string_pretty(map)?;
        {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(json.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append-only newline-delimited JSON log with offset-tracked catch-up reads.
pub struct AppendLog {
    path: PathBuf,
}

impl AppendLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        AppendLog { path: path.into() }
    }

    /// Append one record as a single JSON line. Durable before this call returns: the file is
    /// opened in append mode and flushed/synced before `append` returns.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)?;
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{}", line)?;
        f.sync_all()?;
        Ok(())
    }

    /// Read every well-formed record in the log, skipping malformed lines with a warning.
    pub fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>, StoreError> {
        let (records, _) = self.read_from::<T>(0)?;
        Ok(records)
    }

    /// Read records starting at byte `offset`, returning the parsed records and the new offset
    /// (the file's length after this read). Malformed lines are skipped, never abort the read.
    pub fn read_from<T: DeserializeOwned>(
        &self,
        offset: u64,
    ) -> Result<(Vec<T>, u64), StoreError> {
        if !self.path.exists() {
            return Ok((Vec::new(), 0));
        }
        let mut file = fs::File::open(&self.path)?;
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok((Vec::new(), len));
        }
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(offset))?;
        let reader = BufReader::new(file);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => out.push(record),
                Err(e) => log::warn!("skipping malformed log line in {:?}: {}", self.path, e),
            }
        }
        Ok((out, len))
    }

    /// Read every record as raw [`Value`]s, used by catch-up paths that need to filter before
    /// deserializing into a concrete message type.
    pub fn read_all_values(&self) -> Result<Vec<Value>, StoreError> {
        self.read_all::<Value>()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    struct Rec {
        id: String,
        n: u32,
    }

    #[test]
    fn snapshot_merge_is_last_write_wins_per_key() {
        let dir = tempdir().unwrap();
        let snap = AtomicSnapshot::new(dir.path().join("snap.json"));
        snap.update("a", |_: Option<Rec>| Rec {
                id: "a".into(),
                n: 1,
        })
            .unwrap();
        snap.update("b", |_: Option<Rec>| Rec {
                id: "b".into(),
                n: 2,
        })
            .unwrap();
        snap.update("a", |prev: Option<Rec>| Rec {
                id: "a".into(),
                n: prev.unwrap().n + 10,
        })
            .unwrap();

        let map: HashMap<String, Rec> = snap.read().unwrap();
        assert_eq!(map.get("a").unwrap().n, 11);
        assert_eq!(map.get("b").unwrap().n, 2);
    }

    #[test]
    fn snapshot_read_of_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let snap = AtomicSnapshot::new(dir.path().join("missing.json"));
        let map: HashMap<String, Rec> = snap.read().unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn append_log_round_trips_in_order() {
        let dir = tempdir().unwrap();
        let log = AppendLog::new(dir.path().join("log.jsonl"));
        for i in 0..5 {
            log.append(&Rec {
                    id: format!("r{}", i),
                    n: i,
            })
                .unwrap();
        }
        let all: Vec<Rec> = log.read_all().unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].id, "r0");
        assert_eq!(all[4].n, 4);
    }

    #[test]
    fn append_log_offset_reads_only_new_records() {
        let dir = tempdir().unwrap();
        let log = AppendLog::new(dir.path().join("log.jsonl"));
        log.append(&Rec {
                id: "r0".into(),
                n: 0,
        })
            .unwrap();
        let (_first, offset) = log.read_from::<Rec>(0).unwrap();
        log.append(&Rec {
                id: "r1".into(),
                n: 1,
        })
            .unwrap();
        let (second, _) = log.read_from::<Rec>(offset).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, "r1");
    }

    #[test]
    fn append_log_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        fs::write(&path, "{\"id\":\"ok\",\"n\":1}\nnot json\n{\"id\":\"ok2\",\"n\":2}\n").unwrap();
        let log = AppendLog::new(&path);
        let all: Vec<Rec> = log.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].id, "ok2");
    }
}

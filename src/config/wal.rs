//! Write-ahead log making multi-step configuration writes atomic
//! (spec section 4.1).
//!
//! Each write: (1) append a WAL entry, (2) write `target.tmp`, (3) rename
//! `target.tmp` -> `target` (the atomic commit point), (4) mark the WAL
//! entry completed, (5) periodically truncate completed entries.
//! Recovery on startup deletes orphaned temp files and completes markers
//! for renames that actually succeeded.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub op: String,
    pub target: PathBuf,
    pub temp_path: PathBuf,
    pub created_at: i64,
    pub hash: u64,
    pub completed: bool,
}

/// FNV-1a 64-bit — cheap, dependency-free, enough to notice truncation
/// (spec section 9 ambient-stack note: not a crypto integrity guarantee).
pub fn fnv1a_hash(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

pub struct Wal {
    path: PathBuf,
}

impl Wal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_entries(&self) -> Result<Vec<WalEntry>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read WAL file {:?}", self.path))?;
        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("skipping malformed WAL line: {}", e),
            }
        }
        Ok(entries)
    }

    fn write_entries(&self, entries: &[WalEntry]) -> Result<()> {
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }
        std::fs::write(&self.path, buf).with_context(|| format!("failed to write WAL file {:?}", self.path))
    }

    /// Append a new, not-yet-completed entry and return its index.
    pub fn begin(&self, op: &str, target: &Path, temp_path: &Path, created_at: i64, hash: u64) -> Result<usize> {
        let mut entries = self.read_entries()?;
        entries.push(WalEntry {
            op: op.to_string(),
            target: target.to_path_buf(),
            temp_path: temp_path.to_path_buf(),
            created_at,
            hash,
            completed: false,
        });
        let index = entries.len() - 1;
        self.write_entries(&entries)?;
        Ok(index)
    }

    /// Mark the entry at `index` completed (step 4 of the atomic-write protocol).
    pub fn complete(&self, index: usize) -> Result<()> {
        let mut entries = self.read_entries()?;
        if let Some(entry) = entries.get_mut(index) {
            entry.completed = true;
        }
        self.write_entries(&entries)
    }

    /// Drop completed entries (step 5, periodic truncation).
    pub fn truncate_completed(&self) -> Result<()> {
        let entries = self.read_entries()?;
        let remaining: Vec<WalEntry> = entries.into_iter().filter(|e| !e.completed).collect();
        self.write_entries(&remaining)
    }

    /// Startup recovery (spec section 4.1 and section 8 scenario 6): for
    /// each incomplete entry, if `target.tmp` exists and no completed
    /// marker is present, delete the temp file (the rename never
    /// happened — `target` still holds the pre-write state). If the
    /// rename appears to have already happened (temp gone, target
    /// exists) but the marker is missing, complete the marker.
    pub fn recover(&self) -> Result<usize> {
        let entries = self.read_entries()?;
        let mut recovered = 0;
        let mut updated = entries.clone();

        for (idx, entry) in entries.iter().enumerate() {
            if entry.completed {
                continue;
            }
            let temp_exists = entry.temp_path.exists();
            let target_exists = entry.target.exists();

            if temp_exists {
                tracing::warn!(
                    "WAL recovery: deleting orphaned temp file {:?} (op={})",
                    entry.temp_path,
                    entry.op
                );
                let _ = std::fs::remove_file(&entry.temp_path);
                recovered += 1;
            } else if target_exists {
                tracing::info!(
                    "WAL recovery: rename for {:?} completed before crash, marking entry done",
                    entry.target
                );
                updated[idx].completed = true;
                recovered += 1;
            }
        }

        self.write_entries(&updated)?;
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn recovery_deletes_orphaned_temp_when_rename_never_happened() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("devices.json");
        let temp = dir.path().join("devices.json.tmp");
        std::fs::write(&target, "pre-write-state").unwrap();
        std::fs::write(&temp, "new-state").unwrap();

        let wal = Wal::new(dir.path().join("wal.log"));
        wal.begin("write", &target, &temp, 0, fnv1a_hash(b"new-state")).unwrap();

        let recovered = wal.recover().unwrap();
        assert_eq!(recovered, 1);
        assert!(!temp.exists());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "pre-write-state");
    }

    #[test]
    fn recovery_completes_marker_when_rename_already_succeeded() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("devices.json");
        let temp = dir.path().join("devices.json.tmp");
        std::fs::write(&target, "post-write-state").unwrap();

        let wal = Wal::new(dir.path().join("wal.log"));
        let idx = wal.begin("write", &target, &temp, 0, fnv1a_hash(b"post-write-state")).unwrap();

        wal.recover().unwrap();
        let entries = wal.read_entries().unwrap();
        assert!(entries[idx].completed);
    }

    #[test]
    fn truncate_drops_only_completed_entries() {
        let dir = tempdir().unwrap();
        let wal = Wal::new(dir.path().join("wal.log"));
        let target = dir.path().join("a.json");
        let temp = dir.path().join("a.json.tmp");

        let idx0 = wal.begin("write", &target, &temp, 0, 0).unwrap();
        wal.begin("write", &target, &temp, 1, 0).unwrap();
        wal.complete(idx0).unwrap();
        wal.truncate_completed().unwrap();

        let entries = wal.read_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].completed);
    }
}

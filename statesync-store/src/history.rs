//! Per-document version history.
//!
//! Each mutation that replaces an existing value first stores that value as
//! `<root>/state/history/<sanitized key>/<version>.json`. Versions are
//! monotonic per document and survive process restarts: the counter is
//! recovered from the highest version on disk the first time a document is
//! touched. At most `retention` snapshots are kept; the lowest versions are
//! pruned first.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::Value;

use statesync_core::error::{io_err, StoreError};
use statesync_core::paths::{history_dir_at, snapshot_file_at, DOCUMENT_EXTENSION};
use statesync_core::{DocumentPath, SnapshotOperation, VersionInfo, VersionSnapshot, WriterId};

use crate::atomic::{content_hash, write_atomic};

pub struct VersionHistory {
    root: PathBuf,
    retention: usize,
    counters: Mutex<HashMap<DocumentPath, u64>>,
}

/// Listing form: the payload stays unparsed.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotHeader<'a> {
    version: u64,
    timestamp: DateTime<Utc>,
    #[serde(borrow)]
    data: &'a RawValue,
    writer_id: WriterId,
    operation: SnapshotOperation,
}

impl VersionHistory {
    /// `retention` below one is raised to one.
    pub fn new(root: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            root: root.into(),
            retention: retention.max(1),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Persist `value` as the next version of `path` and prune.
    pub fn snapshot(
        &self,
        path: &DocumentPath,
        value: &Value,
        writer: &WriterId,
        operation: SnapshotOperation,
    ) -> Result<u64, StoreError> {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        let last = match counters.get(path) {
            Some(&n) => n,
            None => self.versions(path)?.last().copied().unwrap_or(0),
        };
        let version = last + 1;

        let snapshot = VersionSnapshot {
            version,
            timestamp: Utc::now(),
            data: value.clone(),
            writer_id: writer.clone(),
            operation,
        };
        let file = snapshot_file_at(&self.root, path, version);
        write_atomic(&file, &serde_json::to_vec_pretty(&snapshot)?)?;
        counters.insert(path.clone(), version);
        drop(counters);

        tracing::debug!(path = %path, version, operation = ?operation, "snapshot stored");
        self.prune(path)?;
        Ok(version)
    }

    /// Snapshot listing, newest first. Unreadable snapshot files are skipped.
    pub fn history(&self, path: &DocumentPath) -> Vec<VersionInfo> {
        let versions = match self.versions(path) {
            Ok(versions) => versions,
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "cannot list history");
                return Vec::new();
            }
        };

        versions
            .into_iter()
            .rev()
            .filter_map(|version| {
                let file = snapshot_file_at(&self.root, path, version);
                let bytes = read_soft(&file)?;
                match serde_json::from_slice::<SnapshotHeader<'_>>(&bytes) {
                    Ok(header) => Some(VersionInfo {
                        version: header.version,
                        timestamp: header.timestamp,
                        writer_id: header.writer_id,
                        operation: header.operation,
                        data_hash: content_hash(header.data.get().as_bytes()),
                    }),
                    Err(err) => {
                        tracing::warn!(file = %file.display(), error = %err, "skipping malformed snapshot");
                        None
                    }
                }
            })
            .collect()
    }

    /// The value stored as `version`, if present and readable.
    pub fn at(&self, path: &DocumentPath, version: u64) -> Option<Value> {
        let file = snapshot_file_at(&self.root, path, version);
        let bytes = read_soft(&file)?;
        match serde_json::from_slice::<VersionSnapshot>(&bytes) {
            Ok(snapshot) => Some(snapshot.data),
            Err(err) => {
                tracing::warn!(file = %file.display(), error = %err, "malformed snapshot");
                None
            }
        }
    }

    pub fn latest_version(&self, path: &DocumentPath) -> Option<u64> {
        let counted = self
            .counters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(path)
            .copied();
        counted.or_else(|| self.versions(path).ok()?.last().copied())
    }

    /// Version numbers on disk, ascending.
    fn versions(&self, path: &DocumentPath) -> Result<Vec<u64>, StoreError> {
        let dir = history_dir_at(&self.root, path);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&dir, err)),
        };

        let mut versions: Vec<u64> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| version_of(&e.path()))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    fn prune(&self, path: &DocumentPath) -> Result<(), StoreError> {
        let versions = self.versions(path)?;
        if versions.len() <= self.retention {
            return Ok(());
        }
        let excess = versions.len() - self.retention;
        for version in &versions[..excess] {
            let file = snapshot_file_at(&self.root, path, *version);
            match fs::remove_file(&file) {
                Ok(()) => tracing::debug!(path = %path, version, "pruned snapshot"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(io_err(&file, err)),
            }
        }
        Ok(())
    }
}

fn version_of(file: &Path) -> Option<u64> {
    if file.extension().and_then(|e| e.to_str()) != Some(DOCUMENT_EXTENSION) {
        return None;
    }
    file.file_stem()?.to_str()?.parse().ok()
}

fn read_soft(file: &Path) -> Option<Vec<u8>> {
    match fs::read(file) {
        Ok(bytes) => Some(bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => {
            tracing::warn!(file = %file.display(), error = %err, "cannot read snapshot");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc() -> DocumentPath {
        DocumentPath::new("sessions/a/tasks").unwrap()
    }

    fn writer() -> WriterId {
        WriterId::from("api")
    }

    #[test]
    fn versions_are_monotonic_from_one() {
        let tmp = TempDir::new().unwrap();
        let history = VersionHistory::new(tmp.path(), 10);
        for n in 1..=3 {
            let v = history
                .snapshot(&doc(), &json!({"n": n}), &writer(), SnapshotOperation::Update)
                .unwrap();
            assert_eq!(v, n);
        }
        assert_eq!(history.latest_version(&doc()), Some(3));
        assert_eq!(history.at(&doc(), 2), Some(json!({"n": 2})));
        assert_eq!(history.at(&doc(), 9), None);
    }

    #[test]
    fn retention_keeps_most_recent() {
        let tmp = TempDir::new().unwrap();
        let history = VersionHistory::new(tmp.path(), 3);
        for n in 1..=5 {
            history
                .snapshot(&doc(), &json!(n), &writer(), SnapshotOperation::Update)
                .unwrap();
        }
        let listed: Vec<u64> = history.history(&doc()).iter().map(|i| i.version).collect();
        assert_eq!(listed, vec![5, 4, 3]);
        assert_eq!(history.at(&doc(), 1), None);
    }

    #[test]
    fn counter_recovers_from_disk_after_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let history = VersionHistory::new(tmp.path(), 10);
            for n in 0..4 {
                history
                    .snapshot(&doc(), &json!(n), &writer(), SnapshotOperation::Update)
                    .unwrap();
            }
        }
        let reopened = VersionHistory::new(tmp.path(), 10);
        let v = reopened
            .snapshot(&doc(), &json!("after"), &writer(), SnapshotOperation::Delete)
            .unwrap();
        assert_eq!(v, 5);
    }

    #[test]
    fn listing_carries_metadata_and_payload_hash() {
        let tmp = TempDir::new().unwrap();
        let history = VersionHistory::new(tmp.path(), 10);
        history
            .snapshot(&doc(), &json!({"a": 1}), &writer(), SnapshotOperation::Update)
            .unwrap();
        history
            .snapshot(&doc(), &json!({"a": 1}), &WriterId::from("cli"), SnapshotOperation::PreRollback)
            .unwrap();

        let listed = history.history(&doc());
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].version, 2);
        assert_eq!(listed[0].writer_id, WriterId::from("cli"));
        assert_eq!(listed[0].operation, SnapshotOperation::PreRollback);
        assert_eq!(listed[0].data_hash, listed[1].data_hash, "same payload, same hash");
        assert_eq!(listed[0].data_hash.len(), 64);
    }

    #[test]
    fn malformed_snapshot_files_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let history = VersionHistory::new(tmp.path(), 10);
        history
            .snapshot(&doc(), &json!(1), &writer(), SnapshotOperation::Update)
            .unwrap();
        fs::write(snapshot_file_at(tmp.path(), &doc(), 7), b"{ not json").unwrap();
        fs::write(history_dir_at(tmp.path(), &doc()).join("notes.txt"), b"x").unwrap();

        let listed: Vec<u64> = history.history(&doc()).iter().map(|i| i.version).collect();
        assert_eq!(listed, vec![1]);
        assert_eq!(history.at(&doc(), 7), None);
    }

    #[test]
    fn similar_paths_keep_separate_logs() {
        let tmp = TempDir::new().unwrap();
        let history = VersionHistory::new(tmp.path(), 10);
        let nested = DocumentPath::new("a/b").unwrap();
        let flat = DocumentPath::new("a__b").unwrap();

        history
            .snapshot(&nested, &json!("a/b-1"), &writer(), SnapshotOperation::Update)
            .unwrap();
        history
            .snapshot(&flat, &json!("b-1"), &writer(), SnapshotOperation::Update)
            .unwrap();
        history
            .snapshot(&flat, &json!("b-2"), &writer(), SnapshotOperation::Update)
            .unwrap();

        let listed: Vec<u64> = history.history(&nested).iter().map(|i| i.version).collect();
        assert_eq!(listed, vec![1]);
        assert_eq!(history.at(&nested, 1), Some(json!("a/b-1")));
        assert_eq!(history.at(&nested, 2), None);
        assert_eq!(history.latest_version(&flat), Some(2));
    }

    #[test]
    fn unknown_document_has_empty_history() {
        let tmp = TempDir::new().unwrap();
        let history = VersionHistory::new(tmp.path(), 10);
        assert!(history.history(&doc()).is_empty());
        assert_eq!(history.latest_version(&doc()), None);
    }
}

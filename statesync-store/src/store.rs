//! Cached, file-backed JSON document store.
//!
//! ## Write protocol
//!
//! 1. Read the current value (cache or disk) to decide create vs update.
//! 2. Snapshot the current value into history when asked to and present.
//! 3. Write the new value to a sibling temp file, fsync, rename over.
//! 4. Update the cache before returning.
//! 5. Broadcast the [`ChangeRecord`] once, after internal locks are released.
//!
//! Mutations inside one process are serialized, so reads observe writes in
//! program order. Announcements are not: two threads writing the same path
//! may broadcast in the opposite order to their commits. Consumers that need
//! commit order sort by [`ChangeRecord::timestamp`]. Across processes the
//! file is the only shared state.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};

use statesync_core::error::{io_err, StoreError};
use statesync_core::paths::{self, document_file_at, lock_file_for};
use statesync_core::{
    ChangeOperation, ChangeRecord, DocumentPath, SnapshotOperation, StoreConfig, WriterId,
};
use statesync_fanout::Fanout;

use crate::atomic::{content_hash, write_atomic};
use crate::cache::{CacheEntry, DocumentCache};
use crate::history::VersionHistory;
use crate::lock::{DocumentLock, LockPolicy};

pub struct DocumentStore {
    root: PathBuf,
    cache: Mutex<DocumentCache>,
    /// Last value broadcast per path. Reads never touch it, so a read racing
    /// the watcher cannot hide an external edit.
    announced: Mutex<HashMap<DocumentPath, Value>>,
    /// Serializes mutations; never held while broadcasting.
    mutation: Mutex<()>,
    history: VersionHistory,
    fanout: Arc<Fanout>,
    lock_policy: LockPolicy,
}

impl DocumentStore {
    /// Open a store at `config.root`, creating the directory if needed.
    pub fn new(config: &StoreConfig, fanout: Arc<Fanout>) -> Result<Self, StoreError> {
        let root = &config.root;
        fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
        // Watcher events arrive with canonical paths (e.g. /private/var on macOS).
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.clone());
        Ok(Self {
            history: VersionHistory::new(&root, config.history_retention),
            root,
            cache: Mutex::new(DocumentCache::default()),
            announced: Mutex::new(HashMap::new()),
            mutation: Mutex::new(()),
            fanout,
            lock_policy: LockPolicy::from(config),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history(&self) -> &VersionHistory {
        &self.history
    }

    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    /// `<root>/<path>.json`
    pub fn document_file(&self, path: &DocumentPath) -> PathBuf {
        document_file_at(&self.root, path)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Current value of `path`, or `None` when the document is missing,
    /// empty, truncated or otherwise not valid JSON.
    pub fn read(&self, path: &DocumentPath) -> Option<Value> {
        let file = self.document_file(path);
        let meta = match fs::metadata(&file) {
            Ok(meta) => meta,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %path, error = %err, "cannot stat document");
                }
                self.cache().remove(path);
                return None;
            }
        };
        let mtime = meta.modified().ok();

        if let Some(mtime) = mtime {
            if let Some(hit) = self.cache().fresh(path, mtime) {
                return Some(hit.clone());
            }
        }

        let bytes = match fs::read(&file) {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %path, error = %err, "cannot read document");
                }
                self.cache().remove(path);
                return None;
            }
        };
        let hash = content_hash(&bytes);

        let mut cache = self.cache();
        if let Some(mtime) = mtime {
            if let Some(same) = cache.touch(path, &hash, mtime) {
                return Some(same.clone());
            }
        }

        if bytes.iter().all(u8::is_ascii_whitespace) {
            tracing::debug!(path = %path, "empty document treated as absent");
            cache.remove(path);
            return None;
        }
        let data: Value = match serde_json::from_slice(&bytes) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "malformed document treated as absent");
                cache.remove(path);
                return None;
            }
        };

        match mtime {
            Some(source_mtime) => cache.insert(
                path.clone(),
                CacheEntry {
                    data: data.clone(),
                    content_hash: hash,
                    source_mtime,
                },
            ),
            None => {
                cache.remove(path);
            }
        }
        Some(data)
    }

    pub fn read_or(&self, path: &DocumentPath, default: Value) -> Value {
        self.read(path).unwrap_or(default)
    }

    /// Cached value without touching the filesystem.
    pub fn cached(&self, path: &DocumentPath) -> Option<Value> {
        self.cache().get(path).map(|entry| entry.data.clone())
    }

    pub fn invalidate(&self, path: &DocumentPath) {
        self.cache().remove(path);
    }

    pub fn clear_cache(&self) {
        self.cache().clear();
    }

    pub fn cached_count(&self) -> usize {
        self.cache().len()
    }

    /// Every live document under the root, sorted.
    pub fn list(&self) -> Result<Vec<DocumentPath>, StoreError> {
        let mut docs = Vec::new();
        let mut dirs = vec![self.root.clone()];
        while let Some(dir) = dirs.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(&dir, err)),
            };
            for entry in entries {
                let entry = entry.map_err(|e| io_err(&dir, e))?;
                let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
                let path = entry.path();
                if ty.is_dir() {
                    dirs.push(path);
                } else if let Some(doc) = paths::document_path_for_file(&self.root, &path) {
                    docs.push(doc);
                }
            }
        }
        docs.sort();
        Ok(docs)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn write(
        &self,
        path: &DocumentPath,
        value: Value,
        writer: &WriterId,
    ) -> Result<ChangeRecord, StoreError> {
        self.write_with(path, value, writer, true)
    }

    /// `write` with control over the history snapshot of the replaced value.
    ///
    /// The commit is serialized but the broadcast happens after the lock is
    /// released, so concurrent writers to one path can be announced out of
    /// commit order. Subscribers may call back into the store.
    pub fn write_with(
        &self,
        path: &DocumentPath,
        value: Value,
        writer: &WriterId,
        record_version: bool,
    ) -> Result<ChangeRecord, StoreError> {
        let record = self.mutate(path, writer, record_version, |_| Ok(value))?;
        self.announce(&record);
        Ok(record)
    }

    /// Shallow-merge `fields` into the current object (or `{}`).
    pub fn merge(
        &self,
        path: &DocumentPath,
        fields: Map<String, Value>,
        writer: &WriterId,
    ) -> Result<ChangeRecord, StoreError> {
        let record = self.mutate(path, writer, true, |current| {
            let mut merged = match current {
                Some(Value::Object(existing)) => existing.clone(),
                _ => Map::new(),
            };
            merged.extend(fields);
            Ok(Value::Object(merged))
        })?;
        self.announce(&record);
        Ok(record)
    }

    /// Remove `path`. `None` when it does not exist.
    ///
    /// Holds the sidecar lock while removing; a lock that stays contended
    /// past the configured retries is broken (see [`DocumentLock`]).
    pub fn delete(
        &self,
        path: &DocumentPath,
        writer: &WriterId,
    ) -> Result<Option<ChangeRecord>, StoreError> {
        let guard = self.mutation();
        let file = self.document_file(path);
        if !file.exists() {
            self.cache().remove(path);
            return Ok(None);
        }

        let lock = DocumentLock::acquire(&lock_file_for(&file), self.lock_policy)?;
        let previous = self.read(path);
        if let Some(prev) = &previous {
            self.history
                .snapshot(path, prev, writer, SnapshotOperation::Delete)?;
        }
        match fs::remove_file(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&file, err)),
        }
        self.cache().remove(path);
        self.announced().remove(path);
        drop(lock);
        drop(guard);

        tracing::info!(path = %path, writer = %writer, "document deleted");
        let record = ChangeRecord::new(
            path.clone(),
            previous,
            Value::Object(Map::new()),
            ChangeOperation::Delete,
            writer.clone(),
        );
        self.announce(&record);
        Ok(Some(record))
    }

    /// Restore `version` of `path`. The current value is snapshotted first
    /// as `pre_rollback`, so a rollback can itself be rolled back.
    pub fn rollback(
        &self,
        path: &DocumentPath,
        version: u64,
        writer: &WriterId,
    ) -> Result<Option<ChangeRecord>, StoreError> {
        let Some(target) = self.history.at(path, version) else {
            tracing::warn!(path = %path, version, "rollback target not found");
            return Ok(None);
        };
        let record = self.mutate(path, writer, false, |current| {
            if let Some(current) = current {
                self.history
                    .snapshot(path, current, writer, SnapshotOperation::PreRollback)?;
            }
            Ok(target)
        })?;
        tracing::info!(path = %path, version, "document rolled back");
        self.announce(&record);
        Ok(Some(record))
    }

    /// Fold a file changed outside the store into the cache and announce it.
    ///
    /// `previous_value` is the last value this store announced for the path,
    /// or the cached value when it never announced one. Returns `None` for
    /// ignored files, unreadable content, or content identical to the last
    /// announcement (such as the echo of this store's own write).
    pub fn ingest_external(&self, file: &Path) -> Option<ChangeRecord> {
        let path = paths::document_path_for_file(&self.root, file)?;
        let guard = self.mutation();
        let announced = self.announced().get(&path).cloned();
        let cached = self.cached(&path);

        let record = if file.exists() {
            let current = self.read(&path)?;
            if announced.as_ref() == Some(&current) {
                return None;
            }
            let previous = announced.or(cached);
            let operation = if previous.is_some() {
                ChangeOperation::Update
            } else {
                ChangeOperation::Create
            };
            self.announced().insert(path.clone(), current.clone());
            ChangeRecord::new(path, previous, current, operation, WriterId::external())
        } else {
            let previous = announced.or(cached)?;
            self.cache().remove(&path);
            self.announced().remove(&path);
            ChangeRecord::new(
                path,
                Some(previous),
                Value::Object(Map::new()),
                ChangeOperation::Delete,
                WriterId::external(),
            )
        };
        drop(guard);

        tracing::info!(
            path = %record.document_path,
            operation = %record.operation,
            "external change detected",
        );
        self.announce(&record);
        Some(record)
    }

    /// Read-modify-write under the mutation lock without broadcasting.
    ///
    /// `build` receives the current value and returns the replacement.
    pub(crate) fn mutate<F>(
        &self,
        path: &DocumentPath,
        writer: &WriterId,
        record_version: bool,
        build: F,
    ) -> Result<ChangeRecord, StoreError>
    where
        F: FnOnce(Option<&Value>) -> Result<Value, StoreError>,
    {
        let _guard = self.mutation();
        let previous = self.read(path);
        let value = build(previous.as_ref())?;

        if record_version {
            if let Some(prev) = &previous {
                self.history
                    .snapshot(path, prev, writer, SnapshotOperation::Update)?;
            }
        }

        let file = self.document_file(path);
        let bytes = serde_json::to_vec_pretty(&value)?;
        write_atomic(&file, &bytes)?;

        let mtime = fs::metadata(&file).and_then(|m| m.modified());
        let mut cache = self.cache();
        match mtime {
            Ok(source_mtime) => cache.insert(
                path.clone(),
                CacheEntry {
                    data: value.clone(),
                    content_hash: content_hash(&bytes),
                    source_mtime,
                },
            ),
            Err(err) => {
                tracing::debug!(path = %path, error = %err, "no mtime; document not cached");
                cache.remove(path);
            }
        }
        drop(cache);
        self.announced().insert(path.clone(), value.clone());

        let operation = if previous.is_some() {
            ChangeOperation::Update
        } else {
            ChangeOperation::Create
        };
        tracing::debug!(path = %path, writer = %writer, operation = %operation, "document written");
        Ok(ChangeRecord::new(
            path.clone(),
            previous,
            value,
            operation,
            writer.clone(),
        ))
    }

    pub(crate) fn announce(&self, record: &ChangeRecord) {
        self.fanout.broadcast(record);
    }

    fn cache(&self) -> MutexGuard<'_, DocumentCache> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn announced(&self) -> MutexGuard<'_, HashMap<DocumentPath, Value>> {
        self.announced.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn mutation(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().unwrap_or_else(|p| p.into_inner())
    }
}

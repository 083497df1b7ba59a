//! Optimistic field updates reconciled against remote documents with
//! version vectors.
//!
//! A local update is written through the store immediately and tracked as
//! [`PendingUpdate`] until the next [`OptimisticCoordinator::sync_with_remote`]
//! on the same document commits or rejects it. Conflicts are detected per
//! field: the latest pending update on a field conflicts with the remote copy
//! when both carry the field with different values and the update's vector
//! is concurrent with the remote `_version_vector`.
//!
//! A pending field whose vector is ordered with the remote one (either way)
//! keeps its local value and is reported as no conflict. Fields without a
//! pending update follow the document vectors: a local copy that strictly
//! dominates the remote keeps its values, otherwise the remote values win.
//! Fields only the remote carries are always taken.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use statesync_core::{
    merge_values, ChangeRecord, ConflictRecord, ConflictResolution, DocumentEnvelope,
    DocumentPath, PendingStatus, PendingUpdate, ResolutionStrategy, StoreConfig, StoreError,
    SyncOutcome, VectorOrdering, VersionVector, WriterId, VERSION_VECTOR_KEY,
};

use crate::store::DocumentStore;

pub struct OptimisticCoordinator {
    store: Arc<DocumentStore>,
    default_strategy: ResolutionStrategy,
    documents: Mutex<HashMap<DocumentPath, DocumentState>>,
    next_id: AtomicU64,
}

#[derive(Debug, Default)]
struct DocumentState {
    vector: VersionVector,
    updates: Vec<PendingUpdate>,
}

impl DocumentState {
    fn pending(&self) -> impl Iterator<Item = &PendingUpdate> {
        self.updates
            .iter()
            .filter(|u| u.status == PendingStatus::Pending)
    }

    fn pending_fields(&self) -> HashSet<String> {
        self.pending().map(|u| u.field.clone()).collect()
    }

    fn reject_field(&mut self, field: &str) -> Vec<PendingUpdate> {
        let mut rejected = Vec::new();
        for update in self
            .updates
            .iter_mut()
            .filter(|u| u.field == field && u.status == PendingStatus::Pending)
        {
            update.status = PendingStatus::Rejected;
            rejected.push(update.clone());
        }
        rejected
    }
}

impl OptimisticCoordinator {
    pub fn new(store: Arc<DocumentStore>, default_strategy: ResolutionStrategy) -> Self {
        Self {
            store,
            default_strategy,
            documents: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(store: Arc<DocumentStore>, config: &StoreConfig) -> Self {
        Self::new(store, config.default_strategy)
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn default_strategy(&self) -> ResolutionStrategy {
        self.default_strategy
    }

    /// Write `field = value` now and track it until the next sync.
    pub fn optimistic_update(
        &self,
        path: &DocumentPath,
        field: &str,
        value: Value,
        writer: &WriterId,
    ) -> Result<PendingUpdate, StoreError> {
        if field == VERSION_VECTOR_KEY {
            return Err(StoreError::ReservedField(field.to_owned()));
        }

        let mut documents = self.documents();
        let doc = self.state_for(&mut documents, path);
        let known = doc.vector.clone();

        let mut previous_value = None;
        let mut written = VersionVector::new();
        let record = self.store.mutate(path, writer, true, |current| {
            let mut env = object_envelope(path, current)?;
            let mut vector = env.metadata.merged(&known);
            vector.increment(writer);
            previous_value = env.payload.insert(field.to_owned(), value.clone());
            env.metadata = vector.clone();
            written = vector;
            Ok(env.into_value())
        })?;

        doc.vector = written.clone();
        let update = PendingUpdate {
            id: format!("upd-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
            document_path: path.clone(),
            field: field.to_owned(),
            value,
            previous_value,
            writer_id: writer.clone(),
            vector_at_write: written,
            status: PendingStatus::Pending,
        };
        doc.updates.push(update.clone());
        drop(documents);

        tracing::debug!(path = %path, field, id = %update.id, "optimistic update applied");
        self.store.announce(&record);
        Ok(update)
    }

    /// Field conflicts between the pending updates on `path` and `remote`.
    pub fn detect_conflicts(
        &self,
        path: &DocumentPath,
        remote: &Value,
        remote_writer: &WriterId,
    ) -> Vec<ConflictRecord> {
        let local = envelope_of(self.store.read(path).as_ref());
        let remote = DocumentEnvelope::from_value(remote.clone());
        let mut documents = self.documents();
        let doc = self.state_for(&mut documents, path);
        find_conflicts(path, doc, &local, &remote, remote_writer)
    }

    /// Settle `conflicts` against the current local document and `remote`
    /// with `strategy` and return the resolved document. Nothing is written.
    ///
    /// The result is the document [`Self::sync_with_remote`] would write for
    /// the same inputs. With [`ResolutionStrategy::Reject`] the pending
    /// updates on each conflicting field are rejected and dropped.
    pub fn resolve_conflicts(
        &self,
        path: &DocumentPath,
        remote: &Value,
        conflicts: &mut [ConflictRecord],
        strategy: ResolutionStrategy,
    ) -> Value {
        let local = envelope_of(self.store.read(path).as_ref());
        let remote = DocumentEnvelope::from_value(remote.clone());
        let mut documents = self.documents();
        let doc = self.state_for(&mut documents, path);
        let base = reconcile_base(local, doc, &remote);
        let resolved = apply_resolution(base, conflicts, strategy);
        if strategy == ResolutionStrategy::Reject {
            for conflict in conflicts.iter() {
                let rejected = doc.reject_field(&conflict.field);
                tracing::debug!(
                    path = %path,
                    field = %conflict.field,
                    rejected = rejected.len(),
                    "updates rejected",
                );
            }
            doc.updates.retain(|u| !u.status.is_terminal());
        }
        resolved.into_value()
    }

    /// Reconcile `path` with a remote copy in one store write.
    ///
    /// Detects conflicts, resolves them with `strategy` (or the configured
    /// default), writes the resolved document as `remote_writer`, then
    /// commits every pending update on the path that was not rejected.
    pub fn sync_with_remote(
        &self,
        path: &DocumentPath,
        remote: &Value,
        remote_writer: &WriterId,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<SyncOutcome, StoreError> {
        let strategy = strategy.unwrap_or(self.default_strategy);
        let remote = DocumentEnvelope::from_value(remote.clone());

        let mut documents = self.documents();
        let doc = self.state_for(&mut documents, path);

        let tracked: &DocumentState = doc;
        let mut conflicts = Vec::new();
        let mut resolved_vector = VersionVector::new();
        let record = self.store.mutate(path, remote_writer, true, |current| {
            let local = envelope_of(current);
            conflicts = find_conflicts(path, tracked, &local, &remote, remote_writer);

            let base = reconcile_base(local, tracked, &remote);
            let resolved = apply_resolution(base, &mut conflicts, strategy);
            resolved_vector = resolved.metadata.clone();
            Ok(resolved.into_value())
        })?;

        doc.vector = resolved_vector;
        let mut rejected = Vec::new();
        if strategy == ResolutionStrategy::Reject {
            for conflict in &conflicts {
                rejected.extend(doc.reject_field(&conflict.field));
            }
        }
        let mut committed_count = 0;
        for update in doc
            .updates
            .iter_mut()
            .filter(|u| u.status == PendingStatus::Pending)
        {
            update.status = PendingStatus::Committed;
            committed_count += 1;
        }
        doc.updates.retain(|u| !u.status.is_terminal());
        drop(documents);

        tracing::info!(
            path = %path,
            remote = %remote_writer,
            conflicts = conflicts.len(),
            committed = committed_count,
            strategy = %strategy,
            "synced with remote",
        );
        self.store.announce(&record);
        Ok(SyncOutcome {
            resolved_document: record.new_value,
            conflicts,
            committed_count,
            rejected,
        })
    }

    /// Mark a pending update committed and stop tracking it.
    pub fn commit(&self, update_id: &str) -> bool {
        let mut documents = self.documents();
        for doc in documents.values_mut() {
            if let Some(idx) = doc
                .updates
                .iter()
                .position(|u| u.id == update_id && u.status == PendingStatus::Pending)
            {
                doc.updates.remove(idx);
                tracing::debug!(id = update_id, "update committed");
                return true;
            }
        }
        false
    }

    /// Undo a pending update by restoring the field's previous value (or
    /// removing the field). The update is dropped as rejected. `None` for
    /// unknown or already settled ids.
    pub fn revert(&self, update_id: &str) -> Result<Option<ChangeRecord>, StoreError> {
        let mut documents = self.documents();
        let Some((path, idx)) = documents.iter().find_map(|(path, doc)| {
            doc.updates
                .iter()
                .position(|u| u.id == update_id && u.status == PendingStatus::Pending)
                .map(|idx| (path.clone(), idx))
        }) else {
            return Ok(None);
        };
        let Some(doc) = documents.get_mut(&path) else {
            return Ok(None);
        };
        let update = doc.updates[idx].clone();
        let known = doc.vector.clone();

        let record = self.store.mutate(&path, &update.writer_id, true, |current| {
            let mut env = object_envelope(&path, current)?;
            match &update.previous_value {
                Some(previous) => {
                    env.payload.insert(update.field.clone(), previous.clone());
                }
                None => {
                    env.payload.remove(&update.field);
                }
            }
            env.metadata.merge(&known);
            Ok(env.into_value())
        })?;
        doc.updates.remove(idx);
        drop(documents);

        tracing::info!(path = %path, field = %update.field, id = update_id, "update reverted");
        self.store.announce(&record);
        Ok(Some(record))
    }

    /// Updates on `path` still awaiting reconciliation.
    pub fn pending(&self, path: &DocumentPath) -> Vec<PendingUpdate> {
        self.documents()
            .get(path)
            .map(|doc| doc.pending().cloned().collect())
            .unwrap_or_default()
    }

    /// The document's version vector as this coordinator knows it.
    pub fn vector(&self, path: &DocumentPath) -> VersionVector {
        let mut documents = self.documents();
        self.state_for(&mut documents, path).vector.clone()
    }

    fn state_for<'a>(
        &self,
        documents: &'a mut HashMap<DocumentPath, DocumentState>,
        path: &DocumentPath,
    ) -> &'a mut DocumentState {
        documents.entry(path.clone()).or_insert_with(|| DocumentState {
            vector: envelope_of(self.store.read(path).as_ref()).metadata,
            updates: Vec::new(),
        })
    }

    fn documents(&self) -> MutexGuard<'_, HashMap<DocumentPath, DocumentState>> {
        self.documents.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn envelope_of(value: Option<&Value>) -> DocumentEnvelope {
    value
        .cloned()
        .map(DocumentEnvelope::from_value)
        .unwrap_or_default()
}

/// Like [`envelope_of`], but refuses to treat a stored non-object value as
/// an empty document.
fn object_envelope(
    path: &DocumentPath,
    value: Option<&Value>,
) -> Result<DocumentEnvelope, StoreError> {
    match value {
        Some(value) if !value.is_object() => Err(StoreError::NotAnObject(path.to_string())),
        _ => Ok(envelope_of(value)),
    }
}

/// The local document with remote fields folded in, before conflicts are
/// settled. Pending fields keep their local value unless missing locally.
fn reconcile_base(
    mut local: DocumentEnvelope,
    doc: &DocumentState,
    remote: &DocumentEnvelope,
) -> DocumentEnvelope {
    local.metadata.merge(&doc.vector);
    let local_is_newer = local.metadata.compare(&remote.metadata) == VectorOrdering::Dominates;
    let pending = doc.pending_fields();
    for (field, value) in &remote.payload {
        let missing = !local.payload.contains_key(field);
        if missing || (!local_is_newer && !pending.contains(field)) {
            local.payload.insert(field.clone(), value.clone());
        }
    }
    local.metadata.merge(&remote.metadata);
    local
}

fn find_conflicts(
    path: &DocumentPath,
    doc: &DocumentState,
    local: &DocumentEnvelope,
    remote: &DocumentEnvelope,
    remote_writer: &WriterId,
) -> Vec<ConflictRecord> {
    // Later updates on a field supersede earlier ones.
    let mut latest: BTreeMap<&str, &PendingUpdate> = BTreeMap::new();
    for update in doc.pending() {
        latest.insert(update.field.as_str(), update);
    }

    latest
        .into_values()
        .filter_map(|update| {
            let local_value = local.field(&update.field)?;
            let remote_value = remote.field(&update.field)?;
            if local_value == remote_value {
                return None;
            }
            if !update.vector_at_write.concurrent_with(&remote.metadata) {
                tracing::debug!(
                    path = %path,
                    field = %update.field,
                    ordering = ?update.vector_at_write.compare(&remote.metadata),
                    "ordered write; local value kept",
                );
                return None;
            }
            Some(ConflictRecord {
                document_path: path.clone(),
                field: update.field.clone(),
                local_value: local_value.clone(),
                remote_value: remote_value.clone(),
                local_writer: update.writer_id.clone(),
                remote_writer: remote_writer.clone(),
                local_vector: update.vector_at_write.clone(),
                remote_vector: remote.metadata.clone(),
                resolution: None,
            })
        })
        .collect()
}

fn apply_resolution(
    mut base: DocumentEnvelope,
    conflicts: &mut [ConflictRecord],
    strategy: ResolutionStrategy,
) -> DocumentEnvelope {
    for conflict in conflicts.iter_mut() {
        let value = match strategy {
            ResolutionStrategy::LastWriteWins => conflict.remote_value.clone(),
            ResolutionStrategy::Merge => merge_values(&conflict.local_value, &conflict.remote_value),
            ResolutionStrategy::Reject => conflict.local_value.clone(),
        };
        base.payload.insert(conflict.field.clone(), value.clone());
        base.metadata.merge(&conflict.local_vector);
        base.metadata.merge(&conflict.remote_vector);
        conflict.resolution = Some(ConflictResolution {
            value,
            method: strategy,
        });
    }
    base
}

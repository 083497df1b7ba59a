//! Domain types shared by the store, the coordinator and the fan-out.
//!
//! Wire names follow the change-record schema consumed by the HTTP/SSE
//! layer (`filePath`, `oldValue`, `newValue`, `changeType`, `source`).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::paths::HISTORY_DIR;
use crate::vector::VersionVector;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A validated logical document path such as `sessions/abc/tasks`.
///
/// A trailing `.json` is stripped, so `sessions/abc/tasks.json` names the
/// same document. Absolute paths, backslashes, empty segments, `.`/`..` and
/// anything under the history area are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentPath(String);

impl DocumentPath {
    pub fn new(raw: impl Into<String>) -> Result<Self, StoreError> {
        let raw = raw.into();
        let invalid = |reason| StoreError::InvalidPath {
            path: raw.clone(),
            reason,
        };

        let trimmed = raw.strip_suffix(".json").unwrap_or(&raw);
        if trimmed.is_empty() {
            return Err(invalid("path is empty"));
        }
        if trimmed.starts_with('/') {
            return Err(invalid("path must be relative"));
        }
        if trimmed.contains('\\') {
            return Err(invalid("path must use '/' separators"));
        }
        for segment in trimmed.split('/') {
            match segment {
                "" => return Err(invalid("path has an empty segment")),
                "." | ".." => return Err(invalid("path may not contain '.' or '..'")),
                hidden if hidden.starts_with('.') => {
                    return Err(invalid("path has a dot-prefixed segment"))
                }
                _ => {}
            }
        }
        if trimmed == HISTORY_DIR || trimmed.starts_with(&format!("{HISTORY_DIR}/")) {
            return Err(invalid("path is inside the version history area"));
        }

        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<id>` for paths of the form `sessions/<id>/...`.
    pub fn session_id(&self) -> Option<&str> {
        let mut segments = self.0.split('/');
        match (segments.next(), segments.next()) {
            (Some("sessions"), Some(id)) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for DocumentPath {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for DocumentPath {
    type Error = StoreError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<DocumentPath> for String {
    fn from(path: DocumentPath) -> Self {
        path.0
    }
}

/// Identifier of one logical writer (an HTTP handler, the CLI, the watcher).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WriterId(pub String);

impl WriterId {
    pub const EXTERNAL: &'static str = "external";

    /// The writer attributed to edits detected by the change watcher.
    pub fn external() -> Self {
        Self(Self::EXTERNAL.to_owned())
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for WriterId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WriterId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Change records
// ---------------------------------------------------------------------------

/// Kind of mutation carried by a [`ChangeRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOperation::Create => write!(f, "create"),
            ChangeOperation::Update => write!(f, "update"),
            ChangeOperation::Delete => write!(f, "delete"),
        }
    }
}

/// One accepted mutation. The unit of notification; never modified after
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(rename = "filePath")]
    pub document_path: DocumentPath,
    #[serde(rename = "oldValue")]
    pub previous_value: Option<Value>,
    #[serde(rename = "newValue")]
    pub new_value: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "changeType")]
    pub operation: ChangeOperation,
    pub source: WriterId,
}

impl ChangeRecord {
    pub fn new(
        document_path: DocumentPath,
        previous_value: Option<Value>,
        new_value: Value,
        operation: ChangeOperation,
        source: WriterId,
    ) -> Self {
        Self {
            document_path,
            previous_value,
            new_value,
            timestamp: Utc::now(),
            operation,
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Version history
// ---------------------------------------------------------------------------

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOperation {
    Update,
    Delete,
    PreRollback,
}

/// A persisted prior value of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub writer_id: WriterId,
    pub operation: SnapshotOperation,
}

/// Snapshot listing entry; carries a hash of the payload instead of the
/// payload itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub writer_id: WriterId,
    pub operation: SnapshotOperation,
    pub data_hash: String,
}

// ---------------------------------------------------------------------------
// Optimistic updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    #[default]
    Pending,
    Committed,
    Rejected,
}

impl PendingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PendingStatus::Pending)
    }
}

/// A locally applied field write awaiting reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpdate {
    pub id: String,
    pub document_path: DocumentPath,
    pub field: String,
    pub value: Value,
    /// Field value before this update; `None` when the field was absent.
    pub previous_value: Option<Value>,
    pub writer_id: WriterId,
    pub vector_at_write: VersionVector,
    pub status: PendingStatus,
}

/// How a field-level conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Remote value wins.
    #[default]
    LastWriteWins,
    /// Objects deep-merge, arrays concatenate without duplicates, scalars
    /// prefer remote.
    Merge,
    /// Local value is kept and the pending updates on the field are rejected.
    Reject,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionStrategy::LastWriteWins => write!(f, "last_write_wins"),
            ResolutionStrategy::Merge => write!(f, "merge"),
            ResolutionStrategy::Reject => write!(f, "reject"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub value: Value,
    pub method: ResolutionStrategy,
}

/// A field-level disagreement between a pending local update and a remote
/// version of the same document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub document_path: DocumentPath,
    pub field: String,
    pub local_value: Value,
    pub remote_value: Value,
    pub local_writer: WriterId,
    pub remote_writer: WriterId,
    pub local_vector: VersionVector,
    pub remote_vector: VersionVector,
    pub resolution: Option<ConflictResolution>,
}

/// Result of reconciling a document with a remote version.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub resolved_document: Value,
    pub conflicts: Vec<ConflictRecord>,
    pub committed_count: usize,
    /// Pending updates that lost a `reject` resolution.
    pub rejected: Vec<PendingUpdate>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("sessions/abc/tasks", "sessions/abc/tasks")]
    #[case("sessions/abc/tasks.json", "sessions/abc/tasks")]
    #[case("queue", "queue")]
    #[case("state/agents", "state/agents")]
    fn document_path_normalizes(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(DocumentPath::new(raw).unwrap().as_str(), expected);
    }

    #[rstest]
    #[case("")]
    #[case(".json")]
    #[case("/etc/passwd")]
    #[case("sessions/../secrets")]
    #[case("sessions//tasks")]
    #[case("sessions\\tasks")]
    #[case(".hidden")]
    #[case("sessions/.cache/tasks")]
    #[case(".git/config.json")]
    #[case("state/history")]
    #[case("state/history/sessions__a/1")]
    fn document_path_rejects(#[case] raw: &str) {
        let err = DocumentPath::new(raw).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPath { .. }), "got: {err}");
    }

    #[test]
    fn session_id_from_sessions_prefix() {
        let path = DocumentPath::new("sessions/s-42/tasks").unwrap();
        assert_eq!(path.session_id(), Some("s-42"));
        assert_eq!(DocumentPath::new("queue").unwrap().session_id(), None);
        assert_eq!(DocumentPath::new("sessions").unwrap().session_id(), None);
    }

    #[test]
    fn change_record_uses_wire_field_names() {
        let record = ChangeRecord::new(
            DocumentPath::new("sessions/a/tasks").unwrap(),
            None,
            json!({"x": 1}),
            ChangeOperation::Create,
            WriterId::from("api"),
        );
        let wire = serde_json::to_value(&record).unwrap();
        assert_eq!(wire["filePath"], json!("sessions/a/tasks"));
        assert_eq!(wire["oldValue"], Value::Null);
        assert_eq!(wire["newValue"], json!({"x": 1}));
        assert_eq!(wire["changeType"], json!("create"));
        assert_eq!(wire["source"], json!("api"));
        assert!(wire["timestamp"].as_str().unwrap().contains('T'));

        let back: ChangeRecord = serde_json::from_value(wire).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn strategies_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(ResolutionStrategy::LastWriteWins).unwrap(),
            json!("last_write_wins")
        );
        assert_eq!(
            serde_json::to_value(SnapshotOperation::PreRollback).unwrap(),
            json!("pre_rollback")
        );
    }
}

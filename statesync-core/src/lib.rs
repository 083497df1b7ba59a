//! statesync core library — domain types, version vectors, merge rules,
//! on-disk layout, configuration and errors.
//!
//! - [`types`] — newtypes, change records, pending updates, conflicts
//! - [`vector`] — [`VersionVector`] and causal ordering
//! - [`envelope`] — typed split of metadata and payload
//! - [`merge`] — recursive JSON merge used by conflict resolution
//! - [`paths`] — on-disk layout helpers
//! - [`config`] — [`StoreConfig`]
//! - [`error`] — [`StoreError`]

pub mod config;
pub mod envelope;
pub mod error;
pub mod merge;
pub mod paths;
pub mod types;
pub mod vector;

pub use config::StoreConfig;
pub use envelope::{DocumentEnvelope, VERSION_VECTOR_KEY};
pub use error::StoreError;
pub use merge::merge_values;
pub use types::{
    ChangeOperation, ChangeRecord, ConflictRecord, ConflictResolution, DocumentPath,
    PendingStatus, PendingUpdate, ResolutionStrategy, SnapshotOperation, SyncOutcome,
    VersionInfo, VersionSnapshot, WriterId,
};
pub use vector::{VectorOrdering, VersionVector};

//! Error types for statesync-core and the store built on it.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from document store, history and coordinator
/// operations.
///
/// Reads never produce these: a missing or malformed document is reported
/// as absent instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error on the write path.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Config YAML failed to parse.
    #[error("failed to parse config at {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The logical document path is not acceptable.
    #[error("invalid document path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// A caller tried to write a reserved metadata field as business data.
    #[error("field '{0}' is reserved for document metadata")]
    ReservedField(String),

    /// A field update was aimed at a document whose stored value is not a
    /// JSON object.
    #[error("document '{0}' is not a JSON object")]
    NotAnObject(String),

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or configure an explicit root")]
    HomeNotFound,
}

/// Convenience constructor for [`StoreError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

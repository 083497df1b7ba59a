//! Error types for notification channels.

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single notification channel. Fan-out logs these and moves on.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// `notify` was called after `close`.
    #[error("channel '{0}' is closed")]
    Closed(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ChannelError {
    ChannelError::Io {
        path: path.into(),
        source,
    }
}

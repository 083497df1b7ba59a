//! On-disk layout.
//!
//! ```text
//! <root>/
//!   <logical path>.json                      live documents
//!   <logical path>.json.lock                 sidecar lock during delete
//!   <logical path>.json.statesync.tmp        in-flight atomic write
//!   state/history/<sanitized key>/<n>.json   version snapshots
//! ```

use std::path::{Component, Path, PathBuf};

use crate::types::DocumentPath;

/// Logical prefix reserved for version history.
pub const HISTORY_DIR: &str = "state/history";
pub const DOCUMENT_EXTENSION: &str = "json";
pub const TMP_SUFFIX: &str = ".statesync.tmp";
pub const LOCK_SUFFIX: &str = ".lock";

/// `<root>/<path>.json`. Pure, no I/O.
pub fn document_file_at(root: &Path, path: &DocumentPath) -> PathBuf {
    let mut file = root.to_path_buf();
    let mut segments = path.as_str().split('/').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_some() {
            file.push(segment);
        } else {
            // Not `set_extension`: a dotted stem such as `v1.2` must survive.
            file.push(format!("{segment}.{DOCUMENT_EXTENSION}"));
        }
    }
    file
}

/// Sibling temp file used by the atomic write.
pub fn tmp_file_for(file: &Path) -> PathBuf {
    PathBuf::from(format!("{}{TMP_SUFFIX}", file.display()))
}

/// Sidecar lock file guarding destructive operations.
pub fn lock_file_for(file: &Path) -> PathBuf {
    PathBuf::from(format!("{}{LOCK_SUFFIX}", file.display()))
}

pub fn history_root(root: &Path) -> PathBuf {
    let mut dir = root.to_path_buf();
    for segment in HISTORY_DIR.split('/') {
        dir.push(segment);
    }
    dir
}

/// `<root>/state/history/<sanitized key>/`
pub fn history_dir_at(root: &Path, path: &DocumentPath) -> PathBuf {
    history_root(root).join(sanitize_key(path))
}

/// `<root>/state/history/<sanitized key>/<version>.json`
pub fn snapshot_file_at(root: &Path, path: &DocumentPath, version: u64) -> PathBuf {
    history_dir_at(root, path).join(format!("{version}.{DOCUMENT_EXTENSION}"))
}

/// Flatten a logical path into one directory name.
///
/// Bytes outside `[A-Za-z0-9.-]` are written as `%XX`, with `/`, `_` and `%`
/// included, so distinct paths never share a key.
pub fn sanitize_key(path: &DocumentPath) -> String {
    let mut key = String::with_capacity(path.as_str().len());
    for byte in path.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-') {
            key.push(char::from(byte));
        } else {
            key.push_str(&format!("%{byte:02X}"));
        }
    }
    key
}

/// True for files the store never treats as documents: dotfiles, lock and
/// temp artifacts, non-JSON files, and anything in the history area.
pub fn is_ignored_file(root: &Path, file: &Path) -> bool {
    let Ok(relative) = file.strip_prefix(root) else {
        return true;
    };
    let name = relative.to_string_lossy();
    if name.ends_with(TMP_SUFFIX) || name.ends_with(LOCK_SUFFIX) {
        return true;
    }
    if relative.extension().and_then(|e| e.to_str()) != Some(DOCUMENT_EXTENSION) {
        return true;
    }
    if relative.starts_with(history_root(Path::new(""))) {
        return true;
    }
    relative.components().any(|c| match c {
        Component::Normal(part) => part.to_string_lossy().starts_with('.'),
        _ => true,
    })
}

/// Map a live document file back to its logical path.
pub fn document_path_for_file(root: &Path, file: &Path) -> Option<DocumentPath> {
    if is_ignored_file(root, file) {
        return None;
    }
    let relative = file.strip_prefix(root).ok()?;
    let segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    DocumentPath::new(segments.join("/")).ok()
}

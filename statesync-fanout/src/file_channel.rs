//! Append-only JSON-lines change log with size-based rotation.
//!
//! Rotates the log when it exceeds `max_bytes` (10 MiB by default), keeping
//! at most `max_files` rotated copies:
//!   changes.jsonl → changes.jsonl.1 → changes.jsonl.2 → … → changes.jsonl.5

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use statesync_core::ChangeRecord;

use crate::channel::NotificationChannel;
use crate::error::{io_err, ChannelError};

/// Maximum log file size before rotation (10 MiB).
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Maximum number of rotated backup files to keep.
pub const MAX_ROTATED_FILES: usize = 5;

pub struct FileChannel {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    state: Mutex<FileState>,
}

enum FileState {
    Idle,
    Open(File),
    Closed,
}

impl FileChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_rotation(path, MAX_LOG_BYTES, MAX_ROTATED_FILES)
    }

    pub fn with_rotation(path: impl Into<PathBuf>, max_bytes: u64, max_files: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            max_files,
            state: Mutex::new(FileState::Idle),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File, ChannelError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_err(&self.path, e))
    }
}

impl NotificationChannel for FileChannel {
    fn name(&self) -> &str {
        "file"
    }

    fn notify(&self, change: &ChangeRecord) -> Result<(), ChannelError> {
        let mut line = serde_json::to_vec(change)?;
        line.push(b'\n');

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if matches!(*state, FileState::Closed) {
            return Err(ChannelError::Closed(self.name().to_owned()));
        }

        match rotate_if_needed(&self.path, self.max_bytes, self.max_files) {
            Ok(true) => {
                tracing::info!(path = %self.path.display(), "change log rotated");
                // The open handle points at the renamed file.
                *state = FileState::Idle;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "change log rotation failed")
            }
        }

        if matches!(*state, FileState::Idle) {
            *state = FileState::Open(self.open()?);
        }
        let FileState::Open(file) = &mut *state else {
            return Err(ChannelError::Closed(self.name().to_owned()));
        };
        file.write_all(&line).map_err(|e| io_err(&self.path, e))?;
        file.flush().map_err(|e| io_err(&self.path, e))
    }

    fn close(&self) -> Result<(), ChannelError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let previous = std::mem::replace(&mut *state, FileState::Closed);
        if let FileState::Open(file) = previous {
            file.sync_all().map_err(|e| io_err(&self.path, e))?;
        }
        Ok(())
    }
}

/// Rotate `log_path` if its size exceeds `max_bytes`.
///
/// Rotation sequence (oldest first):
///   `<name>.<max_files>` deleted
///   `<name>.<n>` → `<name>.<n+1>` for n = max_files-1 … 1
///   `<name>` → `<name>.1`
///
/// Returns `true` if rotation occurred. Missing files are not an error.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    if size < max_bytes {
        return Ok(false);
    }

    if max_files == 0 {
        fs::remove_file(log_path)?;
        return Ok(true);
    }

    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }

    for n in (1..max_files).rev() {
        let src = numbered_path(log_path, n);
        if src.exists() {
            fs::rename(&src, numbered_path(log_path, n + 1))?;
        }
    }

    fs::rename(log_path, numbered_path(log_path, 1))?;
    Ok(true)
}

/// Path of the `n`-th rotated copy of `base` (e.g. `changes.jsonl.2`).
pub fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("changes.jsonl");
    base.with_file_name(format!("{name}.{n}"))
}

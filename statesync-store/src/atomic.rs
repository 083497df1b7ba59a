//! Temp-file-then-rename writes.
//!
//! 1. Ensure the parent directory exists.
//! 2. Write the full payload to `<file>.statesync.tmp` and fsync it.
//! 3. Rename over the target (atomic on POSIX).
//! 4. On rename failure remove the temp file; the original is untouched.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};

use statesync_core::error::{io_err, StoreError};
use statesync_core::paths::tmp_file_for;

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    write_atomic_with_tmp(path, bytes, &tmp_file_for(path))
}

fn write_atomic_with_tmp(path: &Path, bytes: &[u8], tmp: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let written = File::create(tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(tmp);
        return Err(io_err(tmp, e));
    }

    if let Err(e) = fs::rename(tmp, path) {
        let _ = fs::remove_file(tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

/// SHA-256 hex digest of `bytes`.
pub(crate) fn content_hash(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

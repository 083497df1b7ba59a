//! Store configuration.
//!
//! Loaded from an optional `statesync.yaml`; every field has a default, so a
//! missing file or a partial file is valid.
//!
//! Like the rest of the crate, path-taking functions come in two forms:
//! - `fn_at(root: &Path, …)` — explicit root; used in tests with `TempDir`
//! - `fn(…)` — derives the root from `dirs::home_dir()`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, StoreError};
use crate::types::ResolutionStrategy;

pub const CONFIG_FILE: &str = "statesync.yaml";

pub const DEFAULT_HISTORY_RETENTION: usize = 50;
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;
pub const DEFAULT_LOCK_ATTEMPTS: u32 = 20;
pub const DEFAULT_LOCK_BACKOFF_MS: u64 = 25;
pub const DEFAULT_BUS_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding live documents and `state/history`.
    pub root: PathBuf,
    /// Snapshots kept per document; oldest pruned first.
    pub history_retention: usize,
    /// Quiet period before a watcher event is processed.
    pub debounce_ms: u64,
    /// Lock acquisition attempts before a lock is treated as stale.
    pub lock_attempts: u32,
    pub lock_backoff_ms: u64,
    /// Ring buffer size of the event bus.
    pub bus_capacity: usize,
    pub default_strategy: ResolutionStrategy,
    /// When set, every change is appended to this JSON-lines file.
    pub change_log: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".statesync"),
            history_retention: DEFAULT_HISTORY_RETENTION,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            lock_attempts: DEFAULT_LOCK_ATTEMPTS,
            lock_backoff_ms: DEFAULT_LOCK_BACKOFF_MS,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            default_strategy: ResolutionStrategy::default(),
            change_log: None,
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at `root`.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// `~/.statesync`
    pub fn default_root() -> Result<PathBuf, StoreError> {
        dirs::home_dir()
            .map(|home| home.join(".statesync"))
            .ok_or(StoreError::HomeNotFound)
    }

    /// Load `<root>/statesync.yaml`, falling back to defaults when absent.
    /// `root` is the directory the file was found in unless the file sets it.
    pub fn load_at(root: &Path) -> Result<Self, StoreError> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::at(root));
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let parse_err = |source| StoreError::Config {
            path: path.clone(),
            source,
        };
        let value: serde_yaml::Value = serde_yaml::from_str(&contents).map_err(parse_err)?;
        if value.is_null() {
            return Ok(Self::at(root));
        }
        let has_root = value.get("root").is_some();
        let mut config: StoreConfig = serde_yaml::from_value(value).map_err(parse_err)?;
        if !has_root {
            config.root = root.to_path_buf();
        }
        Ok(config)
    }

    /// `load_at` convenience wrapper rooted at [`StoreConfig::default_root`].
    pub fn load() -> Result<Self, StoreError> {
        Self::load_at(&Self::default_root()?)
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.history_retention = retention;
        self
    }

    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_change_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.change_log = Some(path.into());
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn lock_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults_at_root() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig::load_at(tmp.path()).unwrap();
        assert_eq!(config.root, tmp.path());
        assert_eq!(config.history_retention, DEFAULT_HISTORY_RETENTION);
        assert_eq!(config.debounce(), Duration::from_millis(100));
        assert_eq!(config.bus_capacity, 1000);
    }

    #[test]
    fn partial_file_overrides_selected_fields() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "history_retention: 3\ndefault_strategy: merge\n",
        )
        .unwrap();
        let config = StoreConfig::load_at(tmp.path()).unwrap();
        assert_eq!(config.root, tmp.path());
        assert_eq!(config.history_retention, 3);
        assert_eq!(config.default_strategy, ResolutionStrategy::Merge);
        assert_eq!(config.lock_attempts, DEFAULT_LOCK_ATTEMPTS);
    }

    #[test]
    fn malformed_file_is_a_config_error_with_path() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "history_retention: [oops").unwrap();
        let err = StoreConfig::load_at(tmp.path()).unwrap_err();
        assert!(matches!(err, StoreError::Config { .. }), "got: {err}");
        assert!(err.to_string().contains(CONFIG_FILE));
    }
}

//! Process-local document cache.
//!
//! An entry is only valid while the backing file's modification time equals
//! `source_mtime`; any other mtime is a miss. The cache is never shared
//! between processes.

use std::collections::HashMap;
use std::time::SystemTime;

use serde_json::Value;

use statesync_core::DocumentPath;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub data: Value,
    /// SHA-256 hex of the bytes the value was parsed from.
    pub content_hash: String,
    pub source_mtime: SystemTime,
}

#[derive(Debug, Default)]
pub(crate) struct DocumentCache {
    entries: HashMap<DocumentPath, CacheEntry>,
}

impl DocumentCache {
    pub(crate) fn get(&self, path: &DocumentPath) -> Option<&CacheEntry> {
        self.entries.get(path)
    }

    /// The cached value, if it was read from a file with `mtime`.
    pub(crate) fn fresh(&self, path: &DocumentPath, mtime: SystemTime) -> Option<&Value> {
        self.entries
            .get(path)
            .filter(|entry| entry.source_mtime == mtime)
            .map(|entry| &entry.data)
    }

    /// Re-stamp an entry whose bytes are unchanged despite a new mtime.
    pub(crate) fn touch(&mut self, path: &DocumentPath, hash: &str, mtime: SystemTime) -> Option<&Value> {
        match self.entries.get_mut(path) {
            Some(entry) if entry.content_hash == hash => {
                entry.source_mtime = mtime;
                Some(&entry.data)
            }
            _ => None,
        }
    }

    pub(crate) fn insert(&mut self, path: DocumentPath, entry: CacheEntry) {
        self.entries.insert(path, entry);
    }

    pub(crate) fn remove(&mut self, path: &DocumentPath) -> Option<CacheEntry> {
        self.entries.remove(path)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn entry(data: Value, hash: &str, mtime: SystemTime) -> CacheEntry {
        CacheEntry {
            data,
            content_hash: hash.to_owned(),
            source_mtime: mtime,
        }
    }

    #[test]
    fn fresh_requires_matching_mtime() {
        let mut cache = DocumentCache::default();
        let path = DocumentPath::new("queue").unwrap();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        cache.insert(path.clone(), entry(json!(1), "h1", t0));

        assert_eq!(cache.fresh(&path, t0), Some(&json!(1)));
        assert_eq!(cache.fresh(&path, t0 + Duration::from_secs(1)), None);
    }

    #[test]
    fn touch_only_revalidates_identical_content() {
        let mut cache = DocumentCache::default();
        let path = DocumentPath::new("queue").unwrap();
        let t0 = SystemTime::UNIX_EPOCH;
        let t1 = t0 + Duration::from_secs(5);
        cache.insert(path.clone(), entry(json!(1), "h1", t0));

        assert!(cache.touch(&path, "other", t1).is_none());
        assert_eq!(cache.fresh(&path, t1), None);
        assert_eq!(cache.touch(&path, "h1", t1), Some(&json!(1)));
        assert_eq!(cache.fresh(&path, t1), Some(&json!(1)));
    }
}

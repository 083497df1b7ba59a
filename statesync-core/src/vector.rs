//! Per-writer version vectors.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::WriterId;

/// Causal relation between two vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrdering {
    Equal,
    /// Left is causally after right.
    Dominates,
    /// Left is causally before right.
    DominatedBy,
    Concurrent,
}

/// Mapping of writer to a monotonically increasing counter. Missing writers
/// count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(BTreeMap<WriterId, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, writer: &WriterId) -> u64 {
        self.0.get(writer).copied().unwrap_or(0)
    }

    /// Bump `writer`'s counter and return the new value.
    pub fn increment(&mut self, writer: &WriterId) -> u64 {
        let counter = self.0.entry(writer.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &VersionVector) {
        for (writer, &count) in &other.0 {
            let entry = self.0.entry(writer.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    pub fn merged(&self, other: &VersionVector) -> VersionVector {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn compare(&self, other: &VersionVector) -> VectorOrdering {
        let mut greater = false;
        let mut less = false;
        for writer in self.0.keys().chain(other.0.keys()) {
            match self.get(writer).cmp(&other.get(writer)) {
                Ordering::Greater => greater = true,
                Ordering::Less => less = true,
                Ordering::Equal => {}
            }
            if greater && less {
                return VectorOrdering::Concurrent;
            }
        }
        match (greater, less) {
            (false, false) => VectorOrdering::Equal,
            (true, false) => VectorOrdering::Dominates,
            (false, true) => VectorOrdering::DominatedBy,
            (true, true) => VectorOrdering::Concurrent,
        }
    }

    /// `self >= other` everywhere and `>` somewhere.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        self.compare(other) == VectorOrdering::Dominates
    }

    /// Neither vector dominates the other.
    ///
    /// Equal vectors are not concurrent.
    pub fn concurrent_with(&self, other: &VersionVector) -> bool {
        self.compare(other) == VectorOrdering::Concurrent
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&WriterId, u64)> {
        self.0.iter().map(|(w, c)| (w, *c))
    }
}

impl<W: Into<WriterId>> FromIterator<(W, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (W, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(w, c)| (w.into(), c)).collect())
    }
}

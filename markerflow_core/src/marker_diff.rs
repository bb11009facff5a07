//! The "DIFF" stage - minimal insert/update/delete batches between snapshots.
//!
//! A batch is derived from exactly two snapshots (old, new):
//! 1. Key partition: inserted / deleted / retained
//! 2. Change detection over the retained keys: updated
//!
//! Keys that are retained but not updated keep their rendered handle.

use std::collections::HashSet;
use std::sync::Arc;

use crate::marker::{Marker, MarkerKey, Snapshot};

/// Predicate returning `true` when `new` must be redrawn in place of `old`.
pub type ChangePredicate = Arc<dyn Fn(&Marker, &Marker) -> bool + Send + Sync>;

/// Decides which retained markers count as "updated".
#[derive(Clone, Default)]
pub enum ChangeDetector {
    /// Changed iff the two values are distinct `Arc`s with different timestamps
    #[default]
    Timestamp,
    /// Caller-supplied predicate, called as `predicate(old, new)`
    Custom(ChangePredicate),
}

impl ChangeDetector {
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&Marker, &Marker) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    pub fn has_changed(&self, old: &Arc<Marker>, new: &Arc<Marker>) -> bool {
        match self {
            Self::Timestamp => !Arc::ptr_eq(old, new) && old.timestamp != new.timestamp,
            Self::Custom(predicate) => predicate(old, new),
        }
    }
}

impl std::fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timestamp => f.write_str("Timestamp"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Key-level partition of two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyPartition {
    pub inserted: Vec<MarkerKey>,
    pub deleted: Vec<MarkerKey>,
    pub retained: Vec<MarkerKey>,
}

/// Splits `keys(old) ∪ keys(new)` into inserted, deleted and retained keys.
pub fn diff(old: &Snapshot, new: &Snapshot) -> KeyPartition {
    let mut partition = KeyPartition::default();

    for key in new.keys() {
        if old.contains_key(key) {
            partition.retained.push(key.clone());
        } else {
            partition.inserted.push(key.clone());
        }
    }
    partition.deleted = old
        .keys()
        .filter(|key| !new.contains_key(key))
        .cloned()
        .collect();

    partition.inserted.sort();
    partition.deleted.sort();
    partition
}

/// Returns the retained keys whose marker must be redrawn.
pub fn changed(
    old: &Snapshot,
    new: &Snapshot,
    retained: &[MarkerKey],
    detector: &ChangeDetector,
) -> Vec<MarkerKey> {
    let mut updated: Vec<MarkerKey> = retained
        .iter()
        .filter(|key| match (old.get(key), new.get(key)) {
            (Some(o), Some(n)) => detector.has_changed(o, n),
            _ => false,
        })
        .cloned()
        .collect();
    updated.sort();
    updated
}

/// An insert/update/delete batch between two snapshots.
///
/// The three key sets are pairwise disjoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    pub inserted: Vec<MarkerKey>,
    pub deleted: Vec<MarkerKey>,
    pub updated: Vec<MarkerKey>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty() && self.updated.is_empty()
    }

    /// Number of handle operations applying this diff issues.
    ///
    /// Updates cost a removal plus a creation.
    pub fn op_count(&self) -> usize {
        self.inserted.len() + self.deleted.len() + 2 * self.updated.len()
    }

    /// Keys that need a fresh handle.
    pub fn creations(&self) -> impl Iterator<Item = &MarkerKey> {
        self.inserted.iter().chain(self.updated.iter())
    }

    /// Keys whose current handle must go.
    pub fn removals(&self) -> impl Iterator<Item = &MarkerKey> {
        self.updated.iter().chain(self.deleted.iter())
    }

    /// Every key touched by the batch.
    pub fn touched(&self) -> HashSet<&MarkerKey> {
        self.inserted
            .iter()
            .chain(self.deleted.iter())
            .chain(self.updated.iter())
            .collect()
    }
}

/// Computes the full batch from `old` to `new`.
pub fn create_batch(old: &Snapshot, new: &Snapshot, detector: &ChangeDetector) -> SnapshotDiff {
    let partition = diff(old, new);
    let updated = changed(old, new, &partition.retained, detector);
    SnapshotDiff {
        inserted: partition.inserted,
        deleted: partition.deleted,
        updated,
    }
}

//! Markers and snapshots - the values flowing through the pipeline.

use markerflow_env::{Floor, LatLng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Stable, externally assigned marker key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerKey(pub String);

impl MarkerKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MarkerKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MarkerKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for MarkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a marker stands for on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarkerKind {
    /// A caller-supplied point of interest
    #[default]
    Point,
    /// A synthesized cluster standing in for `member_count` points
    Cluster { member_count: u32 },
}

/// A single marker. Immutable once placed in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub key: MarkerKey,
    pub floor: Floor,
    pub position: LatLng,
    /// Unix milliseconds of the last change
    pub timestamp: i64,
    pub kind: MarkerKind,
}

impl Marker {
    /// Creates a point marker.
    pub fn new(key: impl Into<MarkerKey>, floor: Floor, position: LatLng, timestamp: i64) -> Self {
        Self {
            key: key.into(),
            floor,
            position,
            timestamp,
            kind: MarkerKind::Point,
        }
    }

    /// Creates a cluster marker standing in for `member_count` points.
    pub fn cluster(
        key: impl Into<MarkerKey>,
        floor: Floor,
        position: LatLng,
        member_count: u32,
        timestamp: i64,
    ) -> Self {
        Self {
            key: key.into(),
            floor,
            position,
            timestamp,
            kind: MarkerKind::Cluster { member_count },
        }
    }

    /// Number of caller markers this marker represents.
    pub fn member_count(&self) -> u32 {
        match self.kind {
            MarkerKind::Point => 1,
            MarkerKind::Cluster { member_count } => member_count,
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self.kind, MarkerKind::Cluster { .. })
    }
}

/// All markers that should currently be rendered, by key.
///
/// Values are shared `Arc<Marker>`s: re-using the same `Arc` across
/// snapshots signals "unchanged" to the default change detector.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    markers: HashMap<MarkerKey, Arc<Marker>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a marker under its own key. Duplicate keys are last-write-wins.
    pub fn insert(&mut self, marker: impl Into<Arc<Marker>>) -> Option<Arc<Marker>> {
        let marker = marker.into();
        self.markers.insert(marker.key.clone(), marker)
    }

    pub fn remove(&mut self, key: &MarkerKey) -> Option<Arc<Marker>> {
        self.markers.remove(key)
    }

    pub fn get(&self, key: &MarkerKey) -> Option<&Arc<Marker>> {
        self.markers.get(key)
    }

    pub fn contains_key(&self, key: &MarkerKey) -> bool {
        self.markers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &MarkerKey> {
        self.markers.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MarkerKey, &Arc<Marker>)> {
        self.markers.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Arc<Marker>> {
        self.markers.values()
    }

    /// Markers on a single floor.
    pub fn on_floor(&self, floor: Floor) -> impl Iterator<Item = &Arc<Marker>> {
        self.markers.values().filter(move |m| m.floor == floor)
    }

    /// Restricts the snapshot to one floor.
    pub fn floor_subset(&self, floor: Floor) -> Snapshot {
        self.on_floor(floor).cloned().collect()
    }

    /// Adds every marker of `other`, overwriting equal keys.
    pub fn extend(&mut self, other: &Snapshot) {
        for marker in other.values() {
            self.insert(Arc::clone(marker));
        }
    }
}

impl FromIterator<Marker> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Marker>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for marker in iter {
            snapshot.insert(marker);
        }
        snapshot
    }
}

impl FromIterator<Arc<Marker>> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Arc<Marker>>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for marker in iter {
            snapshot.insert(marker);
        }
        snapshot
    }
}

//! Cluster materialization: turning a floor index query into a displayable
//! snapshot.
//!
//! Cluster identity is derived from shape, never from a counter:
//!
//! ```text
//! cluster:{floor}:{member_count}:{lat bits}:{lng bits}
//! ```
//!
//! Re-querying an unchanged index yields the same keys, and the previous
//! materialization's `Arc<Marker>` is re-used so the handle manager sees the
//! cluster as unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use markerflow_env::{BBox, Floor, LatLng};
use tracing::warn;

use crate::floor_index::{ClusterItem, FloorIndex};
use crate::marker::{Marker, MarkerKey, Snapshot};

/// Key of a synthesized cluster marker.
pub fn cluster_key(floor: Floor, member_count: u32, position: LatLng) -> MarkerKey {
    let (lat, lng) = position.bits();
    MarkerKey(format!("cluster:{floor}:{member_count}:{lat:016x}:{lng:016x}"))
}

type CoordKey = (Floor, u64, u64);

fn coord_key(floor: Floor, position: LatLng) -> CoordKey {
    let (lat, lng) = position.bits();
    (floor, lat, lng)
}

/// Reverse lookup from an exact coordinate to the markers placed there.
///
/// Markers sharing a coordinate are kept in key order.
#[derive(Debug, Default)]
pub struct CoordinateIndex {
    entries: HashMap<CoordKey, Vec<Arc<Marker>>>,
}

impl CoordinateIndex {
    pub fn build(snapshot: &Snapshot) -> Self {
        let mut entries: HashMap<CoordKey, Vec<Arc<Marker>>> = HashMap::new();
        for marker in snapshot.values() {
            entries
                .entry(coord_key(marker.floor, marker.position))
                .or_default()
                .push(Arc::clone(marker));
        }
        for markers in entries.values_mut() {
            markers.sort_by(|a, b| a.key.cmp(&b.key));
        }
        Self { entries }
    }

    pub fn lookup(&self, floor: Floor, position: LatLng) -> &[Arc<Marker>] {
        self.entries
            .get(&coord_key(floor, position))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A fresh cursor for one materialization pass.
    pub fn cursor(&self) -> CoordinateCursor<'_> {
        CoordinateCursor {
            index: self,
            taken: HashMap::new(),
        }
    }
}

/// Hands out each marker of a shared coordinate at most once.
pub struct CoordinateCursor<'a> {
    index: &'a CoordinateIndex,
    taken: HashMap<CoordKey, usize>,
}

impl<'a> CoordinateCursor<'a> {
    pub fn take(&mut self, floor: Floor, position: LatLng) -> Option<&'a Arc<Marker>> {
        let key = coord_key(floor, position);
        let markers = self.index.entries.get(&key)?;
        let next = self.taken.entry(key).or_insert(0);
        let marker = markers.get(*next)?;
        *next += 1;
        Some(marker)
    }
}

/// Materializes one floor's clusters inside `viewport` at `zoom`.
///
/// `previous` is the floor's last materialization; clusters whose key is
/// found there are re-used as the same `Arc`.
pub fn materialize(
    index: &FloorIndex,
    coords: &CoordinateIndex,
    previous: &Snapshot,
    viewport: &BBox,
    zoom: f64,
    now_ms: i64,
) -> Snapshot {
    let floor = index.floor();
    let mut cursor = coords.cursor();
    let mut out = Snapshot::new();

    for item in index.get_clusters(viewport, zoom) {
        match item {
            ClusterItem::Cluster {
                member_count,
                position,
                ..
            } => {
                let key = cluster_key(floor, member_count, position);
                let marker = match previous.get(&key) {
                    Some(existing) => Arc::clone(existing),
                    None => Arc::new(Marker::cluster(key, floor, position, member_count, now_ms)),
                };
                out.insert(marker);
            }
            ClusterItem::Leaf { position } => {
                let resolved = cursor.take(floor, position);
                debug_assert!(
                    resolved.is_some(),
                    "unresolved leaf at ({}, {}) on floor {}",
                    position.lat,
                    position.lng,
                    floor
                );
                match resolved {
                    Some(marker) => {
                        out.insert(Arc::clone(marker));
                    }
                    None => warn!(
                        "Skipping unresolved leaf at ({}, {}) on floor {}",
                        position.lat, position.lng, floor
                    ),
                }
            }
        }
    }
    out
}

/// The unclustered markers shown above the top zoom band.
///
/// `None` means no floor is active and every floor is shown.
pub fn unclustered(snapshot: &Snapshot, floor: Option<Floor>) -> Snapshot {
    match floor {
        Some(floor) => snapshot.floor_subset(floor),
        None => snapshot.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::floor_index::IndexOptions;
    use approx::assert_relative_eq;

    fn snapshot(points: &[(&str, Floor, f64, f64)]) -> Snapshot {
        points
            .iter()
            .map(|(k, f, lat, lng)| Marker::new(*k, *f, LatLng::new(*lat, *lng), 0))
            .collect()
    }

    fn index_for(snapshot: &Snapshot, floor: Floor) -> FloorIndex {
        let markers: Vec<_> = snapshot.on_floor(floor).cloned().collect();
        FloorIndex::build(floor, &markers, &IndexOptions::default())
    }

    #[test]
    fn test_cluster_key_is_shape_derived() {
        let p = LatLng::new(1.5, -2.25);
        assert_eq!(cluster_key(1, 3, p), cluster_key(1, 3, p));
        assert_ne!(cluster_key(1, 3, p), cluster_key(1, 4, p));
        assert_ne!(cluster_key(1, 3, p), cluster_key(2, 3, p));
        assert!(cluster_key(1, 3, p).as_str().starts_with("cluster:1:3:"));
    }

    #[test]
    fn test_coordinate_ties_resolve_in_key_order() {
        let snap = snapshot(&[("zeta", 1, 5.0, 5.0), ("alpha", 1, 5.0, 5.0), ("mid", 1, 5.0, 5.0)]);
        let coords = CoordinateIndex::build(&snap);
        let mut cursor = coords.cursor();
        let p = LatLng::new(5.0, 5.0);

        let order: Vec<String> = std::iter::from_fn(|| cursor.take(1, p))
            .map(|m| m.key.to_string())
            .collect();
        assert_eq!(order, vec!["alpha", "mid", "zeta"]);
        assert!(coords.cursor().take(2, p).is_none());
    }

    #[test]
    fn test_nearby_markers_merge_then_split_back_to_originals() {
        let snap = snapshot(&[("a", 1, 0.0, 0.0), ("b", 1, 0.0, 0.0001)]);
        let index = index_for(&snap, 1);
        let coords = CoordinateIndex::build(&snap);

        let merged = materialize(&index, &coords, &Snapshot::new(), &BBox::world(), 10.0, 42);
        assert_eq!(merged.len(), 1);
        let cluster = merged.values().next().unwrap();
        assert_eq!(cluster.member_count(), 2);
        assert_eq!(cluster.floor, 1);
        assert_eq!(cluster.timestamp, 42);
        assert_relative_eq!(cluster.position.lng, 0.00005, epsilon = 1e-9);

        let split = materialize(&index, &coords, &merged, &BBox::world(), 21.0, 43);
        assert_eq!(split.len(), 2);
        for key in ["a", "b"] {
            let key = MarkerKey::from(key);
            assert!(Arc::ptr_eq(split.get(&key).unwrap(), snap.get(&key).unwrap()));
        }
    }

    #[test]
    fn test_rematerialization_reuses_cluster_identity() {
        let snap = snapshot(&[
            ("a", 1, 0.0, 0.0),
            ("b", 1, 0.0, 0.0001),
            ("c", 1, 0.0001, 0.0),
            ("d", 1, 40.0, 40.0),
        ]);
        let index = index_for(&snap, 1);
        let coords = CoordinateIndex::build(&snap);

        let first = materialize(&index, &coords, &Snapshot::new(), &BBox::world(), 8.0, 1);
        let second = materialize(&index, &coords, &first, &BBox::world(), 8.5, 2);

        assert_eq!(first.len(), second.len());
        for (key, marker) in first.iter() {
            assert!(Arc::ptr_eq(marker, second.get(key).unwrap()));
        }
    }

    #[test]
    fn test_stacked_markers_all_resolve_at_max_zoom() {
        let snap = snapshot(&[("m", 1, 3.0, 3.0), ("z", 1, 3.0, 3.0)]);
        let index = index_for(&snap, 1);
        let coords = CoordinateIndex::build(&snap);

        let out = materialize(&index, &coords, &Snapshot::new(), &BBox::world(), 21.0, 0);
        let mut keys: Vec<_> = out.keys().map(|k| k.to_string()).collect();
        keys.sort();
        assert_eq!(keys, vec!["m", "z"]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unresolved leaf")]
    fn test_stale_coordinate_index_fails_loudly() {
        let snap = snapshot(&[("a", 1, 10.0, 10.0)]);
        let index = index_for(&snap, 1);
        let stale = CoordinateIndex::build(&snapshot(&[("a", 1, 11.0, 11.0)]));
        materialize(&index, &stale, &Snapshot::new(), &BBox::world(), 21.0, 0);
    }

    #[test]
    fn test_unclustered_filters_by_active_floor() {
        let snap = snapshot(&[("a", 1, 0.0, 0.0), ("b", 2, 0.0, 0.0)]);
        assert_eq!(unclustered(&snap, Some(1)).len(), 1);
        assert_eq!(unclustered(&snap, None).len(), 2);
        assert!(unclustered(&snap, Some(9)).is_empty());
    }
}

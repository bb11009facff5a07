//! The "CLUSTER" Engine - per-floor hierarchical point clustering.
//!
//! Each floor gets its own immutable index built from that floor's markers:
//! - Points are projected to unit Web Mercator `[0, 1]²`
//! - One R-tree per integer zoom, from `max_zoom + 1` (raw points) down to
//!   `min_zoom`, each level greedily merging the level above within
//!   `radius / (extent · 2^zoom)`
//! - Cluster positions are member-weighted means, so an unchanged input set
//!   always yields the same representative coordinates
//!
//! Floors are rebuilt only when their markers were added, removed or moved.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::f64::consts::PI;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use markerflow_env::{BBox, Floor, LatLng};
use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};
use serde::{Deserialize, Serialize};

use crate::marker::{Marker, Snapshot};
use crate::marker_diff::diff;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Clustering parameters shared by every floor index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Cluster radius in pixels (default: 40)
    pub radius: f64,

    /// Tile extent the radius is relative to (default: 512)
    pub extent: f64,

    /// Minimum points to form a cluster (default: 2)
    pub min_points: u32,

    /// Lowest zoom with its own level (default: 0)
    pub min_zoom: u8,

    /// Highest zoom at which points still merge (default: 20)
    pub max_zoom: u8,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            radius: 40.0,
            extent: 512.0,
            min_points: 2,
            min_zoom: 0,
            max_zoom: 20,
        }
    }
}

// ============================================================================
// PROJECTION
// ============================================================================

fn lng_x(lng: f64) -> f64 {
    lng / 360.0 + 0.5
}

fn lat_y(lat: f64) -> f64 {
    let sin = (lat * PI / 180.0).sin();
    let y = 0.5 - 0.25 * ((1.0 + sin) / (1.0 - sin)).ln() / PI;
    y.clamp(0.0, 1.0)
}

fn x_lng(x: f64) -> f64 {
    (x - 0.5) * 360.0
}

fn y_lat(y: f64) -> f64 {
    let y2 = (180.0 - y * 360.0) * PI / 180.0;
    360.0 * y2.exp().atan() / PI - 90.0
}

// ============================================================================
// INDEX
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum NodeKind {
    Point { source: usize },
    Cluster { id: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Node {
    x: f64,
    y: f64,
    num_points: u32,
    /// Zoom at which this node was merged or passed through
    claimed: Option<u8>,
    kind: NodeKind,
}

impl Node {
    fn unclaimed_at(&self, zoom: u8) -> bool {
        self.claimed.map_or(true, |z| z > zoom)
    }
}

type Entry = GeomWithData<[f64; 2], usize>;

#[derive(Debug)]
struct Level {
    nodes: Vec<Node>,
    tree: RTree<Entry>,
}

impl Level {
    fn new(nodes: Vec<Node>) -> Self {
        let entries = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| GeomWithData::new([n.x, n.y], i))
            .collect();
        Self {
            nodes,
            tree: RTree::bulk_load(entries),
        }
    }

    fn empty() -> Self {
        Self::new(Vec::new())
    }
}

/// One item returned by a viewport query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClusterItem {
    /// Several points merged into one
    Cluster {
        id: u64,
        member_count: u32,
        position: LatLng,
    },
    /// A single point at its exact input coordinate
    Leaf { position: LatLng },
}

/// Immutable clustering index over one floor's markers.
#[derive(Debug)]
pub struct FloorIndex {
    floor: Floor,
    options: IndexOptions,
    points: Vec<LatLng>,
    /// `levels[z]` holds the clustering at integer zoom `z`
    levels: Vec<Level>,
    fingerprint: u64,
}

impl FloorIndex {
    /// Builds the index for `floor` from its markers.
    pub fn build(floor: Floor, markers: &[Arc<Marker>], options: &IndexOptions) -> Self {
        let fingerprint = fingerprint(markers.iter());
        let points: Vec<LatLng> = markers.iter().map(|m| m.position).collect();
        let min_zoom = options.min_zoom.min(options.max_zoom);

        let raw: Vec<Node> = points
            .iter()
            .enumerate()
            .map(|(i, p)| Node {
                x: lng_x(p.lng),
                y: lat_y(p.lat),
                num_points: 1,
                claimed: None,
                kind: NodeKind::Point { source: i },
            })
            .collect();

        let mut descending = Vec::with_capacity(options.max_zoom as usize + 2);
        let mut current = Level::new(raw);
        for zoom in (min_zoom..=options.max_zoom).rev() {
            let next = cluster_level(&mut current, zoom, options);
            descending.push(current);
            current = Level::new(next);
        }
        descending.push(current);

        let mut levels: Vec<Level> = (0..min_zoom).map(|_| Level::empty()).collect();
        levels.extend(descending.into_iter().rev());

        Self {
            floor,
            options: options.clone(),
            points,
            levels,
            fingerprint,
        }
    }

    pub fn floor(&self) -> Floor {
        self.floor
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    fn limit_zoom(&self, zoom: f64) -> usize {
        let z = if zoom.is_finite() { zoom.floor() } else { 0.0 };
        let max = self.options.max_zoom as f64 + 1.0;
        z.min(max).max(self.options.min_zoom as f64) as usize
    }

    /// Clusters and leaves inside `bbox` at `zoom`.
    pub fn get_clusters(&self, bbox: &BBox, zoom: f64) -> Vec<ClusterItem> {
        let mut min_lng = ((bbox.west + 180.0) % 360.0 + 360.0) % 360.0 - 180.0;
        let min_lat = bbox.south.clamp(-90.0, 90.0);
        let mut max_lng = if bbox.east == 180.0 {
            180.0
        } else {
            ((bbox.east + 180.0) % 360.0 + 360.0) % 360.0 - 180.0
        };
        let max_lat = bbox.north.clamp(-90.0, 90.0);

        if bbox.east - bbox.west >= 360.0 {
            min_lng = -180.0;
            max_lng = 180.0;
        } else if min_lng > max_lng {
            let mut eastern = self.get_clusters(&BBox::new(min_lng, min_lat, 180.0, max_lat), zoom);
            let western = self.get_clusters(&BBox::new(-180.0, min_lat, max_lng, max_lat), zoom);
            eastern.extend(western);
            return eastern;
        }

        let Some(level) = self.levels.get(self.limit_zoom(zoom)) else {
            return Vec::new();
        };
        let envelope = AABB::from_corners(
            [lng_x(min_lng), lat_y(max_lat)],
            [lng_x(max_lng), lat_y(min_lat)],
        );

        let mut items: Vec<(usize, ClusterItem)> = level
            .tree
            .locate_in_envelope(&envelope)
            .map(|entry| {
                let node = &level.nodes[entry.data];
                let item = match node.kind {
                    NodeKind::Cluster { id } => ClusterItem::Cluster {
                        id,
                        member_count: node.num_points,
                        position: LatLng::new(y_lat(node.y), x_lng(node.x)),
                    },
                    NodeKind::Point { source } => ClusterItem::Leaf {
                        position: self.points[source],
                    },
                };
                (entry.data, item)
            })
            .collect();
        items.sort_by_key(|(i, _)| *i);
        items.into_iter().map(|(_, item)| item).collect()
    }
}

/// Greedy single pass merging `level` into the level below at `zoom`.
fn cluster_level(level: &mut Level, zoom: u8, options: &IndexOptions) -> Vec<Node> {
    let r = options.radius / (options.extent * 2f64.powi(zoom as i32));
    let mut out = Vec::new();

    for i in 0..level.nodes.len() {
        if !level.nodes[i].unclaimed_at(zoom) {
            continue;
        }
        level.nodes[i].claimed = Some(zoom);
        let p = level.nodes[i];

        let neighbors: Vec<usize> = level
            .tree
            .locate_within_distance([p.x, p.y], r * r)
            .map(|entry| entry.data)
            .filter(|&n| n != i)
            .collect();

        let origin = p.num_points;
        let num_points = neighbors
            .iter()
            .filter(|&&n| level.nodes[n].unclaimed_at(zoom))
            .fold(origin, |acc, &n| acc + level.nodes[n].num_points);

        if num_points > origin && num_points >= options.min_points {
            let mut wx = p.x * origin as f64;
            let mut wy = p.y * origin as f64;
            for &n in &neighbors {
                let b = &mut level.nodes[n];
                if !b.unclaimed_at(zoom) {
                    continue;
                }
                b.claimed = Some(zoom);
                wx += b.x * b.num_points as f64;
                wy += b.y * b.num_points as f64;
            }
            out.push(Node {
                x: wx / num_points as f64,
                y: wy / num_points as f64,
                num_points,
                claimed: None,
                kind: NodeKind::Cluster {
                    id: ((i as u64) << 5) + zoom as u64 + 1,
                },
            });
        } else {
            out.push(p);
            if num_points > 1 {
                for &n in &neighbors {
                    let b = &mut level.nodes[n];
                    if !b.unclaimed_at(zoom) {
                        continue;
                    }
                    b.claimed = Some(zoom);
                    out.push(*b);
                }
            }
        }
    }
    out
}

/// Order-independent fingerprint over `(key, lat, lng)` of a marker set.
pub fn fingerprint<'a>(markers: impl Iterator<Item = &'a Arc<Marker>>) -> u64 {
    let mut rows: Vec<(&str, (u64, u64))> = markers
        .map(|m| (m.key.as_str(), m.position.bits()))
        .collect();
    rows.sort_unstable();
    let mut hasher = DefaultHasher::new();
    rows.hash(&mut hasher);
    hasher.finish()
}

/// Floors whose markers were added, removed or moved between two snapshots.
pub fn floors_to_rebuild(old: &Snapshot, new: &Snapshot) -> BTreeSet<Floor> {
    let partition = diff(old, new);
    let mut floors = BTreeSet::new();

    for key in &partition.inserted {
        if let Some(m) = new.get(key) {
            floors.insert(m.floor);
        }
    }
    for key in &partition.deleted {
        if let Some(m) = old.get(key) {
            floors.insert(m.floor);
        }
    }
    for key in &partition.retained {
        if let (Some(o), Some(n)) = (old.get(key), new.get(key)) {
            if o.position.bits() != n.position.bits() || o.floor != n.floor {
                floors.insert(o.floor);
                floors.insert(n.floor);
            }
        }
    }
    floors
}

// ============================================================================
// PER-FLOOR TABLE AND REBUILD QUEUE
// ============================================================================

/// Current index of every floor.
#[derive(Debug, Default)]
pub struct FloorIndexTable {
    indexes: HashMap<Floor, Arc<FloorIndex>>,
}

impl FloorIndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, floor: Floor) -> Option<&Arc<FloorIndex>> {
        self.indexes.get(&floor)
    }

    /// Whether the stored index was built from a different marker set.
    pub fn is_stale(&self, floor: Floor, fingerprint: u64) -> bool {
        self.indexes
            .get(&floor)
            .map_or(true, |index| index.fingerprint() != fingerprint)
    }

    /// Replaces the floor's index wholesale.
    pub fn replace(&mut self, index: FloorIndex) -> Arc<FloorIndex> {
        let index = Arc::new(index);
        self.indexes.insert(index.floor(), Arc::clone(&index));
        index
    }

    pub fn remove(&mut self, floor: Floor) -> Option<Arc<FloorIndex>> {
        self.indexes.remove(&floor)
    }

    pub fn floors(&self) -> BTreeSet<Floor> {
        self.indexes.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.indexes.clear();
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

/// Floors waiting for a rebuild, with the marker set to build from.
#[derive(Debug, Default)]
pub struct RebuildQueue {
    pending: BTreeMap<Floor, Vec<Arc<Marker>>>,
}

impl RebuildQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `floor`, replacing any older pending marker set for it.
    pub fn push(&mut self, floor: Floor, markers: Vec<Arc<Marker>>) {
        self.pending.insert(floor, markers);
    }

    /// Takes the active floor if pending, otherwise the lowest pending floor.
    pub fn pop_next(&mut self, active: Option<Floor>) -> Option<(Floor, Vec<Arc<Marker>>)> {
        if let Some(floor) = active {
            if let Some(markers) = self.pending.remove(&floor) {
                return Some((floor, markers));
            }
        }
        self.pending.pop_first()
    }

    /// Drops a pending rebuild, e.g. when the floor reverted to its indexed state.
    pub fn cancel(&mut self, floor: Floor) -> bool {
        self.pending.remove(&floor).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn markers(points: &[(&str, f64, f64)]) -> Vec<Arc<Marker>> {
        points
            .iter()
            .map(|(k, lat, lng)| Arc::new(Marker::new(*k, 1, LatLng::new(*lat, *lng), 0)))
            .collect()
    }

    #[test]
    fn test_projection_round_trip() {
        for (lat, lng) in [(0.0, 0.0), (59.91, 10.75), (-33.86, 151.2)] {
            assert_relative_eq!(y_lat(lat_y(lat)), lat, epsilon = 1e-9);
            assert_relative_eq!(x_lng(lng_x(lng)), lng, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_close_points_merge_at_low_zoom_and_split_at_high_zoom() {
        let index = FloorIndex::build(
            1,
            &markers(&[("a", 0.0, 0.0), ("b", 0.0, 0.0001)]),
            &IndexOptions::default(),
        );

        let low = index.get_clusters(&BBox::world(), 10.0);
        assert_eq!(low.len(), 1);
        match low[0] {
            ClusterItem::Cluster { member_count, position, .. } => {
                assert_eq!(member_count, 2);
                assert_relative_eq!(position.lng, 0.00005, epsilon = 1e-9);
            }
            other => panic!("expected cluster, got {:?}", other),
        }

        let high = index.get_clusters(&BBox::world(), 21.0);
        assert_eq!(high.len(), 2);
        assert!(high.contains(&ClusterItem::Leaf { position: LatLng::new(0.0, 0.0) }));
        assert!(high.contains(&ClusterItem::Leaf { position: LatLng::new(0.0, 0.0001) }));
    }

    #[test]
    fn test_distant_points_stay_apart() {
        let index = FloorIndex::build(
            1,
            &markers(&[("a", 10.0, 10.0), ("b", -10.0, -10.0)]),
            &IndexOptions::default(),
        );
        let items = index.get_clusters(&BBox::world(), 5.0);
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| matches!(i, ClusterItem::Leaf { .. })));
    }

    #[test]
    fn test_viewport_filters_items() {
        let index = FloorIndex::build(
            1,
            &markers(&[("a", 10.0, 10.0), ("b", -10.0, -10.0)]),
            &IndexOptions::default(),
        );
        let items = index.get_clusters(&BBox::new(0.0, 0.0, 20.0, 20.0), 5.0);
        assert_eq!(items, vec![ClusterItem::Leaf { position: LatLng::new(10.0, 10.0) }]);
    }

    #[test]
    fn test_antimeridian_viewport() {
        let index = FloorIndex::build(
            1,
            &markers(&[("east", 0.0, 179.0), ("west", 0.0, -179.0), ("mid", 0.0, 0.0)]),
            &IndexOptions::default(),
        );
        let items = index.get_clusters(&BBox::new(170.0, -10.0, -170.0, 10.0), 8.0);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let ms = markers(&[("a", 1.0, 1.0), ("b", 1.0001, 1.0), ("c", 1.0, 1.0001), ("d", 5.0, 5.0)]);
        let one = FloorIndex::build(1, &ms, &IndexOptions::default());
        let two = FloorIndex::build(1, &ms, &IndexOptions::default());
        for zoom in [3.0, 12.0, 17.0] {
            assert_eq!(
                one.get_clusters(&BBox::world(), zoom),
                two.get_clusters(&BBox::world(), zoom)
            );
        }
        assert_eq!(one.fingerprint(), two.fingerprint());
    }

    #[test]
    fn test_fingerprint_ignores_order_but_not_position() {
        let ms = markers(&[("a", 1.0, 1.0), ("b", 2.0, 2.0)]);
        let reversed: Vec<_> = ms.iter().rev().cloned().collect();
        assert_eq!(fingerprint(ms.iter()), fingerprint(reversed.iter()));

        let moved = markers(&[("a", 1.0, 1.5), ("b", 2.0, 2.0)]);
        assert_ne!(fingerprint(ms.iter()), fingerprint(moved.iter()));
    }

    #[test]
    fn test_floors_to_rebuild() {
        let old: Snapshot = vec![
            Marker::new("a", 1, LatLng::new(0.0, 0.0), 0),
            Marker::new("b", 2, LatLng::new(0.0, 0.0), 0),
            Marker::new("c", 3, LatLng::new(0.0, 0.0), 0),
            Marker::new("d", 4, LatLng::new(0.0, 0.0), 0),
        ]
        .into_iter()
        .collect();
        let new: Snapshot = vec![
            // a: timestamp-only change, no rebuild
            Marker::new("a", 1, LatLng::new(0.0, 0.0), 9),
            // b: moved
            Marker::new("b", 2, LatLng::new(1.0, 0.0), 0),
            // c: deleted, e: inserted
            Marker::new("d", 4, LatLng::new(0.0, 0.0), 0),
            Marker::new("e", 5, LatLng::new(0.0, 0.0), 0),
        ]
        .into_iter()
        .collect();

        let floors: Vec<Floor> = floors_to_rebuild(&old, &new).into_iter().collect();
        assert_eq!(floors, vec![2, 3, 5]);
    }

    #[test]
    fn test_rebuild_queue_prefers_active_floor() {
        let mut queue = RebuildQueue::new();
        queue.push(1, Vec::new());
        queue.push(3, Vec::new());
        queue.push(2, Vec::new());

        assert_eq!(queue.pop_next(Some(3)).map(|(f, _)| f), Some(3));
        assert_eq!(queue.pop_next(Some(3)).map(|(f, _)| f), Some(1));
        assert_eq!(queue.pop_next(None).map(|(f, _)| f), Some(2));
        assert!(queue.pop_next(None).is_none());
    }

    #[test]
    fn test_table_staleness() {
        let mut table = FloorIndexTable::new();
        let ms = markers(&[("a", 1.0, 1.0)]);
        let fp = fingerprint(ms.iter());
        assert!(table.is_stale(1, fp));
        table.replace(FloorIndex::build(1, &ms, &IndexOptions::default()));
        assert!(!table.is_stale(1, fp));
        assert!(table.is_stale(1, fp ^ 1));
    }
}

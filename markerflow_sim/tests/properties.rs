//! Property tests for diffing, clustering and end-to-end convergence.

use markerflow_core::cluster::{materialize, CoordinateIndex};
use markerflow_core::{
    create_batch, diff, ChangeDetector, FloorIndex, IndexOptions, LayerConfig, Marker, MarkerKey,
    MarkerLayer, Snapshot,
};
use markerflow_env::{BBox, LatLng};
use markerflow_sim::{SimContext, SimEngine, SimEngineConfig};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Marker index -> (floor, timestamp)
fn arb_marker_map() -> impl Strategy<Value = BTreeMap<u8, (i32, i64)>> {
    prop::collection::btree_map(0u8..24, (0i32..3, 0i64..3), 0..16)
}

fn snapshot_from(map: &BTreeMap<u8, (i32, i64)>) -> Snapshot {
    map.iter()
        .map(|(i, (floor, ts))| {
            let lat = 59.0 + f64::from(*i) * 0.001;
            Marker::new(format!("k{:02}", i), *floor, LatLng::new(lat, 10.0), *ts)
        })
        .collect()
}

fn keys(snapshot: &Snapshot) -> BTreeSet<MarkerKey> {
    snapshot.keys().cloned().collect()
}

/// Points on a coarse grid so some of them stack.
fn arb_points() -> impl Strategy<Value = Vec<(u8, u8)>> {
    prop::collection::vec((0u8..12, 0u8..12), 1..60)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn partition_matches_set_algebra(a in arb_marker_map(), b in arb_marker_map()) {
        let old = snapshot_from(&a);
        let new = snapshot_from(&b);
        let part = diff(&old, &new);

        let ka = keys(&old);
        let kb = keys(&new);
        let inserted: BTreeSet<_> = part.inserted.iter().cloned().collect();
        let deleted: BTreeSet<_> = part.deleted.iter().cloned().collect();
        let retained: BTreeSet<_> = part.retained.iter().cloned().collect();

        prop_assert_eq!(inserted, kb.difference(&ka).cloned().collect::<BTreeSet<_>>());
        prop_assert_eq!(deleted, ka.difference(&kb).cloned().collect::<BTreeSet<_>>());
        prop_assert_eq!(retained, ka.intersection(&kb).cloned().collect::<BTreeSet<_>>());
    }

    #[test]
    fn applying_batch_reproduces_target(a in arb_marker_map(), b in arb_marker_map()) {
        let old = snapshot_from(&a);
        let new = snapshot_from(&b);
        let batch = create_batch(&old, &new, &ChangeDetector::default());

        let mut model: HashMap<MarkerKey, Arc<Marker>> =
            old.iter().map(|(k, m)| (k.clone(), Arc::clone(m))).collect();
        for key in batch.removals() {
            prop_assert!(model.remove(key).is_some());
        }
        for key in batch.creations() {
            let marker = new.get(key).cloned();
            prop_assert!(marker.is_some());
            if let Some(marker) = marker {
                prop_assert!(model.insert(key.clone(), marker).is_none());
            }
        }

        prop_assert_eq!(model.len(), new.len());
        for (key, marker) in new.iter() {
            let shown = model.get(key);
            prop_assert!(shown.is_some());
            if let Some(shown) = shown {
                prop_assert_eq!(shown.timestamp, marker.timestamp);
                prop_assert_eq!(shown.floor, marker.floor);
            }
        }
    }

    #[test]
    fn clusters_account_for_every_marker(points in arb_points(), zoom in 0.0f64..22.0) {
        let snapshot: Snapshot = points
            .iter()
            .enumerate()
            .map(|(i, (x, y))| {
                let pos = LatLng::new(48.0 + f64::from(*y) * 0.01, 2.0 + f64::from(*x) * 0.01);
                Marker::new(format!("p{:03}", i), 0, pos, 0)
            })
            .collect();
        let markers: Vec<Arc<Marker>> = snapshot.values().cloned().collect();
        let index = FloorIndex::build(0, &markers, &IndexOptions::default());
        let coords = CoordinateIndex::build(&snapshot);

        let out = materialize(&index, &coords, &Snapshot::new(), &BBox::world(), zoom, 0);
        let total: u64 = out.values().map(|m| u64::from(m.member_count())).sum();
        prop_assert_eq!(total, snapshot.len() as u64);

        for (key, marker) in out.iter() {
            if !marker.is_cluster() {
                let original = snapshot.get(key);
                prop_assert!(original.map_or(false, |o| Arc::ptr_eq(o, marker)));
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn layer_converges_to_last_snapshot(
        steps in prop::collection::vec(arb_marker_map(), 1..6),
        seed in any::<u64>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let (live_keys, expected, alive) = runtime.block_on(async {
            let ctx = SimContext::shared(seed);
            let engine = SimEngine::shared(SimEngineConfig::default().with_seed(seed));
            let ctl = engine.controller();
            let layer = MarkerLayer::builder(ctx, engine)
                .with_config(LayerConfig::default().with_max_batch_size(2))
                .spawn()
                .unwrap();

            let mut last = Snapshot::new();
            for map in &steps {
                last = snapshot_from(map);
                layer.reconcile(last.clone()).unwrap();
            }
            layer.settled().await;

            let live = layer.live();
            let live_keys: BTreeSet<MarkerKey> = live.keys().cloned().collect();
            let alive = ctl.alive_count();
            layer.dispose();
            layer.stopped().await;
            (live_keys, keys(&last), alive)
        });

        prop_assert_eq!(alive, expected.len());
        prop_assert_eq!(live_keys, expected);
    }
}

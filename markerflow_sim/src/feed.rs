//! Seeded marker feed - the "ground truth" the caller keeps re-submitting.
//!
//! The feed owns the caller-side marker set and mutates it between steps:
//! - Markers drift (new position, new timestamp)
//! - Markers are touched (same position, new timestamp)
//! - Markers disappear and new ones appear
//!
//! Unchanged markers keep their `Arc` across snapshots, exactly like a
//! caller that only replaces what changed.

use markerflow_core::{Marker, Snapshot};
use markerflow_env::{Floor, LatLng};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-step mutation rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Churn {
    /// Probability a marker moves (default: 0.05)
    pub move_rate: f64,

    /// Probability a marker only gets a new timestamp (default: 0.1)
    pub touch_rate: f64,

    /// Probability a marker is removed (default: 0.05)
    pub remove_rate: f64,

    /// New markers per step (default: 3)
    pub add_count: usize,
}

impl Default for Churn {
    fn default() -> Self {
        Self {
            move_rate: 0.05,
            touch_rate: 0.1,
            remove_rate: 0.05,
            add_count: 3,
        }
    }
}

impl Churn {
    /// No mutation at all.
    pub fn frozen() -> Self {
        Self {
            move_rate: 0.0,
            touch_rate: 0.0,
            remove_rate: 0.0,
            add_count: 0,
        }
    }
}

/// Deterministic marker generator.
pub struct MarkerFeed {
    rng: ChaCha8Rng,
    markers: BTreeMap<String, Arc<Marker>>,
    next_id: u64,
    time_ms: i64,
    floors: Vec<Floor>,
    center: LatLng,
    /// Standard deviation of marker placement around `center`, in degrees
    spread_deg: f64,
}

impl MarkerFeed {
    pub fn new(seed: u64, floors: Vec<Floor>) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            markers: BTreeMap::new(),
            next_id: 0,
            time_ms: 0,
            floors: if floors.is_empty() { vec![0] } else { floors },
            center: LatLng::new(59.9139, 10.7522),
            spread_deg: 0.01,
        }
    }

    fn jitter(&mut self, sigma: f64) -> f64 {
        Normal::new(0.0, sigma)
            .map(|n| n.sample(&mut self.rng))
            .unwrap_or(0.0)
    }

    fn random_floor(&mut self) -> Floor {
        let i = self.rng.gen_range(0..self.floors.len());
        self.floors[i]
    }

    fn random_position(&mut self, around: LatLng, sigma: f64) -> LatLng {
        let lat = around.lat + self.jitter(sigma);
        let lng = around.lng + self.jitter(sigma);
        LatLng::new(lat.clamp(-85.0, 85.0), lng.clamp(-180.0, 180.0))
    }

    fn next_key(&mut self) -> String {
        let key = format!("m-{:05}", self.next_id);
        self.next_id += 1;
        key
    }

    /// Adds `count` markers spread around the feed center on random floors.
    pub fn populate(&mut self, count: usize) {
        for _ in 0..count {
            let floor = self.random_floor();
            let position = self.random_position(self.center, self.spread_deg);
            self.insert(floor, position);
        }
    }

    /// Adds a tight group of `count` markers around `center` on `floor`.
    pub fn spawn_group(&mut self, floor: Floor, center: LatLng, count: usize, sigma_deg: f64) {
        for _ in 0..count {
            let position = self.random_position(center, sigma_deg);
            self.insert(floor, position);
        }
    }

    /// Inserts one marker and returns its key.
    pub fn insert(&mut self, floor: Floor, position: LatLng) -> String {
        let key = self.next_key();
        let marker = Marker::new(key.as_str(), floor, position, self.time_ms);
        self.markers.insert(key.clone(), Arc::new(marker));
        key
    }

    /// Inserts or replaces a marker under a caller-chosen key.
    pub fn put(&mut self, key: &str, floor: Floor, position: LatLng) {
        let marker = Marker::new(key, floor, position, self.time_ms);
        self.markers.insert(key.to_string(), Arc::new(marker));
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.markers.remove(key).is_some()
    }

    /// Advances the feed clock and applies one round of churn.
    pub fn step(&mut self, churn: &Churn) -> Snapshot {
        self.time_ms += 1000;
        let keys: Vec<String> = self.markers.keys().cloned().collect();

        for key in keys {
            let roll: f64 = self.rng.gen();
            let Some(current) = self.markers.get(&key).cloned() else {
                continue;
            };
            if roll < churn.remove_rate {
                self.markers.remove(&key);
            } else if roll < churn.remove_rate + churn.move_rate {
                let sigma = self.spread_deg / 10.0;
                let position = self.random_position(current.position, sigma);
                let moved = Marker::new(key.as_str(), current.floor, position, self.time_ms);
                self.markers.insert(key, Arc::new(moved));
            } else if roll < churn.remove_rate + churn.move_rate + churn.touch_rate {
                let touched = Marker::new(key.as_str(), current.floor, current.position, self.time_ms);
                self.markers.insert(key, Arc::new(touched));
            }
        }

        self.populate(churn.add_count);
        self.snapshot()
    }

    /// The current marker set.
    pub fn snapshot(&self) -> Snapshot {
        self.markers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

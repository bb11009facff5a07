//! The "HANDLE" stage - owns the live key → render-handle mapping.
//!
//! Applying a batch:
//! 1. Remove handles of updated and deleted keys (before any replacement is
//!    requested, so stale and fresh visuals never stack)
//! 2. Request handles for inserted and updated keys, concurrently
//! 3. Once every request resolved, swap in the new live set in one step

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use markerflow_env::{AnchoredStyle, EnvError, HandleId, MarkerStyle, PinStyle, RenderEngine};
use tracing::{debug, warn};

use crate::marker::{Marker, MarkerKey, Snapshot};
use crate::marker_diff::SnapshotDiff;

/// Per-marker style callback.
pub type StyleFn<S> = Arc<dyn Fn(&MarkerKey, &Marker) -> S + Send + Sync>;

/// A style value that is either fixed or derived from each marker.
#[derive(Clone)]
pub enum StyleSource<S> {
    Fixed(S),
    PerMarker(StyleFn<S>),
}

impl<S: Clone> StyleSource<S> {
    pub fn per_marker<F>(f: F) -> Self
    where
        F: Fn(&MarkerKey, &Marker) -> S + Send + Sync + 'static,
    {
        Self::PerMarker(Arc::new(f))
    }

    pub fn resolve(&self, key: &MarkerKey, marker: &Marker) -> S {
        match self {
            Self::Fixed(s) => s.clone(),
            Self::PerMarker(f) => f(key, marker),
        }
    }
}

/// How visual handles are produced for markers.
#[derive(Clone)]
pub enum MarkerFactory {
    /// Engine-drawn pins
    Pin { style: StyleSource<PinStyle> },
    /// Host elements pinned to a floor
    Anchored {
        element: StyleSource<String>,
        offset: [f64; 2],
        off_floor_opacity: f64,
    },
}

impl Default for MarkerFactory {
    fn default() -> Self {
        Self::Pin {
            style: StyleSource::Fixed(PinStyle::default()),
        }
    }
}

impl std::fmt::Debug for MarkerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pin { .. } => f.write_str("MarkerFactory::Pin"),
            Self::Anchored { .. } => f.write_str("MarkerFactory::Anchored"),
        }
    }
}

impl MarkerFactory {
    /// Resolves the engine style for one marker.
    ///
    /// Cluster pins carry their member count as label unless the style
    /// callback already set one.
    pub fn style_for(&self, key: &MarkerKey, marker: &Marker) -> MarkerStyle {
        match self {
            Self::Pin { style } => {
                let mut pin = style.resolve(key, marker);
                if marker.is_cluster() && pin.label.is_none() {
                    pin.label = Some(marker.member_count().to_string());
                }
                MarkerStyle::Pin(pin)
            }
            Self::Anchored {
                element,
                offset,
                off_floor_opacity,
            } => MarkerStyle::Anchored(AnchoredStyle {
                element: element.resolve(key, marker),
                offset: *offset,
                off_floor_opacity: *off_floor_opacity,
            }),
        }
    }

    pub async fn create_handle<E: RenderEngine + ?Sized>(
        &self,
        engine: &E,
        key: &MarkerKey,
        marker: &Marker,
    ) -> Result<HandleId, EnvError> {
        let style = self.style_for(key, marker);
        engine
            .create_marker_handle(marker.floor, marker.position, &style)
            .await
    }

    pub fn remove_handle<E: RenderEngine + ?Sized>(&self, engine: &E, handle: HandleId) {
        engine.remove_handle(handle);
    }
}

/// A rendered marker.
#[derive(Debug, Clone)]
pub struct LiveEntry {
    pub handle: HandleId,
    pub marker: Arc<Marker>,
}

/// Cumulative handle operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleStats {
    pub created: u64,
    pub removed: u64,
    pub failed: u64,
    pub batches: u64,
}

/// Committed key → handle mapping, i.e. what is actually on screen.
#[derive(Debug, Clone, Default)]
pub struct LiveSet {
    entries: HashMap<MarkerKey, LiveEntry>,
    stats: HandleStats,
}

impl LiveSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &MarkerKey) -> Option<&LiveEntry> {
        self.entries.get(key)
    }

    pub fn handle(&self, key: &MarkerKey) -> Option<HandleId> {
        self.entries.get(key).map(|e| e.handle)
    }

    pub fn contains_key(&self, key: &MarkerKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MarkerKey, &LiveEntry)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &MarkerKey> {
        self.entries.keys()
    }

    pub fn stats(&self) -> HandleStats {
        self.stats
    }
}

/// Outcome of applying one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub created: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Owns every handle; the only component that talks to the engine.
pub struct MarkerHandleManager<E: RenderEngine> {
    engine: Arc<E>,
    factory: MarkerFactory,
    live: LiveSet,
}

impl<E: RenderEngine> MarkerHandleManager<E> {
    pub fn new(engine: Arc<E>, factory: MarkerFactory) -> Self {
        Self {
            engine,
            factory,
            live: LiveSet::default(),
        }
    }

    pub fn live(&self) -> &LiveSet {
        &self.live
    }

    /// Applies `diff`, whose target snapshot is `target`.
    ///
    /// Keys of `target` that are missing from the live set because an
    /// earlier creation failed are requested again.
    pub async fn apply_diff(&mut self, diff: &SnapshotDiff, target: &Snapshot) -> ApplyReport {
        let mut next = self.live.entries.clone();
        let mut report = ApplyReport::default();

        for key in diff.removals() {
            if let Some(entry) = next.remove(key) {
                self.factory.remove_handle(self.engine.as_ref(), entry.handle);
                report.removed += 1;
            }
        }

        let touched = diff.touched();
        let mut requests: Vec<&MarkerKey> = diff.creations().collect();
        let mut healing: Vec<&MarkerKey> = target
            .keys()
            .filter(|k| !next.contains_key(*k) && !touched.contains(k))
            .collect();
        if !healing.is_empty() {
            healing.sort();
            debug!("re-requesting {} previously failed handles", healing.len());
            requests.extend(healing);
        }

        let created = self.create_all(requests, target, &mut report).await;
        next.extend(created);

        self.commit(next, report);
        report
    }

    /// Removes every live handle and draws `target` from scratch.
    pub async fn flush(&mut self, target: &Snapshot) -> ApplyReport {
        let mut report = ApplyReport::default();
        for entry in self.live.entries.values() {
            self.factory.remove_handle(self.engine.as_ref(), entry.handle);
            report.removed += 1;
        }

        let mut keys: Vec<&MarkerKey> = target.keys().collect();
        keys.sort();
        let created = self.create_all(keys, target, &mut report).await;

        self.commit(created.into_iter().collect(), report);
        report
    }

    /// Removes every live handle. Safe to call repeatedly.
    pub fn dispose(&mut self) -> usize {
        let count = self.live.entries.len();
        for (_, entry) in self.live.entries.drain() {
            self.factory.remove_handle(self.engine.as_ref(), entry.handle);
        }
        self.live.stats.removed += count as u64;
        count
    }

    async fn create_all(
        &self,
        keys: Vec<&MarkerKey>,
        target: &Snapshot,
        report: &mut ApplyReport,
    ) -> Vec<(MarkerKey, LiveEntry)> {
        let engine = self.engine.as_ref();
        let factory = &self.factory;

        let requests = keys.into_iter().filter_map(|key| match target.get(key) {
            Some(marker) => Some(async move {
                let result = factory.create_handle(engine, key, marker).await;
                (key, marker, result)
            }),
            None => {
                warn!("batch references key {} missing from its snapshot", key);
                None
            }
        });

        let mut created = Vec::new();
        for (key, marker, result) in join_all(requests).await {
            match result {
                Ok(handle) => {
                    report.created += 1;
                    created.push((
                        key.clone(),
                        LiveEntry {
                            handle,
                            marker: Arc::clone(marker),
                        },
                    ));
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("failed to create handle for {}: {}", key, e);
                }
            }
        }
        created
    }

    fn commit(&mut self, entries: HashMap<MarkerKey, LiveEntry>, report: ApplyReport) {
        let mut stats = self.live.stats;
        stats.created += report.created as u64;
        stats.removed += report.removed as u64;
        stats.failed += report.failed as u64;
        stats.batches += 1;
        self.live = LiveSet { entries, stats };
    }
}

impl<E: RenderEngine> Drop for MarkerHandleManager<E> {
    fn drop(&mut self) {
        if !self.live.is_empty() {
            self.dispose();
        }
    }
}

//! Cluster worker - keeps per-floor indexes current and feeds materialized
//! cluster snapshots to the reconciler.
//!
//! ```text
//!   Markers(S) ─┐                         ┌─► FloorIndexTable (spawn_blocking builds)
//!   View(bbox,z)├─► mpsc ─► ClusterWorker ┤
//!   FloorChange ┘                         └─► materialize ─► MarkerReconciler::reconcile
//! ```
//!
//! Rebuilds are drained one floor at a time, the engine's current floor
//! first. Commands arriving meanwhile are absorbed between rebuilds so a
//! burst of snapshots does not rebuild the same floor repeatedly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use markerflow_env::{BBox, Floor, MapContext, RenderEngine};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cluster::{materialize, unclustered, CoordinateIndex};
use crate::floor_index::{
    fingerprint, floors_to_rebuild, FloorIndex, FloorIndexTable, IndexOptions, RebuildQueue,
};
use crate::marker::{Marker, Snapshot};
use crate::reconciler::MarkerReconciler;
use crate::zoom_bands::ZoomBands;

/// Work items for the cluster worker.
#[derive(Debug)]
pub enum ClusterCommand {
    /// A new caller snapshot; `force` publishes it as a full redraw
    Markers { snapshot: Arc<Snapshot>, force: bool },
    /// Viewport or zoom moved
    View { viewport: BBox, zoom: f64 },
    /// The engine switched floors
    FloorChange,
    Dispose,
}

/// Which clustering a view maps to. Equal gates render identically.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ViewGate {
    /// Above the top band: raw markers of the active floor
    Unclustered(Option<Floor>),
    /// Inside band `index`, querying at integer zoom `level`
    Band { index: usize, level: i64 },
    /// Below every band: query at the raw zoom
    Raw { level: i64 },
}

impl ViewGate {
    fn query_zoom(&self) -> Option<f64> {
        match *self {
            ViewGate::Unclustered(_) => None,
            ViewGate::Band { level, .. } | ViewGate::Raw { level } => Some(level as f64),
        }
    }
}

pub(crate) struct ClusterWorker<C: MapContext, E: RenderEngine> {
    ctx: Arc<C>,
    engine: Arc<E>,
    reconciler: Arc<MarkerReconciler>,
    options: IndexOptions,
    bands: ZoomBands,

    snapshot: Arc<Snapshot>,
    /// Built lazily from `snapshot`; dropped whenever it changes
    coords: Option<CoordinateIndex>,
    table: FloorIndexTable,
    rebuilds: RebuildQueue,
    /// Last materialization per floor
    materialized: BTreeMap<Floor, Snapshot>,

    viewport: BBox,
    zoom: f64,
    gate: Option<ViewGate>,
    published_gate: Option<ViewGate>,
    published_viewport: Option<BBox>,
    dirty: bool,
    force: bool,

    processed: u64,
    processed_tx: watch::Sender<u64>,
}

impl<C: MapContext, E: RenderEngine> ClusterWorker<C, E> {
    pub(crate) fn new(
        ctx: Arc<C>,
        engine: Arc<E>,
        reconciler: Arc<MarkerReconciler>,
        options: IndexOptions,
        bands: ZoomBands,
        processed_tx: watch::Sender<u64>,
    ) -> Self {
        let viewport = engine.current_viewport();
        let zoom = engine.current_zoom();
        Self {
            ctx,
            engine,
            reconciler,
            options,
            bands,
            snapshot: Arc::new(Snapshot::new()),
            coords: None,
            table: FloorIndexTable::new(),
            rebuilds: RebuildQueue::new(),
            materialized: BTreeMap::new(),
            viewport,
            zoom,
            gate: None,
            published_gate: None,
            published_viewport: None,
            dirty: false,
            force: false,
            processed: 0,
            processed_tx,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ClusterCommand>) {
        while let Some(cmd) = rx.recv().await {
            if !self.handle(cmd) {
                break;
            }
            if !self.drain(&mut rx).await {
                break;
            }
            self.processed_tx.send_replace(self.processed);
        }

        // Release the engine and every index before reporting the stop
        let processed_tx = {
            let worker = self;
            worker.processed_tx
        };
        info!("Cluster worker stopped, per-floor indexes released");
        processed_tx.send_replace(u64::MAX);
    }

    /// Applies one command to worker state. Returns `false` to stop.
    fn handle(&mut self, cmd: ClusterCommand) -> bool {
        self.processed += 1;
        match cmd {
            ClusterCommand::Markers { snapshot, force } => {
                self.schedule_rebuilds(&snapshot);
                self.snapshot = snapshot;
                self.coords = None;
                self.dirty = true;
                self.force |= force;
            }
            ClusterCommand::View { viewport, zoom } => {
                self.viewport = viewport;
                self.zoom = zoom;
            }
            ClusterCommand::FloorChange => {}
            ClusterCommand::Dispose => return false,
        }
        true
    }

    fn schedule_rebuilds(&mut self, next: &Snapshot) {
        for floor in floors_to_rebuild(&self.snapshot, next) {
            let markers: Vec<_> = next.on_floor(floor).cloned().collect();
            if markers.is_empty() {
                debug!("floor {} emptied, dropping its index", floor);
                self.drop_floor(floor);
                self.rebuilds.cancel(floor);
                continue;
            }
            if self.table.is_stale(floor, fingerprint(markers.iter())) {
                self.rebuilds.push(floor, markers);
            } else {
                self.rebuilds.cancel(floor);
            }
        }
    }

    /// Rebuilds pending floors, then re-materializes if the view changed.
    async fn drain(&mut self, rx: &mut mpsc::UnboundedReceiver<ClusterCommand>) -> bool {
        self.gate = Some(self.classify_view());

        while let Some((floor, markers)) = self.rebuilds.pop_next(self.engine.current_floor()) {
            self.rebuild_floor(floor, markers).await;

            while let Ok(cmd) = rx.try_recv() {
                if !self.handle(cmd) {
                    return false;
                }
                self.gate = Some(self.classify_view());
            }
        }

        if let Some(gate) = self.gate {
            let view_changed = self.published_gate != Some(gate)
                || self.published_viewport != Some(self.viewport);
            if self.dirty || view_changed {
                self.refresh(gate);
            }
        }
        true
    }

    /// Builds one floor's index off the async threads. The active floor is
    /// materialized and published right away.
    async fn rebuild_floor(&mut self, floor: Floor, markers: Vec<Arc<Marker>>) {
        let options = self.options.clone();
        let count = markers.len();
        let built =
            tokio::task::spawn_blocking(move || FloorIndex::build(floor, &markers, &options)).await;
        match built {
            Ok(index) => {
                debug!("rebuilt floor {} index over {} markers", floor, count);
                self.table.replace(index);
            }
            Err(e) => {
                warn!("index build for floor {} failed, hiding its clusters: {}", floor, e);
                self.drop_floor(floor);
                return;
            }
        }

        if Some(floor) == self.engine.current_floor() {
            if let Some(gate) = self.gate {
                self.materialize_floor(floor, gate);
                self.publish(gate);
            }
        }
    }

    /// Forgets a floor's index and its last materialization.
    fn drop_floor(&mut self, floor: Floor) {
        self.table.remove(floor);
        self.materialized.remove(&floor);
    }

    fn classify_view(&self) -> ViewGate {
        if self.bands.is_above(self.zoom) {
            return ViewGate::Unclustered(self.engine.current_floor());
        }
        match self.bands.locate(self.zoom) {
            Some(hit) => ViewGate::Band {
                index: hit.index,
                level: hit.value.floor() as i64,
            },
            None => ViewGate::Raw {
                level: self.zoom.floor() as i64,
            },
        }
    }

    fn refresh(&mut self, gate: ViewGate) {
        if gate.query_zoom().is_some() {
            for floor in self.table.floors() {
                self.materialize_floor(floor, gate);
            }
        }
        self.publish(gate);
        self.dirty = false;
    }

    fn materialize_floor(&mut self, floor: Floor, gate: ViewGate) {
        let (Some(zoom), Some(index)) = (gate.query_zoom(), self.table.get(floor)) else {
            return;
        };
        let index = Arc::clone(index);
        let snapshot = &self.snapshot;
        let coords = self
            .coords
            .get_or_insert_with(|| CoordinateIndex::build(snapshot));
        let previous = self.materialized.remove(&floor).unwrap_or_default();
        let now = now_ms(self.ctx.as_ref());
        let next = materialize(&index, coords, &previous, &self.viewport, zoom, now);
        self.materialized.insert(floor, next);
    }

    fn publish(&mut self, gate: ViewGate) {
        let out = match gate {
            ViewGate::Unclustered(floor) => {
                if !self.materialized.is_empty() {
                    debug!("zoom above top band, clearing cluster cache");
                    self.materialized.clear();
                }
                unclustered(&self.snapshot, floor)
            }
            _ => {
                // Active floor last: its fresh markers win over stale copies
                // on floors still waiting for a rebuild
                let active = self.engine.current_floor();
                let mut union = Snapshot::new();
                for (floor, floor_snapshot) in &self.materialized {
                    if Some(*floor) != active {
                        union.extend(floor_snapshot);
                    }
                }
                if let Some(floor_snapshot) = active.and_then(|f| self.materialized.get(&f)) {
                    union.extend(floor_snapshot);
                }
                union
            }
        };

        let out = Arc::new(out);
        if std::mem::take(&mut self.force) {
            self.reconciler.force_redraw(out);
        } else {
            self.reconciler.reconcile(out);
        }
        self.published_gate = Some(gate);
        self.published_viewport = Some(self.viewport);
    }
}

fn now_ms<C: MapContext + ?Sized>(ctx: &C) -> i64 {
    ctx.system_time()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

//! The marker layer - the host-facing entry point.
//!
//! A `MarkerLayer` owns one reconciler and, when clustering is enabled, one
//! cluster worker. Every call is fire-and-forget: results surface only as
//! handles appearing on the engine.
//!
//! ```text
//!                     clustering off
//! reconcile(S) ─────────────────────────────────────► MarkerReconciler
//!      │                                                   ▲
//!      │ clustering on                                     │ materialized S'
//!      └────► ClusterWorker ◄── on_viewport_or_zoom_change ┘
//!                   ▲
//!                   └── watch_zoom_end (engine zoom-end events)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use markerflow_env::{wait_until_ready, BBox, EnvError, MapContext, ReadinessPolicy, RenderEngine};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::batch_queue::DEFAULT_MAX_BATCH_SIZE;
use crate::cluster_layer::{ClusterCommand, ClusterWorker};
use crate::floor_index::IndexOptions;
use crate::marker::Snapshot;
use crate::marker_diff::ChangeDetector;
use crate::marker_handles::{LiveSet, MarkerFactory};
use crate::reconciler::MarkerReconciler;
use crate::zoom_bands::{BandError, BandToken, ZoomBands};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Clustering configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster radius in pixels (default: 40)
    pub radius: f64,

    /// Tile extent the radius is relative to (default: 512)
    pub extent: f64,

    /// Minimum points to form a cluster (default: 2)
    pub min_points: u32,

    /// Lowest clustered zoom (default: 0)
    pub min_zoom: u8,

    /// Highest zoom at which points still merge (default: 20).
    /// Replaced by the top of `bands` when a band table is set.
    pub max_zoom: u8,

    /// Zoom band table; `None` clusters at every integer zoom in
    /// `[min_zoom, max_zoom]`
    pub bands: Option<Vec<BandToken>>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let index = IndexOptions::default();
        Self {
            radius: index.radius,
            extent: index.extent,
            min_points: index.min_points,
            min_zoom: index.min_zoom,
            max_zoom: index.max_zoom,
            bands: None,
        }
    }
}

impl ClusterConfig {
    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_max_zoom(mut self, max_zoom: u8) -> Self {
        self.max_zoom = max_zoom;
        self
    }

    pub fn with_bands(mut self, bands: Vec<BandToken>) -> Self {
        self.bands = Some(bands);
        self
    }

    /// Compiles the band table, or a pass-through band over the zoom range.
    pub fn compile_bands(&self) -> Result<ZoomBands, BandError> {
        match &self.bands {
            Some(tokens) => ZoomBands::parse(tokens),
            None => Ok(ZoomBands::passthrough(
                self.min_zoom as f64,
                self.max_zoom as f64,
            )),
        }
    }

    /// Index parameters, with `max_zoom` following the top band.
    pub fn index_options(&self, bands: &ZoomBands) -> IndexOptions {
        let max_zoom = match (&self.bands, bands.top()) {
            (Some(_), Some(top)) => top.ceil().max(self.min_zoom as f64).min(30.0) as u8,
            _ => self.max_zoom,
        };
        IndexOptions {
            radius: self.radius,
            extent: self.extent,
            min_points: self.min_points,
            min_zoom: self.min_zoom,
            max_zoom,
        }
    }
}

/// Marker layer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Pending batches buffered before snapshots coalesce (default: 4)
    pub max_batch_size: usize,

    /// Clustering, if enabled (default: off)
    pub clustering: Option<ClusterConfig>,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            clustering: None,
        }
    }
}

impl LayerConfig {
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_clustering(mut self, clustering: ClusterConfig) -> Self {
        self.clustering = Some(clustering);
        self
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("Marker layer has been disposed")]
    Disposed,

    #[error("Cluster worker is gone")]
    WorkerGone,

    #[error("Invalid zoom bands: {0}")]
    Bands(#[from] BandError),

    #[error(transparent)]
    Env(#[from] EnvError),
}

// ============================================================================
// LAYER
// ============================================================================

struct ClusterChannel {
    tx: mpsc::UnboundedSender<ClusterCommand>,
    sent: AtomicU64,
    processed_rx: watch::Receiver<u64>,
}

impl ClusterChannel {
    fn send(&self, cmd: ClusterCommand) -> Result<(), LayerError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.tx.send(cmd).map_err(|_| LayerError::WorkerGone)
    }

    async fn caught_up(&self) {
        let target = self.sent.load(Ordering::SeqCst);
        let mut rx = self.processed_rx.clone();
        let _ = rx.wait_for(|processed| *processed >= target).await;
    }

    async fn stopped(&self) {
        let mut rx = self.processed_rx.clone();
        let _ = rx.wait_for(|processed| *processed == u64::MAX).await;
    }
}

/// Builder for [`MarkerLayer`].
pub struct MarkerLayerBuilder<C: MapContext, E: RenderEngine> {
    ctx: Arc<C>,
    engine: Arc<E>,
    config: LayerConfig,
    factory: MarkerFactory,
    detector: ChangeDetector,
}

impl<C: MapContext, E: RenderEngine> MarkerLayerBuilder<C, E> {
    pub fn with_config(mut self, config: LayerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_factory(mut self, factory: MarkerFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Replaces the default timestamp comparison. The predicate returns
    /// `true` when a retained marker must be redrawn.
    pub fn with_change_detector(mut self, detector: ChangeDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Starts the layer's workers.
    pub fn spawn(self) -> Result<MarkerLayer<C, E>, LayerError> {
        let compiled = match &self.config.clustering {
            Some(cluster) => {
                let bands = cluster.compile_bands()?;
                let options = cluster.index_options(&bands);
                Some((bands, options))
            }
            None => None,
        };

        let reconciler = Arc::new(MarkerReconciler::spawn(
            self.ctx.as_ref(),
            Arc::clone(&self.engine),
            self.factory,
            self.config.max_batch_size,
            self.detector,
        ));

        let cluster = compiled.map(|(bands, options)| {
            let (tx, rx) = mpsc::unbounded_channel();
            let (processed_tx, processed_rx) = watch::channel(0);
            let worker = ClusterWorker::new(
                Arc::clone(&self.ctx),
                Arc::clone(&self.engine),
                Arc::clone(&reconciler),
                options,
                bands,
                processed_tx,
            );
            self.ctx.spawn("cluster-worker", worker.run(rx));
            Arc::new(ClusterChannel {
                tx,
                sent: AtomicU64::new(0),
                processed_rx,
            })
        });

        info!(
            "Marker layer started (clustering: {})",
            if cluster.is_some() { "on" } else { "off" }
        );
        let (shutdown_tx, _) = watch::channel(false);
        Ok(MarkerLayer {
            ctx: self.ctx,
            engine: self.engine,
            reconciler,
            cluster,
            disposed: AtomicBool::new(false),
            shutdown_tx,
            zoom_forwarder: Mutex::new(None),
        })
    }

    /// Waits for the engine to become ready, then starts the layer.
    pub async fn spawn_when_ready(
        self,
        policy: &ReadinessPolicy,
    ) -> Result<MarkerLayer<C, E>, LayerError> {
        wait_until_ready(self.ctx.as_ref(), self.engine.as_ref(), policy).await?;
        self.spawn()
    }
}

/// Incrementally reconciled, optionally clustered marker layer.
pub struct MarkerLayer<C: MapContext, E: RenderEngine> {
    ctx: Arc<C>,
    engine: Arc<E>,
    reconciler: Arc<MarkerReconciler>,
    cluster: Option<Arc<ClusterChannel>>,
    disposed: AtomicBool,
    /// Flipped to `true` by `dispose` to stop helper tasks
    shutdown_tx: watch::Sender<bool>,
    /// Closes when the zoom-end forwarder exits
    zoom_forwarder: Mutex<Option<watch::Receiver<()>>>,
}

impl<C: MapContext, E: RenderEngine> MarkerLayer<C, E> {
    pub fn builder(ctx: Arc<C>, engine: Arc<E>) -> MarkerLayerBuilder<C, E> {
        MarkerLayerBuilder {
            ctx,
            engine,
            config: LayerConfig::default(),
            factory: MarkerFactory::default(),
            detector: ChangeDetector::default(),
        }
    }

    fn ensure_live(&self) -> Result<(), LayerError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(LayerError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Accepts a new marker snapshot.
    pub fn reconcile(&self, snapshot: impl Into<Arc<Snapshot>>) -> Result<(), LayerError> {
        self.ensure_live()?;
        let snapshot = snapshot.into();
        match &self.cluster {
            Some(cluster) => cluster.send(ClusterCommand::Markers {
                snapshot,
                force: false,
            }),
            None => {
                self.reconciler.reconcile(snapshot);
                Ok(())
            }
        }
    }

    /// Discards every handle and redraws `snapshot` from scratch.
    pub fn force_redraw(&self, snapshot: impl Into<Arc<Snapshot>>) -> Result<(), LayerError> {
        self.ensure_live()?;
        let snapshot = snapshot.into();
        match &self.cluster {
            Some(cluster) => cluster.send(ClusterCommand::Markers {
                snapshot,
                force: true,
            }),
            None => {
                self.reconciler.force_redraw(snapshot);
                Ok(())
            }
        }
    }

    /// Re-materializes clusters if the zoom band or viewport changed.
    pub fn on_viewport_or_zoom_change(&self, viewport: BBox, zoom: f64) -> Result<(), LayerError> {
        self.ensure_live()?;
        match &self.cluster {
            Some(cluster) => cluster.send(ClusterCommand::View { viewport, zoom }),
            None => Ok(()),
        }
    }

    /// Re-reads the engine's current floor.
    pub fn on_floor_change(&self) -> Result<(), LayerError> {
        self.ensure_live()?;
        match &self.cluster {
            Some(cluster) => cluster.send(ClusterCommand::FloorChange),
            None => Ok(()),
        }
    }

    /// Forwards the engine's zoom-end events into
    /// [`on_viewport_or_zoom_change`](Self::on_viewport_or_zoom_change).
    ///
    /// At most one forwarder runs per layer; it stops on [`dispose`](Self::dispose).
    pub fn watch_zoom_end(&self) -> Result<(), LayerError> {
        self.ensure_live()?;
        let Some(cluster) = &self.cluster else {
            return Ok(());
        };

        let mut forwarder = self
            .zoom_forwarder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if forwarder.is_some() {
            debug!("zoom-end forwarder already running");
            return Ok(());
        }
        let (running_tx, running_rx) = watch::channel(());
        *forwarder = Some(running_rx);
        drop(forwarder);

        let cluster = Arc::clone(cluster);
        let engine = Arc::clone(&self.engine);
        let mut events = engine.subscribe_zoom_end();
        let mut shutdown = self.shutdown_tx.subscribe();

        self.ctx.spawn("zoom-end", async move {
            let running = running_tx;
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    event = events.recv() => match event {
                        Ok(zoom) => {
                            let viewport = engine.current_viewport();
                            if cluster.send(ClusterCommand::View { viewport, zoom }).is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("zoom-end listener skipped {} events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            drop(engine);
            drop(cluster);
            drop(running);
            debug!("zoom-end forwarder stopped");
        });
        Ok(())
    }

    /// Removes every handle and releases every per-floor index.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        if let Some(cluster) = &self.cluster {
            if cluster.send(ClusterCommand::Dispose).is_err() {
                warn!("cluster worker already stopped");
            }
        }
        self.reconciler.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Resolves once every call made so far is reflected in the live set.
    pub async fn settled(&self) {
        if let Some(cluster) = &self.cluster {
            cluster.caught_up().await;
        }
        self.reconciler.settled().await;
    }

    /// Resolves once every worker has exited after [`dispose`](Self::dispose).
    pub async fn stopped(&self) {
        self.reconciler.stopped().await;
        if let Some(cluster) = &self.cluster {
            cluster.stopped().await;
        }
        let forwarder = self
            .zoom_forwarder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(mut running) = forwarder {
            // Errors once the forwarder dropped its sender
            let _ = running.wait_for(|_| false).await;
        }
    }

    /// What is currently on screen.
    pub fn live(&self) -> Arc<LiveSet> {
        self.reconciler.live()
    }

    pub fn subscribe_live(&self) -> watch::Receiver<Arc<LiveSet>> {
        self.reconciler.subscribe_live()
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }
}

impl<C: MapContext, E: RenderEngine> Drop for MarkerLayer<C, E> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::{Marker, MarkerKey};
    use crate::test_support::RecordingEngine;
    use markerflow_env::{LatLng, TokioContext};
    use std::time::Duration;

    fn ab_snapshot() -> Snapshot {
        vec![
            Marker::new("a", 1, LatLng::new(0.0, 0.0), 1),
            Marker::new("b", 1, LatLng::new(0.0, 0.0001), 1),
        ]
        .into_iter()
        .collect()
    }

    fn clustered(engine: &Arc<RecordingEngine>) -> MarkerLayer<TokioContext, RecordingEngine> {
        MarkerLayer::builder(TokioContext::shared(), Arc::clone(engine))
            .with_config(LayerConfig::default().with_clustering(ClusterConfig::default()))
            .spawn()
            .unwrap()
    }

    fn sorted_keys(live: &LiveSet) -> Vec<String> {
        let mut keys: Vec<String> = live.keys().map(|k| k.to_string()).collect();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_plain_layer_reconciles_snapshots() {
        let engine = Arc::new(RecordingEngine::new());
        let layer = MarkerLayer::builder(TokioContext::shared(), Arc::clone(&engine))
            .spawn()
            .unwrap();

        layer.reconcile(ab_snapshot()).unwrap();
        layer.settled().await;
        assert_eq!(sorted_keys(&layer.live()), vec!["a", "b"]);
        assert_eq!(engine.alive_count(), 2);
    }

    #[tokio::test]
    async fn test_close_markers_cluster_then_split_above_top_band() {
        let engine = Arc::new(RecordingEngine::new());
        let layer = clustered(&engine);

        layer.reconcile(ab_snapshot()).unwrap();
        layer.settled().await;
        let live = layer.live();
        assert_eq!(live.len(), 1);
        let (_, entry) = live.iter().next().unwrap();
        assert_eq!(entry.marker.member_count(), 2);

        layer.on_viewport_or_zoom_change(BBox::world(), 21.0).unwrap();
        layer.settled().await;
        assert_eq!(sorted_keys(&layer.live()), vec!["a", "b"]);
        assert_eq!(engine.alive_count(), 2);
    }

    #[tokio::test]
    async fn test_cluster_handle_survives_band_change() {
        let engine = Arc::new(RecordingEngine::new());
        let layer = clustered(&engine);
        layer.reconcile(ab_snapshot()).unwrap();
        layer.settled().await;
        let (key, entry) = {
            let live = layer.live();
            let (k, e) = live.iter().next().unwrap();
            (k.clone(), e.clone())
        };
        let ops = engine.op_count();

        layer.on_viewport_or_zoom_change(BBox::world(), 11.0).unwrap();
        layer.settled().await;

        let live = layer.live();
        assert_eq!(live.handle(&key), Some(entry.handle));
        assert!(Arc::ptr_eq(&live.get(&key).unwrap().marker, &entry.marker));
        assert_eq!(engine.op_count(), ops);
    }

    #[tokio::test]
    async fn test_bypass_follows_active_floor() {
        let engine = Arc::new(RecordingEngine::new());
        engine.set_view(Some(1), 21.0, BBox::world());
        let layer = clustered(&engine);

        let snapshot: Snapshot = vec![
            Marker::new("one", 1, LatLng::new(1.0, 1.0), 1),
            Marker::new("two", 2, LatLng::new(2.0, 2.0), 1),
        ]
        .into_iter()
        .collect();
        layer.reconcile(snapshot).unwrap();
        layer.settled().await;
        assert_eq!(sorted_keys(&layer.live()), vec!["one"]);

        engine.set_view(Some(2), 21.0, BBox::world());
        layer.on_floor_change().unwrap();
        layer.settled().await;
        assert_eq!(sorted_keys(&layer.live()), vec!["two"]);
    }

    #[tokio::test]
    async fn test_timestamp_update_reaches_singletons() {
        let engine = Arc::new(RecordingEngine::new());
        let layer = clustered(&engine);
        let far = |ts| -> Snapshot {
            vec![
                Marker::new("x", 1, LatLng::new(10.0, 10.0), ts),
                Marker::new("y", 1, LatLng::new(-10.0, -10.0), 1),
            ]
            .into_iter()
            .collect()
        };

        layer.reconcile(far(1)).unwrap();
        layer.settled().await;
        let x = MarkerKey::from("x");
        let before = layer.live().handle(&x).unwrap();

        layer.reconcile(far(2)).unwrap();
        layer.settled().await;
        let live = layer.live();
        assert_eq!(live.get(&x).unwrap().marker.timestamp, 2);
        assert_ne!(live.handle(&x).unwrap(), before);
        assert!(!engine.is_alive(before));
    }

    #[tokio::test]
    async fn test_zoom_end_events_are_forwarded() {
        let engine = Arc::new(RecordingEngine::new());
        let layer = clustered(&engine);
        layer.watch_zoom_end().unwrap();
        layer.reconcile(ab_snapshot()).unwrap();
        layer.settled().await;
        assert_eq!(layer.live().len(), 1);

        engine.emit_zoom_end(21.0);
        for _ in 0..200 {
            layer.settled().await;
            if layer.live().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sorted_keys(&layer.live()), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_dispose_clears_everything() {
        let engine = Arc::new(RecordingEngine::new());
        let layer = clustered(&engine);
        layer.reconcile(ab_snapshot()).unwrap();
        layer.settled().await;

        layer.dispose();
        layer.stopped().await;
        assert!(layer.live().is_empty());
        assert_eq!(engine.alive_count(), 0);
        assert!(matches!(layer.reconcile(ab_snapshot()), Err(LayerError::Disposed)));
        // second dispose is a no-op
        layer.dispose();
    }

    #[test]
    fn test_band_top_drives_index_max_zoom() {
        let config = ClusterConfig::default().with_bands(vec![
            BandToken::Value(0.0),
            BandToken::Symbol(crate::zoom_bands::BandSymbol::Less),
            BandToken::Value(16.0),
        ]);
        let bands = config.compile_bands().unwrap();
        assert_eq!(config.index_options(&bands).max_zoom, 16);

        let plain = ClusterConfig::default();
        let bands = plain.compile_bands().unwrap();
        assert_eq!(plain.index_options(&bands).max_zoom, 20);
    }

    #[tokio::test]
    async fn test_dispose_stops_zoom_forwarder_and_releases_engine() {
        let engine = Arc::new(RecordingEngine::new());
        let layer = clustered(&engine);
        layer.watch_zoom_end().unwrap();
        let watching = Arc::strong_count(&engine);
        // second call keeps the running forwarder
        layer.watch_zoom_end().unwrap();
        assert_eq!(Arc::strong_count(&engine), watching);

        layer.reconcile(ab_snapshot()).unwrap();
        layer.settled().await;
        layer.dispose();
        layer.stopped().await;
        drop(layer);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(Arc::strong_count(&engine), 1);
    }

    #[test]
    fn test_min_zoom_above_top_band_does_not_panic() {
        let mut config = ClusterConfig::default().with_bands(vec![
            BandToken::Value(0.0),
            BandToken::Symbol(crate::zoom_bands::BandSymbol::Less),
            BandToken::Value(16.0),
        ]);
        config.min_zoom = 40;
        let bands = config.compile_bands().unwrap();
        assert_eq!(config.index_options(&bands).max_zoom, 30);
    }

    #[test]
    fn test_config_from_json() {
        let config: LayerConfig = serde_json::from_str(
            r#"{"max_batch_size":2,"clustering":{"radius":60,"extent":512,"min_points":2,
                "min_zoom":0,"max_zoom":18,"bands":[0,"<",10,"x",10]}}"#,
        )
        .unwrap();
        assert_eq!(config.max_batch_size, 2);
        let cluster = config.clustering.unwrap();
        assert_eq!(cluster.radius, 60.0);
        assert!(cluster.compile_bands().is_ok());
    }
}

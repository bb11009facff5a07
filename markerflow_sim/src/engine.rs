//! Simulated render engine with latency and failure injection.
//!
//! The engine keeps the ground truth of what is "on screen": every handle it
//! handed out and has not yet seen removed. Scenarios compare a layer's
//! committed live set against it to detect leaked or dangling handles.

use async_trait::async_trait;
use markerflow_env::{BBox, EnvError, Floor, HandleId, LatLng, MarkerStyle, RenderEngine};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;

/// Fault injection knobs of a [`SimEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEngineConfig {
    /// Seed for latency and failure draws
    pub seed: u64,

    /// Upper bound of scheduler yields before a creation resolves (default: 4)
    pub max_latency_yields: u32,

    /// Probability that a creation is rejected (default: 0.0)
    pub failure_rate: f64,

    /// `is_ready()` polls answered with `false` before the engine is ready
    /// (default: 0)
    pub ready_after_polls: u32,
}

impl Default for SimEngineConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            max_latency_yields: 4,
            failure_rate: 0.0,
            ready_after_polls: 0,
        }
    }
}

impl SimEngineConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_latency_yields(mut self, yields: u32) -> Self {
        self.max_latency_yields = yields;
        self
    }

    pub fn with_ready_after_polls(mut self, polls: u32) -> Self {
        self.ready_after_polls = polls;
        self
    }
}

/// A handle currently on screen.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMarker {
    pub floor: Floor,
    pub position: LatLng,
    pub style: MarkerStyle,
}

/// Cumulative engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub created: u64,
    pub removed: u64,
    pub rejected: u64,
    /// Removals of handles that were not alive (harmless, but counted)
    pub stale_removals: u64,
    pub peak_alive: usize,
}

#[derive(Debug)]
struct ViewState {
    floor: Option<Floor>,
    zoom: f64,
    viewport: BBox,
}

#[derive(Debug)]
struct EngineState {
    alive: HashMap<HandleId, RenderedMarker>,
    stats: EngineStats,
    view: ViewState,
    failure_rate: f64,
}

/// In-memory [`RenderEngine`].
pub struct SimEngine {
    state: Arc<Mutex<EngineState>>,
    rng: Mutex<ChaCha8Rng>,
    max_latency_yields: u32,
    next_handle: AtomicU64,
    polls_until_ready: AtomicU32,
    zoom_tx: broadcast::Sender<f64>,
}

impl SimEngine {
    pub fn new(config: SimEngineConfig) -> Self {
        let (zoom_tx, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(EngineState {
                alive: HashMap::new(),
                stats: EngineStats::default(),
                view: ViewState {
                    floor: Some(0),
                    zoom: 10.0,
                    viewport: BBox::world(),
                },
                failure_rate: config.failure_rate.clamp(0.0, 1.0),
            })),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(config.seed)),
            max_latency_yields: config.max_latency_yields,
            next_handle: AtomicU64::new(1),
            polls_until_ready: AtomicU32::new(config.ready_after_polls),
            zoom_tx,
        }
    }

    /// Creates an Arc-wrapped engine for sharing.
    pub fn shared(config: SimEngineConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Returns a controller sharing this engine's state.
    pub fn controller(&self) -> SimEngineController {
        SimEngineController {
            state: Arc::clone(&self.state),
            zoom_tx: self.zoom_tx.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Draws the latency and the outcome of one creation.
    fn draw(&self) -> (u32, bool) {
        let failure_rate = self.lock().failure_rate;
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        let yields = rng.gen_range(0..=self.max_latency_yields);
        let fails = failure_rate > 0.0 && rng.gen_bool(failure_rate);
        (yields, fails)
    }
}

#[async_trait]
impl RenderEngine for SimEngine {
    async fn create_marker_handle(
        &self,
        floor: Floor,
        position: LatLng,
        style: &MarkerStyle,
    ) -> Result<HandleId, EnvError> {
        let (yields, fails) = self.draw();
        for _ in 0..yields {
            tokio::task::yield_now().await;
        }

        let mut state = self.lock();
        if fails {
            state.stats.rejected += 1;
            return Err(EnvError::engine(format!(
                "injected failure at ({}, {}) on floor {}",
                position.lat, position.lng, floor
            )));
        }

        let handle = HandleId::from_seq(self.next_handle.fetch_add(1, Ordering::SeqCst));
        state.alive.insert(
            handle,
            RenderedMarker {
                floor,
                position,
                style: style.clone(),
            },
        );
        state.stats.created += 1;
        state.stats.peak_alive = state.stats.peak_alive.max(state.alive.len());
        Ok(handle)
    }

    fn remove_handle(&self, handle: HandleId) {
        let mut state = self.lock();
        if state.alive.remove(&handle).is_some() {
            state.stats.removed += 1;
        } else {
            state.stats.stale_removals += 1;
            debug!("removal of unknown handle {}", handle);
        }
    }

    fn current_floor(&self) -> Option<Floor> {
        self.lock().view.floor
    }

    fn current_zoom(&self) -> f64 {
        self.lock().view.zoom
    }

    fn current_viewport(&self) -> BBox {
        self.lock().view.viewport
    }

    fn subscribe_zoom_end(&self) -> broadcast::Receiver<f64> {
        self.zoom_tx.subscribe()
    }

    fn is_ready(&self) -> bool {
        self.polls_until_ready
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
    }
}

/// Harness-side control over a [`SimEngine`]: view changes, fault
/// injection and ground-truth inspection.
#[derive(Clone)]
pub struct SimEngineController {
    state: Arc<Mutex<EngineState>>,
    zoom_tx: broadcast::Sender<f64>,
}

impl SimEngineController {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_floor(&self, floor: Option<Floor>) {
        self.lock().view.floor = floor;
    }

    pub fn set_viewport(&self, viewport: BBox) {
        self.lock().view.viewport = viewport;
    }

    /// Sets the zoom and fires a zoom-end event.
    pub fn zoom_to(&self, zoom: f64) {
        self.lock().view.zoom = zoom;
        let _ = self.zoom_tx.send(zoom);
    }

    pub fn set_failure_rate(&self, rate: f64) {
        self.lock().failure_rate = rate.clamp(0.0, 1.0);
    }

    pub fn is_alive(&self, handle: HandleId) -> bool {
        self.lock().alive.contains_key(&handle)
    }

    pub fn rendered(&self, handle: HandleId) -> Option<RenderedMarker> {
        self.lock().alive.get(&handle).cloned()
    }

    pub fn alive_count(&self) -> usize {
        self.lock().alive.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.lock().stats
    }

    /// Total create and remove calls that reached the screen.
    pub fn op_count(&self) -> u64 {
        let stats = self.stats();
        stats.created + stats.removed
    }
}

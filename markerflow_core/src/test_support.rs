//! In-memory render engine for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use markerflow_env::{BBox, EnvError, Floor, HandleId, LatLng, MarkerStyle, RenderEngine};
use tokio::sync::broadcast;

pub struct RecordingEngine {
    next: AtomicU64,
    alive: Mutex<HashSet<HandleId>>,
    created: AtomicU64,
    removed: AtomicU64,
    fail_budget: AtomicU32,
    view: Mutex<(Option<Floor>, f64, BBox)>,
    zoom_tx: broadcast::Sender<f64>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            alive: Mutex::new(HashSet::new()),
            created: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            fail_budget: AtomicU32::new(0),
            view: Mutex::new((Some(1), 10.0, BBox::world())),
            zoom_tx: broadcast::channel(16).0,
        }
    }

    /// Makes the next `n` creations fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    pub fn set_view(&self, floor: Option<Floor>, zoom: f64, viewport: BBox) {
        *self.view.lock().unwrap() = (floor, zoom, viewport);
    }

    pub fn emit_zoom_end(&self, zoom: f64) {
        self.view.lock().unwrap().1 = zoom;
        let _ = self.zoom_tx.send(zoom);
    }

    pub fn is_alive(&self, handle: HandleId) -> bool {
        self.alive.lock().unwrap().contains(&handle)
    }

    pub fn alive_count(&self) -> usize {
        self.alive.lock().unwrap().len()
    }

    /// Total handle operations issued so far.
    pub fn op_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst) + self.removed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderEngine for RecordingEngine {
    async fn create_marker_handle(
        &self,
        _floor: Floor,
        _position: LatLng,
        _style: &MarkerStyle,
    ) -> Result<HandleId, EnvError> {
        tokio::task::yield_now().await;
        let failing = self
            .fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EnvError::engine("injected failure"));
        }
        let handle = HandleId::from_seq(self.next.fetch_add(1, Ordering::SeqCst));
        self.alive.lock().unwrap().insert(handle);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn remove_handle(&self, handle: HandleId) {
        self.alive.lock().unwrap().remove(&handle);
        self.removed.fetch_add(1, Ordering::SeqCst);
    }

    fn current_floor(&self) -> Option<Floor> {
        self.view.lock().unwrap().0
    }

    fn current_zoom(&self) -> f64 {
        self.view.lock().unwrap().1
    }

    fn current_viewport(&self) -> BBox {
        self.view.lock().unwrap().2
    }

    fn subscribe_zoom_end(&self) -> broadcast::Receiver<f64> {
        self.zoom_tx.subscribe()
    }
}

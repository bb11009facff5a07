//! Render engine abstraction consumed by the MarkerFlow core.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::EnvError;
use crate::types::{BBox, Floor, HandleId, LatLng, MarkerStyle};

/// The narrow slice of a map rendering engine the core depends on.
///
/// # Implementations
///
/// - **Production**: a binding to the host map (not part of this workspace)
/// - **Simulation**: `SimEngine`, an in-memory engine with latency and
///   failure injection
///
/// # Handle lifecycle
///
/// ```text
/// Core                          Engine
///   |-- create_marker_handle ---->|
///   |                             |-- [async: style load, DOM insert]
///   |<------------ HandleId ------|
///   |                             |
///   |-- remove_handle(id) ------->|   (idempotent)
/// ```
#[async_trait]
pub trait RenderEngine: Send + Sync + 'static {
    /// Creates a visual marker on `floor` at `position`.
    ///
    /// # Returns
    /// * `Ok(HandleId)` - The marker is on the map
    /// * `Err(EnvError::EngineError)` - The engine refused to draw it
    async fn create_marker_handle(
        &self,
        floor: Floor,
        position: LatLng,
        style: &MarkerStyle,
    ) -> Result<HandleId, EnvError>;

    /// Removes a visual marker.
    ///
    /// Must be a no-op for unknown or already-removed handles.
    fn remove_handle(&self, handle: HandleId);

    /// The floor currently viewed, if the map has one selected.
    fn current_floor(&self) -> Option<Floor>;

    /// The current continuous zoom level.
    fn current_zoom(&self) -> f64;

    /// The current visible bounds.
    fn current_viewport(&self) -> BBox;

    /// Subscribes to zoom-end events. Each event carries the final zoom.
    fn subscribe_zoom_end(&self) -> broadcast::Receiver<f64>;

    /// Whether the engine finished loading and accepts handle requests.
    fn is_ready(&self) -> bool {
        true
    }
}

//! MarkerFlow Core - Incremental Marker Reconciliation and Floor-Aware Clustering
//!
//! This library keeps a large, continuously changing marker set on a map
//! rendering engine without redrawing what did not change:
//! 1. **Diffing**: successive snapshots are reduced to insert/update/delete batches
//! 2. **Serialization**: batches are applied one at a time, in order, against
//!    the live set of render handles
//! 3. **Clustering**: markers are grouped per floor and zoom band, with
//!    shape-derived cluster keys so unchanged clusters keep their handles
//!
//! # Example
//!
//! ```ignore
//! use markerflow_core::{ClusterConfig, LayerConfig, MarkerLayer};
//! use markerflow_env::TokioContext;
//!
//! let layer = MarkerLayer::builder(TokioContext::shared(), engine)
//!     .with_config(LayerConfig::default().with_clustering(ClusterConfig::default()))
//!     .spawn()?;
//! layer.reconcile(snapshot)?;
//! layer.on_viewport_or_zoom_change(viewport, 14.2)?;
//! ```

pub mod batch_queue;
pub mod cluster;
mod cluster_layer;
pub mod floor_index;
pub mod layer;
pub mod marker;
pub mod marker_diff;
pub mod marker_handles;
pub mod reconciler;
pub mod zoom_bands;

#[cfg(test)]
mod test_support;

// Re-export key types for convenience
pub use batch_queue::{Batch, BatchQueue, BatchTask, QueueState, DEFAULT_MAX_BATCH_SIZE};
pub use cluster::{cluster_key, materialize, CoordinateIndex};
pub use floor_index::{floors_to_rebuild, ClusterItem, FloorIndex, IndexOptions};
pub use layer::{ClusterConfig, LayerConfig, LayerError, MarkerLayer, MarkerLayerBuilder};
pub use marker::{Marker, MarkerKey, MarkerKind, Snapshot};
pub use marker_diff::{changed, create_batch, diff, ChangeDetector, KeyPartition, SnapshotDiff};
pub use marker_handles::{
    ApplyReport, HandleStats, LiveEntry, LiveSet, MarkerFactory, MarkerHandleManager, StyleSource,
};
pub use reconciler::MarkerReconciler;
pub use zoom_bands::{classify, BandError, BandSymbol, BandToken, ZoomBands};

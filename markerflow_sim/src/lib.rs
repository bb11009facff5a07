//! MarkerFlow Deterministic Simulation Harness
//!
//! Drives a [`markerflow_core::MarkerLayer`] against an in-memory render
//! engine whose latency, failures and view state are all derived from one
//! seed, then checks what the layer committed against what the engine
//! actually shows.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  snapshots   ┌───────────────┐  create/remove  ┌───────────┐
//! │  MarkerFeed  │─────────────►│  MarkerLayer  │────────────────►│ SimEngine │
//! │ (churn, RNG) │              │ (diff, queue, │                 │ (latency, │
//! └──────────────┘              │  clustering)  │                 │ failures) │
//!        ▲                      └───────┬───────┘                 └─────┬─────┘
//!        │                              │ live set                      │ ground truth
//!        │                      ┌───────▼───────────────────────────────▼─────┐
//!        └──────────────────────│              ScenarioRunner                 │
//!                               └─────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use markerflow_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).with_steps(40).run(ScenarioId::ClusterZoom);
//! assert!(result.passed);
//! ```

mod context;
mod engine;
mod exporter;
mod feed;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use engine::{EngineStats, RenderedMarker, SimEngine, SimEngineConfig, SimEngineController};
pub use exporter::{LiveMarker, SimEvent, SimExport, SimFrame};
pub use feed::{Churn, MarkerFeed};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SimError};

//! MarkerFlow Environment Abstraction Layer
//!
//! This crate provides the boundary between the reconciliation core and the
//! outside world, so the same core runs against a **Production** map engine
//! and against the **Simulation** engine of `markerflow_sim`.
//!
//! # Core Concept
//!
//! Everything the core cannot control is behind a trait:
//! - Rendering (`RenderEngine::create_marker_handle`, `remove_handle`)
//! - View state (`current_floor()`, `current_zoom()`, `current_viewport()`)
//! - Time and tasks (`MapContext::now()`, `sleep()`, `spawn()`)
//!
//! # Example
//!
//! ```ignore
//! use markerflow_env::{wait_until_ready, ReadinessPolicy, RenderEngine, TokioContext};
//!
//! async fn attach<E: RenderEngine>(engine: &E) {
//!     let ctx = TokioContext::new();
//!     wait_until_ready(&ctx, engine, &ReadinessPolicy::default()).await?;
//!     // engine accepts handle requests from here on
//! }
//! ```

mod context;
mod engine;
mod error;
mod readiness;
mod tokio_impl;
mod types;

pub use context::MapContext;
pub use engine::RenderEngine;
pub use error::EnvError;
pub use readiness::{wait_until_ready, ReadinessPolicy};
pub use tokio_impl::TokioContext;
pub use types::{AnchoredStyle, BBox, Floor, HandleId, LatLng, MarkerStyle, PinShape, PinStyle};

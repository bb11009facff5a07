//! Bounded readiness polling at the engine boundary.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::context::MapContext;
use crate::engine::RenderEngine;
use crate::error::EnvError;

/// How long to wait for a render engine that is still loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessPolicy {
    /// Delay between polls in milliseconds (default: 500)
    pub interval_ms: u64,

    /// Number of polls before giving up (default: 20)
    pub max_attempts: u32,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            max_attempts: 20,
        }
    }
}

/// Polls `engine.is_ready()` until it reports ready or the budget runs out.
///
/// # Returns
/// * `Ok(())` - The engine is ready
/// * `Err(EnvError::NotReady)` - Still loading after `max_attempts` polls
pub async fn wait_until_ready<C, E>(
    ctx: &C,
    engine: &E,
    policy: &ReadinessPolicy,
) -> Result<(), EnvError>
where
    C: MapContext + ?Sized,
    E: RenderEngine + ?Sized,
{
    for attempt in 0..policy.max_attempts {
        if engine.is_ready() {
            return Ok(());
        }
        debug!("render engine not ready (attempt {})", attempt + 1);
        ctx.sleep(Duration::from_millis(policy.interval_ms)).await;
    }
    if engine.is_ready() {
        return Ok(());
    }
    Err(EnvError::NotReady {
        attempts: policy.max_attempts,
    })
}

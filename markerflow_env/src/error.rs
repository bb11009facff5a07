//! Error types for the MarkerFlow environment abstraction.

use thiserror::Error;

/// Errors that can occur at the render-engine boundary.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The engine rejected a handle request (bad style, detached map, etc.)
    #[error("Engine error: {0}")]
    EngineError(String),

    /// The engine did not become ready within the polling budget
    #[error("Engine not ready after {attempts} attempts")]
    NotReady { attempts: u32 },
}

impl EnvError {
    /// Creates an engine error.
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::EngineError(msg.into())
    }
}

//! JSON exporter for scenario runs.
//!
//! Each frame captures what the layer committed after one scenario step, so
//! a run can be replayed or plotted offline.

use markerflow_core::LiveSet;
use markerflow_env::Floor;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// A single step of a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    pub step: u64,

    /// Virtual time in milliseconds
    pub time_ms: u64,

    pub zoom: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub floor: Option<Floor>,

    /// Markers in the submitted snapshot
    pub snapshot_len: usize,

    /// Committed live set
    pub live: Vec<LiveMarker>,

    /// Handles alive in the engine
    pub engine_alive: usize,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

/// One committed marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveMarker {
    pub key: String,
    pub handle: String,
    pub floor: Floor,
    pub lat: f64,
    pub lng: f64,
    pub member_count: u32,
}

impl LiveMarker {
    /// Converts a live set, sorted by key.
    pub fn from_live(live: &LiveSet) -> Vec<Self> {
        let mut markers: Vec<Self> = live
            .iter()
            .map(|(key, entry)| LiveMarker {
                key: key.to_string(),
                handle: entry.handle.to_string(),
                floor: entry.marker.floor,
                lat: entry.marker.position.lat,
                lng: entry.marker.position.lng,
                member_count: entry.marker.member_count(),
            })
            .collect();
        markers.sort_by(|a, b| a.key.cmp(&b.key));
        markers
    }
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: Some("error".to_string()),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

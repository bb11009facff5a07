//! Simulation scenarios for MarkerFlow layers.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: snapshots submitted faster than the engine resolves them
    RapidFire,

    /// SIM-002: one key inserted and deleted on every submission
    FlipFlop,

    /// SIM-003: zoom sweep through every band and back
    ClusterZoom,

    /// SIM-004: floor switches above the top zoom band
    FloorHop,

    /// SIM-005: engine rejecting a share of handle creations
    FlakyEngine,

    /// SIM-006: disposal while batches are in flight
    Teardown,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::RapidFire,
            ScenarioId::FlipFlop,
            ScenarioId::ClusterZoom,
            ScenarioId::FloorHop,
            ScenarioId::FlakyEngine,
            ScenarioId::Teardown,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::RapidFire => "rapid_fire",
            ScenarioId::FlipFlop => "flip_flop",
            ScenarioId::ClusterZoom => "cluster_zoom",
            ScenarioId::FloorHop => "floor_hop",
            ScenarioId::FlakyEngine => "flaky_engine",
            ScenarioId::Teardown => "teardown",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::RapidFire => "Back-to-back snapshots converge to the last one, no leaked handles",
            ScenarioId::FlipFlop => "A key toggling every submission ends in its final state",
            ScenarioId::ClusterZoom => "Cluster counts add up in every band, handles survive re-clustering",
            ScenarioId::FloorHop => "Above the top band only the active floor's raw markers are shown",
            ScenarioId::FlakyEngine => "30% rejected creations keep the live set consistent, then heal",
            ScenarioId::Teardown => "Dispose mid-flight leaves nothing on screen",
        }
    }

    /// Returns true if the scenario runs with clustering enabled.
    pub fn is_clustered(&self) -> bool {
        matches!(self, ScenarioId::ClusterZoom | ScenarioId::FloorHop)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rapid_fire" | "rapidfire" | "sim-001" => Ok(ScenarioId::RapidFire),
            "flip_flop" | "flipflop" | "sim-002" => Ok(ScenarioId::FlipFlop),
            "cluster_zoom" | "clusterzoom" | "sim-003" => Ok(ScenarioId::ClusterZoom),
            "floor_hop" | "floorhop" | "sim-004" => Ok(ScenarioId::FloorHop),
            "flaky_engine" | "flakyengine" | "sim-005" => Ok(ScenarioId::FlakyEngine),
            "teardown" | "sim-006" => Ok(ScenarioId::Teardown),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

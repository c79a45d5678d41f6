//! Shared data model: runs, episodes, reports, and the per-step snapshot
//! that flows from the Central Controller to every downstream consumer.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationMode {
    Automatic,
    SemiAutomatic,
    Manual,
}

impl Default for OperationMode {
    fn default() -> Self {
        Self::Automatic
    }
}

impl std::str::FromStr for OperationMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTOMATIC" => Ok(Self::Automatic),
            "SEMI_AUTOMATIC" => Ok(Self::SemiAutomatic),
            "MANUAL" => Ok(Self::Manual),
            other => Err(format!("unknown operation mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverrideKind {
    Alert,
    Off,
}

pub type OverrideState = BTreeMap<String, OverrideKind>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MaturityPhase {
    #[default]
    Unknown,
    Child,
    Teen,
    Adult,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn distance_sq(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// Buffered operator override command, attached to the next snapshot for
/// downstream auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideCommand {
    pub semaphore_id: String,
    pub state: String,
}

/// The full per-step observation fanned out to C3, C4, and persisted state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepSnapshot {
    pub run_id: u64,
    pub sim_time: f64,
    pub scenario_name: String,
    pub net_file: String,
    pub operation_mode: Option<OperationMode>,
    pub step_length: f64,

    pub lane_occupancies: BTreeMap<String, f64>,
    pub lane_waiting_time: BTreeMap<String, f64>,
    pub lane_vehicle_ids: BTreeMap<String, BTreeSet<String>>,

    pub tls_phases: BTreeMap<String, i32>,
    pub tls_controlled_lanes: BTreeMap<String, Vec<String>>,
    pub tls_lanes_state: BTreeMap<String, Vec<(String, char)>>,

    pub edge_mean_speeds: BTreeMap<String, f64>,
    pub junction_positions: BTreeMap<String, Position>,

    pub sim_starting_teleports_len: usize,
    pub sim_emergency_stops_len: usize,
    pub sim_emergency_stop_positions: Vec<Position>,
    pub sim_min_expected_number: i64,

    pub maturity_phases: BTreeMap<String, MaturityPhase>,
    pub active_overrides: OverrideState,
    pub override_commands: Vec<OverrideCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: u64,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub scenario_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: u64,
    pub run_id: u64,
    pub episode_number: u64,
    pub total_reward: f64,
    pub end_time: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub report_id: u64,
    pub run_id: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub summary: String,
    pub report_content: String,
}

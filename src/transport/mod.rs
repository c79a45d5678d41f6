//! The command pipe and fan-out queues connecting the control-plane tasks.
//!
//! The simulator's original proxy forwards `(module, function, args,
//! kwargs)` by dynamic attribute lookup. Here the catalog of operations
//! actually used is closed and explicit: `RpcRequest` is a tagged enum, not
//! a free-form string pair, so an unknown operation is a compile error for
//! new callers and a typed `Protocol` error for anything arriving over the
//! wire (the mock simulator binary speaks the same enum, JSON-encoded).

pub mod pipe;
pub mod queues;

use serde::{Deserialize, Serialize};

use crate::model::Position;

/// A value flowing to or from the simulator. The simulator's own value
/// space (numbers, strings, lists, maps, null) doesn't fit a closed Rust
/// enum without becoming unwieldy at every call site, so results keep a
/// `serde_json::Value` payload while requests are fully typed.
pub type RpcValue = serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LaneOp {
    GetLastStepOccupancy { lane_id: String },
    GetWaitingTime { lane_id: String },
    GetLastStepVehicleIds { lane_id: String },
    GetIdList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EdgeOp {
    GetLastStepMeanSpeed { edge_id: String },
    GetIdList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TrafficLightOp {
    GetIdList,
    GetControlledLanes { tls_id: String },
    GetRedYellowGreenState { tls_id: String },
    GetPhase { tls_id: String },
    SetPhase { tls_id: String, phase: i32 },
    GetProgram { tls_id: String },
    SetProgram { tls_id: String, program_id: String },
    SetRedYellowGreenState { tls_id: String, state: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JunctionOp {
    GetIdList,
    GetPosition { junction_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SimulationOp {
    GetTime,
    GetOption { option: String },
    GetStartingTeleportIdList,
    GetEmergencyStoppingVehiclesIdList,
    GetMinExpectedNumber,
    SimulationStep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VehicleOp {
    GetPosition { vehicle_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CustomOp {
    UpdateMaturityState {
        phases: std::collections::BTreeMap<String, crate::model::MaturityPhase>,
        run_id: Option<u64>,
    },
    GetBatchedStepData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    Lane(LaneOp),
    Edge(EdgeOp),
    TrafficLight(TrafficLightOp),
    Junction(JunctionOp),
    Simulation(SimulationOp),
    Vehicle(VehicleOp),
    /// Reserved passthrough; no-op in this implementation.
    Gui,
    Custom(CustomOp),
    /// Sentinel sent to the learning core on shutdown.
    SystemShutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcError {
    Protocol(String),
    Simulator(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Protocol(m) => write!(f, "protocol error: {m}"),
            RpcError::Simulator(m) => write!(f, "simulator error: {m}"),
        }
    }
}

pub type RpcResult = Result<RpcValue, RpcError>;

pub fn position_to_value(p: &Position) -> RpcValue {
    serde_json::json!({ "x": p.x, "y": p.y })
}

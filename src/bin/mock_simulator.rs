//! Standalone TCP server that speaks the same length-prefixed JSON framing
//! as the real simulator connection, returning plausible canned data for
//! every `RpcRequest` variant. Exists so the rest of the system can be
//! exercised end to end without a real microscopic traffic simulator
//! running.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use carina_controller::transport::{
    CustomOp, EdgeOp, JunctionOp, LaneOp, RpcRequest, RpcResult, SimulationOp, TrafficLightOp,
    VehicleOp,
};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Parser, Debug)]
#[command(about = "Canned-response TCP server for exercising the controller without a real simulator")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 8813)]
    port: u16,
}

const LANE_IDS: &[&str] = &["E1_0", "E1_1", "E2_0"];
const EDGE_IDS: &[&str] = &["E1", "E2"];
const TLS_IDS: &[&str] = &["J1"];
const JUNCTION_IDS: &[&str] = &["J1", "J2"];

struct World {
    sim_time: AtomicI64,
    phase: AtomicI64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr, "mock simulator listening");

    let world = Arc::new(World {
        sim_time: AtomicI64::new(0),
        phase: AtomicI64::new(0),
    });

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "controller connected");
        let world = world.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, world).await {
                tracing::info!(error = %e, "connection closed");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, world: Arc<World>) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        let request: RpcRequest = serde_json::from_slice(&payload)?;

        if matches!(request, RpcRequest::SystemShutdown) {
            tracing::info!("received shutdown sentinel, closing connection");
            return Ok(());
        }

        let result = dispatch(&request, &world);
        let reply = serde_json::to_vec(&result)?;
        stream.write_all(&(reply.len() as u32).to_be_bytes()).await?;
        stream.write_all(&reply).await?;
        stream.flush().await?;
    }
}

fn dispatch(request: &RpcRequest, world: &World) -> RpcResult {
    match request {
        RpcRequest::Lane(op) => Ok(match op {
            LaneOp::GetIdList => serde_json::json!(LANE_IDS),
            LaneOp::GetLastStepOccupancy { .. } => serde_json::json!(0.3),
            LaneOp::GetWaitingTime { .. } => serde_json::json!(4.0),
            LaneOp::GetLastStepVehicleIds { .. } => serde_json::json!(["veh0", "veh1"]),
        }),
        RpcRequest::Edge(op) => Ok(match op {
            EdgeOp::GetIdList => serde_json::json!(EDGE_IDS),
            EdgeOp::GetLastStepMeanSpeed { .. } => serde_json::json!(8.5),
        }),
        RpcRequest::TrafficLight(op) => Ok(match op {
            TrafficLightOp::GetIdList => serde_json::json!(TLS_IDS),
            TrafficLightOp::GetControlledLanes { .. } => serde_json::json!(LANE_IDS),
            TrafficLightOp::GetRedYellowGreenState { .. } => serde_json::json!("GGrr"),
            TrafficLightOp::GetPhase { .. } => serde_json::json!(world.phase.load(Ordering::Relaxed)),
            TrafficLightOp::SetPhase { phase, .. } => {
                world.phase.store(*phase as i64, Ordering::Relaxed);
                serde_json::json!(true)
            }
            TrafficLightOp::GetProgram { .. } => serde_json::json!("0"),
            TrafficLightOp::SetProgram { .. } => serde_json::json!(true),
            TrafficLightOp::SetRedYellowGreenState { .. } => serde_json::json!(true),
        }),
        RpcRequest::Junction(op) => Ok(match op {
            JunctionOp::GetIdList => serde_json::json!(JUNCTION_IDS),
            JunctionOp::GetPosition { junction_id } => {
                let offset = junction_id.len() as f64 * 10.0;
                serde_json::json!({ "x": offset, "y": 0.0 })
            }
        }),
        RpcRequest::Simulation(op) => Ok(match op {
            SimulationOp::GetTime => serde_json::json!(world.sim_time.load(Ordering::Relaxed) as f64),
            SimulationOp::GetOption { option } => match option.as_str() {
                "configuration-file" => serde_json::json!("demo.sumocfg"),
                "net-file" => serde_json::json!("demo.net.xml"),
                _ => serde_json::json!(""),
            },
            SimulationOp::GetStartingTeleportIdList => serde_json::json!([]),
            SimulationOp::GetEmergencyStoppingVehiclesIdList => serde_json::json!([]),
            SimulationOp::GetMinExpectedNumber => serde_json::json!(0),
            SimulationOp::SimulationStep => {
                world.sim_time.fetch_add(1, Ordering::Relaxed);
                serde_json::json!(true)
            }
        }),
        RpcRequest::Vehicle(op) => Ok(match op {
            VehicleOp::GetPosition { .. } => serde_json::json!({ "x": 0.0, "y": 0.0 }),
        }),
        RpcRequest::Gui => Ok(serde_json::json!(null)),
        RpcRequest::Custom(op) => Ok(match op {
            CustomOp::GetBatchedStepData => {
                let mut tls_phases = BTreeMap::new();
                tls_phases.insert("J1".to_string(), world.phase.load(Ordering::Relaxed) as i32);
                serde_json::json!({ "tls_phases": tls_phases, "lane_waiting_time": { "E1_0": 4.0 } })
            }
            CustomOp::UpdateMaturityState { .. } => serde_json::json!(true),
        }),
        RpcRequest::SystemShutdown => unreachable!("handled before dispatch"),
    }
}

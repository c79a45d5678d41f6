//! The Central Controller (C7): sole owner of the simulator connection,
//! arbiter of every command reaching it, and the source of every
//! StepSnapshot fanned out to the rest of the system.

pub mod override_manager;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::model::{MaturityPhase, OperationMode, OverrideCommand, Position, StepSnapshot};
use crate::simulator::SimulatorConnection;
use crate::storage::state_files::{load_or_default, write_atomic};
use crate::transport::pipe::{CommandPipeServer, PipeRequest};
use crate::transport::queues::{send_lossy, EventStorePayload, UiCommand, WatchdogCommand};
use crate::transport::{
    CustomOp, EdgeOp, JunctionOp, LaneOp, RpcError, RpcRequest, RpcResult, SimulationOp,
    TrafficLightOp,
};

use override_manager::OverrideManager;

#[derive(Debug, serde::Serialize, serde::Deserialize, Default, PartialEq, Clone, Copy)]
struct GlobalState {
    operation_mode: OperationMode,
}

pub struct ControllerChannels {
    pub pipe_server: CommandPipeServer,
    pub ui_rx: mpsc::Receiver<UiCommand>,
    pub watchdog_rx: mpsc::Receiver<WatchdogCommand>,
    pub telemetry_tx: mpsc::Sender<StepSnapshot>,
    pub analysis_tx: mpsc::Sender<StepSnapshot>,
    pub safety_tx: mpsc::Sender<StepSnapshot>,
    pub event_store_tx: mpsc::Sender<EventStorePayload>,
}

pub struct CentralController {
    sim: SimulatorConnection,
    settings: Settings,
    override_mgr: OverrideManager,
    global_mode: GlobalState,
    run_id: u64,
    scenario_name: String,
    net_file: String,
    results_dir: PathBuf,
    global_state_path: PathBuf,
    settings_overrides_path: PathBuf,
    maturity_phases: BTreeMap<String, MaturityPhase>,
    pending_override_commands: Vec<OverrideCommand>,
    last_ai_activity: Option<Instant>,
    started_at: Instant,
}

impl CentralController {
    /// Runs the startup sequence (§4.2) and returns a controller ready to
    /// enter its main loop.
    pub async fn startup(settings: Settings, run_id: u64) -> anyhow::Result<Self> {
        let mut sim = SimulatorConnection::connect_with_retry(&settings.simulator).await?;

        let config_file_value = sim
            .call(&RpcRequest::Simulation(SimulationOp::GetOption {
                option: "configuration-file".to_string(),
            }))
            .await?
            .unwrap_or(serde_json::json!("scenario.sumocfg"));
        let config_file = config_file_value.as_str().unwrap_or("scenario").to_string();
        let scenario_name = std::path::Path::new(&config_file)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "scenario".to_string());

        let net_file_value = sim
            .call(&RpcRequest::Simulation(SimulationOp::GetOption {
                option: "net-file".to_string(),
            }))
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or(serde_json::json!(""));
        let net_file = net_file_value.as_str().unwrap_or_default().to_string();

        let results_dir = settings.storage.results_dir.join(&scenario_name);
        let global_state_path = results_dir.join("global_state.json");
        let settings_overrides_path = results_dir.join("settings_overrides.json");

        let global_mode: GlobalState = load_or_default(&global_state_path);
        write_atomic(&global_state_path, &global_mode)?; // canonicalize on boot

        let mut override_mgr = OverrideManager::new();
        override_mgr.init_persistence(&settings.storage.results_dir, &scenario_name);

        let mut controller = Self {
            sim,
            settings,
            override_mgr,
            global_mode,
            run_id,
            scenario_name,
            net_file,
            results_dir,
            global_state_path,
            settings_overrides_path,
            maturity_phases: BTreeMap::new(),
            pending_override_commands: Vec::new(),
            last_ai_activity: None,
            started_at: Instant::now(),
        };

        controller.restore_overrides_to_simulator().await?;

        Ok(controller)
    }

    pub fn results_dir(&self) -> &std::path::Path {
        &self.results_dir
    }

    pub fn scenario_name(&self) -> &str {
        &self.scenario_name
    }

    async fn restore_overrides_to_simulator(&mut self) -> anyhow::Result<()> {
        let known_ids = self.known_traffic_light_ids().await?;
        let lane_counts = self.controlled_lane_counts(&known_ids).await?;
        let to_apply = self
            .override_mgr
            .reconcile_and_signal_strings(&known_ids, &lane_counts);
        for (tls_id, signal) in to_apply {
            let _ = self
                .sim
                .call(&RpcRequest::TrafficLight(TrafficLightOp::SetRedYellowGreenState {
                    tls_id,
                    state: signal,
                }))
                .await;
        }
        Ok(())
    }

    async fn known_traffic_light_ids(&mut self) -> anyhow::Result<BTreeSet<String>> {
        let v = self
            .sim
            .call(&RpcRequest::TrafficLight(TrafficLightOp::GetIdList))
            .await?
            .unwrap_or(serde_json::json!([]));
        Ok(v.as_array()
            .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
            .unwrap_or_default())
    }

    async fn controlled_lane_counts(
        &mut self,
        ids: &BTreeSet<String>,
    ) -> anyhow::Result<BTreeMap<String, usize>> {
        let mut out = BTreeMap::new();
        for id in ids {
            let v = self
                .sim
                .call(&RpcRequest::TrafficLight(TrafficLightOp::GetControlledLanes {
                    tls_id: id.clone(),
                }))
                .await?
                .unwrap_or(serde_json::json!([]));
            let n = v.as_array().map(|a| a.len()).unwrap_or(0);
            out.insert(id.clone(), n);
        }
        Ok(out)
    }

    /// The main loop (§4.2): one iteration per simulator step.
    pub async fn run(mut self, mut channels: ControllerChannels, cancel: CancellationToken) {
        tracing::info!(run_id = self.run_id, scenario = %self.scenario_name, "central controller main loop starting");

        send_lossy(
            &channels.event_store_tx,
            EventStorePayload::LogRun(crate::model::Run {
                run_id: self.run_id,
                start_time: chrono::Utc::now(),
                scenario_name: self.scenario_name.clone(),
            }),
            "controller->event_store",
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.drain_ui_commands(&mut channels.ui_rx).await;

            let grace_elapsed = self.started_at.elapsed()
                >= Duration::from_secs_f64(self.settings.watchdog.initial_grace_period_seconds);
            let ai_healthy = !grace_elapsed
                || self
                    .last_ai_activity
                    .map(|t| t.elapsed() < Duration::from_secs_f64(self.settings.watchdog.heartbeat_timeout_seconds))
                    .unwrap_or(false);

            if ai_healthy {
                self.process_ai_requests(&mut channels).await;
                drain_nonblocking(&mut channels.watchdog_rx);
            } else {
                self.process_watchdog_commands(&mut channels.watchdog_rx).await;
            }

            if let Err(e) = self
                .sim
                .call(&RpcRequest::Simulation(SimulationOp::SimulationStep))
                .await
            {
                tracing::error!(error = %e, "simulator step failed, shutting down controller");
                break;
            }
        }

        self.shutdown().await;
    }

    async fn drain_ui_commands(&mut self, ui_rx: &mut mpsc::Receiver<UiCommand>) {
        while let Ok(cmd) = ui_rx.try_recv() {
            match cmd {
                UiCommand::SaveSettings(payload) => {
                    let Some(incoming) = payload.as_object() else {
                        tracing::warn!(?payload, "rejected non-object settings payload");
                        continue;
                    };
                    let mut merged: BTreeMap<String, serde_json::Value> =
                        load_or_default(&self.settings_overrides_path);
                    for (key, value) in incoming {
                        merged.insert(key.clone(), value.clone());
                    }
                    if let Err(e) = write_atomic(&self.settings_overrides_path, &merged) {
                        tracing::error!(error = %e, "failed to persist saved settings");
                    } else {
                        tracing::info!(keys = incoming.len(), "operator saved settings");
                    }
                }
                UiCommand::SetGlobalMode { mode } => match mode.parse::<OperationMode>() {
                    Ok(parsed) if parsed != self.global_mode.operation_mode => {
                        self.global_mode.operation_mode = parsed;
                        if let Err(e) = write_atomic(&self.global_state_path, &self.global_mode) {
                            tracing::error!(error = %e, "failed to persist global mode");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "rejected invalid global mode"),
                },
                UiCommand::SetSemaphoreOverride { semaphore_id, state } => {
                    self.pending_override_commands.push(OverrideCommand {
                        semaphore_id: semaphore_id.clone(),
                        state: state.clone(),
                    });
                    tracing::warn!(semaphore_id, state, "operator override requested");
                    let lane_count = self
                        .controlled_lane_counts(&[semaphore_id.clone()].into_iter().collect())
                        .await
                        .ok()
                        .and_then(|m| m.get(&semaphore_id).copied())
                        .unwrap_or(0);
                    if let Some(signal) =
                        self.override_mgr
                            .handle_ui_command(&semaphore_id, &state, lane_count, false)
                    {
                        let _ = self
                            .sim
                            .call(&RpcRequest::TrafficLight(TrafficLightOp::SetRedYellowGreenState {
                                tls_id: semaphore_id,
                                state: signal,
                            }))
                            .await;
                    }
                }
                UiCommand::SetSemaphoreTimings {
                    semaphore_id,
                    green_time,
                    yellow_time,
                } => {
                    tracing::info!(
                        semaphore_id,
                        green_time,
                        yellow_time,
                        "semaphore timing change logged only; not enforced"
                    );
                }
            }
        }
    }

    async fn process_ai_requests(&mut self, channels: &mut ControllerChannels) {
        let Ok(req) = channels.pipe_server.inbox.try_recv() else {
            return;
        };
        self.last_ai_activity = Some(Instant::now());

        let PipeRequest { request, reply_to } = req;

        if self.override_mgr.is_ai_command_blocked(&request) {
            tracing::warn!(?request, "dropping AI request: target under manual override");
            let _ = reply_to.send(Ok(serde_json::Value::Null));
            return;
        }

        let result: RpcResult = match request {
            RpcRequest::Custom(CustomOp::UpdateMaturityState { phases, run_id }) => {
                self.maturity_phases = phases;
                if let Some(id) = run_id {
                    if self.run_id == 0 {
                        self.run_id = id;
                    }
                }
                Ok(serde_json::json!(true))
            }
            RpcRequest::Custom(CustomOp::GetBatchedStepData) => {
                match self.collect_step_snapshot().await {
                    Ok(snapshot) => {
                        send_lossy(&channels.telemetry_tx, snapshot.clone(), "controller->telemetry");
                        send_lossy(&channels.analysis_tx, snapshot.clone(), "controller->analysis");
                        send_lossy(&channels.safety_tx, snapshot.clone(), "controller->safety");
                        serde_json::to_value(&snapshot)
                            .map_err(|e| RpcError::Protocol(e.to_string()))
                    }
                    Err(e) => Err(RpcError::Simulator(e.to_string())),
                }
            }
            other => self
                .sim
                .call(&other)
                .await
                .unwrap_or_else(|e| Err(RpcError::Simulator(e.to_string()))),
        };

        let _ = reply_to.send(result);
    }

    async fn process_watchdog_commands(&mut self, watchdog_rx: &mut mpsc::Receiver<WatchdogCommand>) {
        let mut last = None;
        while let Ok(cmd) = watchdog_rx.try_recv() {
            last = Some(cmd);
        }
        let Some(cmd) = last else { return };

        let Ok(known_ids) = self.known_traffic_light_ids().await else {
            return;
        };
        for tls_id in known_ids {
            if self.override_mgr.active().contains_key(&tls_id) {
                continue;
            }
            let current = self
                .sim
                .call(&RpcRequest::TrafficLight(TrafficLightOp::GetProgram {
                    tls_id: tls_id.clone(),
                }))
                .await
                .ok()
                .and_then(|r| r.ok())
                .and_then(|v| v.as_str().map(String::from));
            if current.as_deref() == Some(cmd.program_id.as_str()) {
                continue; // avoid a redundant TraCI-style call
            }
            let _ = self
                .sim
                .call(&RpcRequest::TrafficLight(TrafficLightOp::SetProgram {
                    tls_id,
                    program_id: cmd.program_id.clone(),
                }))
                .await;
        }
    }

    async fn collect_step_snapshot(&mut self) -> anyhow::Result<StepSnapshot> {
        let sim_time = self
            .sim
            .call(&RpcRequest::Simulation(SimulationOp::GetTime))
            .await?
            .unwrap_or(serde_json::json!(0.0))
            .as_f64()
            .unwrap_or(0.0);

        let lane_ids = self.string_list(RpcRequest::Lane(LaneOp::GetIdList)).await?;
        let mut lane_occupancies = BTreeMap::new();
        let mut lane_waiting_time = BTreeMap::new();
        let mut lane_vehicle_ids = BTreeMap::new();
        for lane_id in &lane_ids {
            let occ = self
                .sim
                .call(&RpcRequest::Lane(LaneOp::GetLastStepOccupancy { lane_id: lane_id.clone() }))
                .await?
                .unwrap_or(serde_json::json!(0.0))
                .as_f64()
                .unwrap_or(0.0);
            lane_occupancies.insert(lane_id.clone(), occ);

            let wait = self
                .sim
                .call(&RpcRequest::Lane(LaneOp::GetWaitingTime { lane_id: lane_id.clone() }))
                .await?
                .unwrap_or(serde_json::json!(0.0))
                .as_f64()
                .unwrap_or(0.0);
            lane_waiting_time.insert(lane_id.clone(), wait);

            let vids: BTreeSet<String> = self
                .sim
                .call(&RpcRequest::Lane(LaneOp::GetLastStepVehicleIds { lane_id: lane_id.clone() }))
                .await?
                .unwrap_or(serde_json::json!([]))
                .as_array()
                .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
                .unwrap_or_default();
            lane_vehicle_ids.insert(lane_id.clone(), vids);
        }

        let edge_ids = self.string_list(RpcRequest::Edge(EdgeOp::GetIdList)).await?;
        let mut edge_mean_speeds = BTreeMap::new();
        for edge_id in &edge_ids {
            let speed = self
                .sim
                .call(&RpcRequest::Edge(EdgeOp::GetLastStepMeanSpeed { edge_id: edge_id.clone() }))
                .await?
                .unwrap_or(serde_json::json!(0.0))
                .as_f64()
                .unwrap_or(0.0);
            edge_mean_speeds.insert(edge_id.clone(), speed);
        }

        let tls_ids = self.known_traffic_light_ids().await?;
        let mut tls_phases = BTreeMap::new();
        let mut tls_controlled_lanes = BTreeMap::new();
        let mut tls_lanes_state = BTreeMap::new();
        for tls_id in &tls_ids {
            let phase = self
                .sim
                .call(&RpcRequest::TrafficLight(TrafficLightOp::GetPhase { tls_id: tls_id.clone() }))
                .await?
                .unwrap_or(serde_json::json!(0))
                .as_i64()
                .unwrap_or(0) as i32;
            tls_phases.insert(tls_id.clone(), phase);

            let controlled: Vec<String> = self
                .sim
                .call(&RpcRequest::TrafficLight(TrafficLightOp::GetControlledLanes { tls_id: tls_id.clone() }))
                .await?
                .unwrap_or(serde_json::json!([]))
                .as_array()
                .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
                .unwrap_or_default();

            let state_str = self
                .sim
                .call(&RpcRequest::TrafficLight(TrafficLightOp::GetRedYellowGreenState { tls_id: tls_id.clone() }))
                .await?
                .unwrap_or(serde_json::json!(""))
                .as_str()
                .unwrap_or("")
                .to_string();

            let unique_sorted: BTreeSet<String> = controlled.iter().cloned().collect();
            let pairs: Vec<(String, char)> = if controlled.len() == state_str.chars().count() {
                controlled.iter().cloned().zip(state_str.chars()).collect()
            } else {
                unique_sorted.iter().cloned().zip(state_str.chars()).collect()
            };

            tls_controlled_lanes.insert(tls_id.clone(), unique_sorted.into_iter().collect());
            tls_lanes_state.insert(tls_id.clone(), pairs);
        }

        let junction_ids = self.string_list(RpcRequest::Junction(JunctionOp::GetIdList)).await?;
        let mut junction_positions = BTreeMap::new();
        for junction_id in &junction_ids {
            let v = self
                .sim
                .call(&RpcRequest::Junction(JunctionOp::GetPosition { junction_id: junction_id.clone() }))
                .await?
                .unwrap_or(serde_json::json!({"x":0.0,"y":0.0}));
            let pos = Position {
                x: v.get("x").and_then(|x| x.as_f64()).unwrap_or(0.0),
                y: v.get("y").and_then(|y| y.as_f64()).unwrap_or(0.0),
            };
            junction_positions.insert(junction_id.clone(), pos);
        }

        let teleports = self
            .sim
            .call(&RpcRequest::Simulation(SimulationOp::GetStartingTeleportIdList))
            .await?
            .unwrap_or(serde_json::json!([]))
            .as_array()
            .map(|a| a.len())
            .unwrap_or(0);

        let emergency_vehicle_ids: Vec<String> = self
            .sim
            .call(&RpcRequest::Simulation(SimulationOp::GetEmergencyStoppingVehiclesIdList))
            .await?
            .unwrap_or(serde_json::json!([]))
            .as_array()
            .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
            .unwrap_or_default();

        let mut emergency_positions = Vec::with_capacity(emergency_vehicle_ids.len());
        for vid in &emergency_vehicle_ids {
            if let Ok(v) = self
                .sim
                .call(&RpcRequest::Vehicle(crate::transport::VehicleOp::GetPosition { vehicle_id: vid.clone() }))
                .await
            {
                if let Ok(val) = v {
                    emergency_positions.push(Position {
                        x: val.get("x").and_then(|x| x.as_f64()).unwrap_or(0.0),
                        y: val.get("y").and_then(|y| y.as_f64()).unwrap_or(0.0),
                    });
                }
            }
        }

        let min_expected = self
            .sim
            .call(&RpcRequest::Simulation(SimulationOp::GetMinExpectedNumber))
            .await?
            .unwrap_or(serde_json::json!(0))
            .as_i64()
            .unwrap_or(0);

        let override_commands = std::mem::take(&mut self.pending_override_commands);

        Ok(StepSnapshot {
            run_id: self.run_id,
            sim_time,
            scenario_name: self.scenario_name.clone(),
            net_file: self.net_file.clone(),
            operation_mode: Some(self.global_mode.operation_mode),
            step_length: self.settings.simulator.step_length_secs,
            lane_occupancies,
            lane_waiting_time,
            lane_vehicle_ids,
            tls_phases,
            tls_controlled_lanes,
            tls_lanes_state,
            edge_mean_speeds,
            junction_positions,
            sim_starting_teleports_len: teleports,
            sim_emergency_stops_len: emergency_positions.len(),
            sim_emergency_stop_positions: emergency_positions,
            sim_min_expected_number: min_expected,
            maturity_phases: self.maturity_phases.clone(),
            active_overrides: self.override_mgr.active().clone(),
            override_commands,
        })
    }

    async fn string_list(&mut self, request: RpcRequest) -> anyhow::Result<Vec<String>> {
        let v = self.sim.call(&request).await?.unwrap_or(serde_json::json!([]));
        Ok(v.as_array()
            .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
            .unwrap_or_default())
    }

    async fn shutdown(mut self) {
        tracing::info!("central controller shutting down");
        let _ = self.sim.call(&RpcRequest::SystemShutdown).await;
    }
}

fn drain_nonblocking<T>(rx: &mut mpsc::Receiver<T>) {
    while rx.try_recv().is_ok() {}
}

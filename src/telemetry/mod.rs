//! Heatmap Telemetry Worker (C3): turns raw per-step state into per-edge
//! congestion, serves it to dashboard clients over a WebSocket, and
//! forwards whatever those clients send back to the Central Controller.

pub mod geometry;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::weights_watcher::SharedWeights;
use crate::config::AggregationStrategy;
use crate::model::StepSnapshot;
use crate::transport::queues::{send_lossy, UiCommand};
use geometry::NetworkTopology;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PanelState {
    Green,
    Yellow,
    Red,
}

pub fn panel_state_for_signal(signal: &str) -> PanelState {
    let lower = signal.to_ascii_lowercase();
    if lower.contains('y') || lower.contains('s') {
        PanelState::Yellow
    } else if lower.contains('g') {
        PanelState::Green
    } else {
        PanelState::Red
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct EdgeCongestion {
    pub congestion: f64,
    pub vehicle_count: usize,
    pub mean_speed_kmh: f64,
    pub flow_per_min: f64,
}

#[derive(Default)]
struct Aggregator {
    prev_lane_vehicles: BTreeMap<String, BTreeSet<String>>,
}

impl Aggregator {
    fn aggregate(
        &mut self,
        snapshot: &StepSnapshot,
        topology: &NetworkTopology,
        weights: &crate::config::weights_watcher::CongestionWeights,
        strategy: AggregationStrategy,
    ) -> BTreeMap<String, EdgeCongestion> {
        let mut out = BTreeMap::new();

        for (edge_id, lanes) in &topology.edge_to_lanes {
            if edge_id.starts_with(':') {
                continue; // internal junction edges are not surfaced on the map
            }

            let occupancies: Vec<f64> = lanes
                .iter()
                .filter_map(|l| snapshot.lane_occupancies.get(l).copied())
                .collect();
            let occ = match strategy {
                AggregationStrategy::Max => occupancies.iter().cloned().fold(0.0, f64::max),
                AggregationStrategy::Average => {
                    if occupancies.is_empty() {
                        0.0
                    } else {
                        occupancies.iter().sum::<f64>() / occupancies.len() as f64
                    }
                }
            };

            let waiting: f64 = lanes
                .iter()
                .filter_map(|l| snapshot.lane_waiting_time.get(l))
                .sum();

            let mut departed = 0usize;
            let mut vehicle_count = 0usize;
            for lane in lanes {
                let current = snapshot
                    .lane_vehicle_ids
                    .get(lane)
                    .cloned()
                    .unwrap_or_default();
                vehicle_count += current.len();
                if let Some(prev) = self.prev_lane_vehicles.get(lane) {
                    departed += prev.difference(&current).count();
                }
                self.prev_lane_vehicles.insert(lane.clone(), current);
            }

            let flow_per_min = if snapshot.step_length > 0.0 {
                departed as f64 * (60.0 / snapshot.step_length)
            } else {
                0.0
            };

            let congestion = weights.weight_occupancy * (occ * 100.0)
                + weights.weight_waiting_time * waiting
                + weights.weight_flow * departed as f64;

            let mean_speed_kmh = snapshot
                .edge_mean_speeds
                .get(edge_id)
                .copied()
                .unwrap_or(0.0)
                * 3.6;

            out.insert(
                edge_id.clone(),
                EdgeCongestion {
                    congestion,
                    vehicle_count,
                    mean_speed_kmh,
                    flow_per_min,
                },
            );
        }

        out
    }
}

fn panel_data(snapshot: &StepSnapshot) -> BTreeMap<String, PanelState> {
    snapshot
        .tls_lanes_state
        .iter()
        .map(|(tls_id, pairs)| {
            let signal: String = pairs.iter().map(|(_, c)| *c).collect();
            (tls_id.clone(), panel_state_for_signal(&signal))
        })
        .collect()
}

struct TelemetryState {
    weights: SharedWeights,
    strategy: AggregationStrategy,
    latest_geometry: RwLock<Option<serde_json::Value>>,
    latest_frame: RwLock<Option<serde_json::Value>>,
    ui_tx: mpsc::Sender<UiCommand>,
}

#[derive(Clone)]
struct AppState {
    inner: Arc<TelemetryState>,
    broadcast: broadcast::Sender<String>,
}

pub async fn run_telemetry_worker(
    bind_addr: String,
    mut snapshot_rx: mpsc::Receiver<StepSnapshot>,
    ui_tx: mpsc::Sender<UiCommand>,
    weights: SharedWeights,
    strategy: AggregationStrategy,
    cancel: CancellationToken,
) {
    let (broadcast_tx, _) = broadcast::channel(128);
    let state = AppState {
        inner: Arc::new(TelemetryState {
            weights,
            strategy,
            latest_geometry: RwLock::new(None),
            latest_frame: RwLock::new(None),
            ui_tx,
        }),
        broadcast: broadcast_tx.clone(),
    };

    let app = Router::new()
        .route("/ws/telemetry", get(ws_handler))
        .with_state(state.clone());

    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, bind_addr, "telemetry worker failed to bind, aborting");
            return;
        }
    };
    tracing::info!(bind_addr, "telemetry websocket server listening");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    let mut topology_cache: Option<(String, NetworkTopology)> = None;
    let mut aggregator = Aggregator::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe_snapshot = snapshot_rx.recv() => {
                let Some(snapshot) = maybe_snapshot else { break };

                if topology_cache.as_ref().map(|(p, _)| p != &snapshot.net_file).unwrap_or(true) {
                    match geometry::parse_network_file(&snapshot.net_file) {
                        Ok(topo) => {
                            let geom = serde_json::json!({ "nodes": topo.nodes, "edges": topo.edges });
                            *state.inner.latest_geometry.write().await = Some(geom);
                            topology_cache = Some((snapshot.net_file.clone(), topo));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, net_file = %snapshot.net_file, "failed to parse net file, skipping step");
                            continue;
                        }
                    }
                }

                let Some((_, topo)) = &topology_cache else { continue };
                let weights = state.inner.weights.load();
                let congestion = aggregator.aggregate(&snapshot, topo, &weights, state.inner.strategy);
                let panels = panel_data(&snapshot);

                let frame = serde_json::json!({
                    "type": "congestion_update",
                    "payload": congestion,
                    "panel_data": panels,
                    "street_data": snapshot.edge_mean_speeds,
                    "maturity_phases": snapshot.maturity_phases,
                });
                *state.inner.latest_frame.write().await = Some(frame.clone());
                let _ = state.broadcast.send(frame.to_string());
            }
        }
    }

    let _ = server.await;
    tracing::info!("telemetry worker stopped");
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let geometry = state.inner.latest_geometry.read().await.clone();
    let last_frame = state.inner.latest_frame.read().await.clone();

    let initial = serde_json::json!({
        "type": "initial_map_geometry",
        "geometry": geometry.unwrap_or(serde_json::json!({"nodes": [], "edges": []})),
        "congestion_update": last_frame.as_ref().and_then(|f| f.get("payload")).cloned().unwrap_or(serde_json::json!({})),
        "panel_data": last_frame.as_ref().and_then(|f| f.get("panel_data")).cloned().unwrap_or(serde_json::json!({})),
        "street_data": last_frame.as_ref().and_then(|f| f.get("street_data")).cloned().unwrap_or(serde_json::json!({})),
        "maturity_phases": last_frame.as_ref().and_then(|f| f.get("maturity_phases")).cloned().unwrap_or(serde_json::json!({})),
    });

    if socket.send(Message::Text(initial.to_string())).await.is_err() {
        return;
    }

    let mut rx = state.broadcast.subscribe();
    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Ok(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => forward_command(&state, &text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn forward_command(state: &AppState, text: &str) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "malformed operator command, dropping");
            return;
        }
    };
    let cmd: UiCommand = match serde_json::from_value(value) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "unrecognized operator command shape, dropping");
            return;
        }
    };
    send_lossy(&state.inner.ui_tx, cmd, "telemetry->controller");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panel_state_precedence_yellow_beats_green() {
        assert_eq!(panel_state_for_signal("GgYr"), PanelState::Yellow);
        assert_eq!(panel_state_for_signal("GGgg"), PanelState::Green);
        assert_eq!(panel_state_for_signal("rrrr"), PanelState::Red);
        assert_eq!(panel_state_for_signal("oooo"), PanelState::Red);
    }

    #[test]
    fn single_lane_edge_aggregates_to_its_own_occupancy() {
        let mut topo = NetworkTopology::default();
        topo.edge_to_lanes.insert("E1".to_string(), vec!["E1_0".to_string()]);

        let mut snapshot = StepSnapshot::default();
        snapshot.step_length = 1.0;
        snapshot.lane_occupancies.insert("E1_0".to_string(), 0.42);

        let weights = crate::config::weights_watcher::CongestionWeights {
            weight_occupancy: 1.0,
            weight_waiting_time: 0.0,
            weight_flow: 0.0,
        };

        let mut agg = Aggregator::default();
        let result_max = agg.aggregate(&snapshot, &topo, &weights, AggregationStrategy::Max);
        let result_avg = agg.aggregate(&snapshot, &topo, &weights, AggregationStrategy::Average);
        assert_eq!(result_max["E1"].congestion, result_avg["E1"].congestion);
        assert!((result_max["E1"].congestion - 42.0).abs() < 1e-9);
    }
}

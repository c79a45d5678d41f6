//! Exercises the telemetry WebSocket surface end to end: a client connecting
//! mid-stream gets a full initial frame, a fresh snapshot produces a
//! congestion update broadcast, and operator commands sent over the socket
//! reach the controller-bound queue.

use std::time::Duration;

use carina_controller::config::weights_watcher::{shared, CongestionWeights};
use carina_controller::config::AggregationStrategy;
use carina_controller::model::StepSnapshot;
use carina_controller::telemetry::run_telemetry_worker;
use carina_controller::transport::queues::{ui_command_channel, UiCommand};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const BIND_ADDR: &str = "127.0.0.1:19191";

fn sample_net_file() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let xml = r#"<net>
        <junction id="J1" x="0.0" y="0.0" type="priority"/>
        <edge id="E1" from="J1" to="J2">
            <lane id="E1_0" index="0"/>
        </edge>
    </net>"#;
    std::fs::write(dir.path().join("net.xml"), xml).unwrap();
    dir
}

#[tokio::test]
async fn initial_frame_then_congestion_update_then_operator_command() {
    let (_snapshot_tx, snapshot_rx) = tokio::sync::mpsc::channel::<StepSnapshot>(4);
    let (ui_tx, mut ui_rx) = ui_command_channel(4);
    let weights = shared(CongestionWeights {
        weight_occupancy: 1.0,
        weight_waiting_time: 0.0,
        weight_flow: 0.0,
    });
    let cancel = CancellationToken::new();

    let worker_cancel = cancel.clone();
    let worker = tokio::spawn(run_telemetry_worker(
        BIND_ADDR.to_string(),
        snapshot_rx,
        ui_tx,
        weights,
        AggregationStrategy::Max,
        worker_cancel,
    ));

    // Give the listener a moment to bind before connecting.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut ws, _) = connect_async(format!("ws://{BIND_ADDR}/ws/telemetry"))
        .await
        .expect("websocket handshake should succeed");

    let first = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("initial frame should arrive")
        .expect("stream should not close")
        .expect("frame should not error");
    let Message::Text(text) = first else { panic!("expected a text frame") };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "initial_map_geometry");

    let net_dir = sample_net_file();
    let mut snapshot = StepSnapshot::default();
    snapshot.net_file = net_dir.path().join("net.xml").to_string_lossy().to_string();
    snapshot.step_length = 1.0;
    snapshot.lane_occupancies.insert("E1_0".to_string(), 0.7);
    _snapshot_tx.send(snapshot).await.unwrap();

    let second = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("congestion update should arrive")
        .expect("stream should not close")
        .expect("frame should not error");
    let Message::Text(text) = second else { panic!("expected a text frame") };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "congestion_update");
    assert!(value["payload"]["E1"]["congestion"].as_f64().unwrap() > 0.0);

    let command = serde_json::json!({
        "type": "SetGlobalMode",
        "payload": { "mode": "MANUAL" }
    });
    ws.send(Message::Text(command.to_string())).await.unwrap();

    let forwarded = tokio::time::timeout(Duration::from_secs(2), ui_rx.recv())
        .await
        .expect("operator command should be forwarded")
        .expect("channel should not close");
    assert!(matches!(forwarded, UiCommand::SetGlobalMode { mode } if mode == "MANUAL"));

    drop(ws);
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), worker).await;
}

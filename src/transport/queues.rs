//! One-way, bounded fan-out queues between tasks. Telemetry and analysis
//! feeds are lossy-tolerant by design (durability belongs to the event
//! store): a full queue drops the newest item and logs a warning rather
//! than applying backpressure to the Central Controller's step loop.

use tokio::sync::mpsc;

use crate::model::StepSnapshot;

pub const DEFAULT_CAPACITY: usize = 64;

/// Wraps `try_send`, logging and dropping on a full queue instead of
/// propagating backpressure into the caller's hot loop.
pub fn send_lossy<T>(tx: &mpsc::Sender<T>, item: T, queue_name: &str) {
    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(item) {
        tracing::warn!(queue = queue_name, "queue full, dropping item");
    }
    // Closed is treated the same as a normal shutdown race; nothing to log.
}

pub fn snapshot_channel(capacity: usize) -> (mpsc::Sender<StepSnapshot>, mpsc::Receiver<StepSnapshot>) {
    mpsc::channel(capacity)
}

/// Operator command forwarded from the telemetry WebSocket to the
/// controller. One-way edge only: the controller never holds a handle
/// back into the telemetry worker's internals.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum UiCommand {
    SaveSettings(serde_json::Value),
    SetGlobalMode { mode: String },
    SetSemaphoreOverride { semaphore_id: String, state: String },
    SetSemaphoreTimings {
        semaphore_id: String,
        green_time: f64,
        yellow_time: f64,
    },
}

pub fn ui_command_channel(capacity: usize) -> (mpsc::Sender<UiCommand>, mpsc::Receiver<UiCommand>) {
    mpsc::channel(capacity)
}

/// Coalesced failsafe command from the Watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogCommand {
    pub program_id: String,
}

pub fn watchdog_channel(capacity: usize) -> (mpsc::Sender<WatchdogCommand>, mpsc::Receiver<WatchdogCommand>) {
    mpsc::channel(capacity)
}

/// Advisory veto from the Safety Arbiter, keyed by traffic light.
#[derive(Debug, Clone)]
pub struct SafetyVeto {
    pub traffic_light_id: String,
    pub vetoed_phase: i32,
}

pub fn veto_channel(capacity: usize) -> (mpsc::Sender<SafetyVeto>, mpsc::Receiver<SafetyVeto>) {
    mpsc::channel(capacity)
}

/// Payload handed to the Event Store. `Shutdown` is the typed sentinel
/// that terminates the worker loop (Rust channels don't carry a `None`
/// value through a non-`Option` type the way the source's queue sentinel
/// did, so it gets its own explicit variant instead).
#[derive(Debug, Clone)]
pub enum EventStorePayload {
    LogEpisode(crate::model::Episode),
    LogReport(crate::model::AnalysisReport),
    LogRun(crate::model::Run),
    Shutdown,
}

pub fn event_store_channel(
    capacity: usize,
) -> (mpsc::Sender<EventStorePayload>, mpsc::Receiver<EventStorePayload>) {
    mpsc::channel(capacity)
}

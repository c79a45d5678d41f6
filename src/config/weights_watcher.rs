//! Polling watcher for the heatmap congestion weights hint file.
//!
//! Checks the file's mtime on a fixed interval, debounces to avoid reading a
//! partially-written file, then swaps the new weights into an `ArcSwap` for
//! lock-free reads from the telemetry hot path. Consistent with the config
//! hot-reload watcher elsewhere in this codebase — no external crate needed
//! just to watch one small JSON file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

const DEBOUNCE_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CongestionWeights {
    pub weight_occupancy: f64,
    pub weight_waiting_time: f64,
    pub weight_flow: f64,
}

impl CongestionWeights {
    pub fn from_settings(t: &crate::config::TelemetrySettings) -> Self {
        Self {
            weight_occupancy: t.weight_occupancy,
            weight_waiting_time: t.weight_waiting_time,
            weight_flow: t.weight_flow,
        }
    }
}

/// Shared handle consumers can cheaply clone and read from without locking.
pub type SharedWeights = Arc<ArcSwap<CongestionWeights>>;

pub fn shared(initial: CongestionWeights) -> SharedWeights {
    Arc::new(ArcSwap::from_pointee(initial))
}

/// Poll `path` for changes and update `weights` in place. Runs until the
/// task is cancelled (the caller is expected to abort it on shutdown).
pub async fn run_weights_watcher(path: PathBuf, weights: SharedWeights, poll_interval: Duration) {
    tracing::info!(path = %path.display(), "heatmap weights watcher started");
    let mut last_mtime = mtime(&path);

    loop {
        tokio::time::sleep(poll_interval).await;

        let current = match mtime(&path) {
            Some(t) => t,
            None => continue,
        };

        let changed = last_mtime != Some(current);
        if !changed {
            continue;
        }

        tokio::time::sleep(DEBOUNCE_DELAY).await;
        if mtime(&path) != Some(current) {
            continue; // still being written, wait for next poll cycle
        }
        last_mtime = Some(current);

        match load(&path) {
            Ok(w) => {
                tracing::info!(?w, "heatmap weights reloaded");
                weights.store(Arc::new(w));
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to reload heatmap weights, keeping previous");
            }
        }
    }
}

fn load(path: &std::path::Path) -> anyhow::Result<CongestionWeights> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

//! Process-wide settings, loaded once at startup.
//!
//! Mirrors the init()/get() singleton shape used throughout this codebase:
//! `init()` is called exactly once by the launcher before any task starts,
//! `get()` panics if called earlier — that is a startup bug, not a runtime
//! condition to recover from.

pub mod weights_watcher;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

static SETTINGS: OnceLock<Settings> = OnceLock::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    pub host: String,
    pub port: u16,
    pub connect_retry_attempts: u32,
    pub connect_retry_backoff_ms: u64,
    pub step_length_secs: f64,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8813,
            connect_retry_attempts: 10,
            connect_retry_backoff_ms: 500,
            step_length_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub initial_grace_period_seconds: f64,
    pub heartbeat_timeout_seconds: f64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            initial_grace_period_seconds: 30.0,
            heartbeat_timeout_seconds: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    Max,
    Average,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub bind_addr: String,
    pub aggregation_strategy: AggregationStrategy,
    pub weight_occupancy: f64,
    pub weight_waiting_time: f64,
    pub weight_flow: f64,
    pub weights_poll_interval_secs: u64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            aggregation_strategy: AggregationStrategy::Max,
            weight_occupancy: 1.0,
            weight_waiting_time: 1.5,
            weight_flow: -0.5,
            weights_poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub initial_analysis_delay_seconds: f64,
    pub analysis_frequency_seconds: f64,
    pub junction_change_threshold_percent: f64,
    pub conflict_radius_meters: f64,
    pub calibration_min_samples: usize,
    pub warrant_min_primary_vph: f64,
    pub warrant_min_secondary_vph: f64,
    pub warrant_unacceptable_delay_secs: f64,
    pub warrant_conflict_threshold: u64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            initial_analysis_delay_seconds: 3600.0,
            analysis_frequency_seconds: 86400.0,
            junction_change_threshold_percent: 15.0,
            conflict_radius_meters: 200.0,
            calibration_min_samples: 100,
            warrant_min_primary_vph: 500.0,
            warrant_min_secondary_vph: 150.0,
            warrant_unacceptable_delay_secs: 35.0,
            warrant_conflict_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    pub results_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            results_dir: PathBuf::from("./results"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub simulator: SimulatorSettings,
    pub watchdog: WatchdogSettings,
    pub telemetry: TelemetrySettings,
    pub analysis: AnalysisSettings,
    pub storage: StorageSettings,
}

impl Settings {
    /// Load from a TOML file. A missing or malformed settings file is fatal
    /// at the launcher — only tables *present but incomplete* fall back to
    /// built-in per-field defaults via `#[serde(default)]`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("settings file not found: {}", path.display());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing settings file {}", path.display()))
    }
}

/// Initialize the global settings singleton. Safe to call only once; a
/// second call is logged and ignored rather than panicking, matching the
/// pattern used for other process-wide singletons in this codebase.
pub fn init(settings: Settings) {
    if SETTINGS.set(settings).is_err() {
        tracing::warn!("config::init called more than once, ignoring");
    }
}

/// Fetch the global settings. Panics if `init` has not run yet — this is a
/// startup bug, not a recoverable runtime error.
pub fn get() -> &'static Settings {
    SETTINGS
        .get()
        .expect("config::get() called before config::init() — this is a startup bug")
}

pub fn is_initialized() -> bool {
    SETTINGS.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let s = Settings::default();
        let text = toml::to_string(&s).unwrap();
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back.simulator.port, s.simulator.port);
        assert_eq!(back.analysis.conflict_radius_meters, 200.0);
    }

    #[test]
    fn missing_file_is_fatal() {
        let result = Settings::load(Path::new("/nonexistent/path/controller.toml"));
        assert!(result.is_err());
    }
}

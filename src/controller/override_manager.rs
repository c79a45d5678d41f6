//! Manual override state machine (§4.3): ALERT forces yellow on every
//! signal position, OFF forces red (or the off indication when supported),
//! NORMAL removes the entry and lets the Central Controller's normal phase
//! commands reach that traffic light again.

use std::path::{Path, PathBuf};

use crate::model::{OverrideKind, OverrideState};
use crate::storage::state_files::{load_or_default, write_atomic};
use crate::transport::{RpcRequest, TrafficLightOp};

pub struct OverrideManager {
    active: OverrideState,
    state_path: Option<PathBuf>,
}

impl OverrideManager {
    pub fn new() -> Self {
        Self {
            active: OverrideState::new(),
            state_path: None,
        }
    }

    /// Wires the manager to a per-scenario results directory and loads any
    /// previously persisted overrides.
    pub fn init_persistence(&mut self, results_dir: &Path, scenario_name: &str) {
        let path = results_dir.join(scenario_name).join("override_state.json");
        self.active = load_or_default(&path);
        self.state_path = Some(path);
    }

    pub fn active(&self) -> &OverrideState {
        &self.active
    }

    fn save(&self) {
        if let Some(path) = &self.state_path {
            if let Err(e) = write_atomic(path, &self.active) {
                tracing::error!(error = %e, "failed to persist override state");
            }
        }
    }

    /// Prunes any override whose traffic light no longer exists in the
    /// current scenario, then returns the signal string to apply for each
    /// remaining override, given each one's controlled-lane count.
    pub fn reconcile_and_signal_strings(
        &mut self,
        known_tls_ids: &std::collections::BTreeSet<String>,
        lane_counts: &std::collections::BTreeMap<String, usize>,
    ) -> Vec<(String, String)> {
        let stale: Vec<String> = self
            .active
            .keys()
            .filter(|id| !known_tls_ids.contains(*id))
            .cloned()
            .collect();
        if !stale.is_empty() {
            for id in &stale {
                self.active.remove(id);
            }
            self.save();
        }

        self.active
            .iter()
            .filter_map(|(id, kind)| {
                let n = *lane_counts.get(id)?;
                Some((id.clone(), signal_string_for(*kind, n)))
            })
            .collect()
    }

    /// Handles an operator command. Returns `Some(signal_string)` to apply
    /// to the simulator for ALERT/OFF, or `None` for NORMAL (nothing to
    /// apply — the controller simply stops forcing a string and normal
    /// phase commands resume next step).
    pub fn handle_ui_command(
        &mut self,
        semaphore_id: &str,
        state: &str,
        controlled_lane_count: usize,
        is_restoring: bool,
    ) -> Option<String> {
        let result = match state {
            "ALERT" => {
                self.active.insert(semaphore_id.to_string(), OverrideKind::Alert);
                Some(signal_string_for(OverrideKind::Alert, controlled_lane_count))
            }
            "OFF" => {
                self.active.insert(semaphore_id.to_string(), OverrideKind::Off);
                Some(signal_string_for(OverrideKind::Off, controlled_lane_count))
            }
            "NORMAL" => {
                self.active.remove(semaphore_id);
                None
            }
            other => {
                tracing::warn!(state = other, "unknown override state requested, ignoring");
                return None;
            }
        };
        if !is_restoring {
            self.save();
        }
        result
    }

    /// Returns true iff `request` should be dropped: a `setPhase` call
    /// targeting a traffic light currently under ALERT or OFF.
    pub fn is_ai_command_blocked(&self, request: &RpcRequest) -> bool {
        matches!(
            request,
            RpcRequest::TrafficLight(TrafficLightOp::SetPhase { tls_id, .. })
                if self.active.contains_key(tls_id)
        )
    }
}

impl Default for OverrideManager {
    fn default() -> Self {
        Self::new()
    }
}

fn signal_string_for(kind: OverrideKind, num_lights: usize) -> String {
    match kind {
        OverrideKind::Alert => "y".repeat(num_lights),
        // "o" (off) is used where the simulator supports a true off
        // indication; this implementation always has a concrete target
        // program to fall back to, so red is the conservative default.
        OverrideKind::Off => "r".repeat(num_lights),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    #[test]
    fn alert_produces_all_yellow() {
        let mut mgr = OverrideManager::new();
        let applied = mgr.handle_ui_command("J1", "ALERT", 4, false);
        assert_eq!(applied, Some("yyyy".to_string()));
        assert_eq!(mgr.active().get("J1"), Some(&OverrideKind::Alert));
    }

    #[test]
    fn off_produces_all_red() {
        let mut mgr = OverrideManager::new();
        let applied = mgr.handle_ui_command("J1", "OFF", 3, false);
        assert_eq!(applied, Some("rrr".to_string()));
    }

    #[test]
    fn normal_clears_override() {
        let mut mgr = OverrideManager::new();
        mgr.handle_ui_command("J1", "ALERT", 4, false);
        let applied = mgr.handle_ui_command("J1", "NORMAL", 4, false);
        assert_eq!(applied, None);
        assert!(mgr.active().is_empty());
    }

    #[test]
    fn blocks_set_phase_on_overridden_light_only() {
        let mut mgr = OverrideManager::new();
        mgr.handle_ui_command("J1", "ALERT", 4, false);

        let blocked = RpcRequest::TrafficLight(TrafficLightOp::SetPhase {
            tls_id: "J1".to_string(),
            phase: 2,
        });
        let allowed = RpcRequest::TrafficLight(TrafficLightOp::SetPhase {
            tls_id: "J2".to_string(),
            phase: 2,
        });
        let other_op = RpcRequest::TrafficLight(TrafficLightOp::GetPhase {
            tls_id: "J1".to_string(),
        });

        assert!(mgr.is_ai_command_blocked(&blocked));
        assert!(!mgr.is_ai_command_blocked(&allowed));
        assert!(!mgr.is_ai_command_blocked(&other_op));
    }

    #[test]
    fn stale_overrides_are_pruned_on_reconcile() {
        let mut mgr = OverrideManager::new();
        mgr.handle_ui_command("GONE", "ALERT", 4, false);
        mgr.handle_ui_command("STAYS", "OFF", 2, false);

        let known: BTreeSet<String> = ["STAYS".to_string()].into_iter().collect();
        let lanes: BTreeMap<String, usize> = [("STAYS".to_string(), 2)].into_iter().collect();

        let applied = mgr.reconcile_and_signal_strings(&known, &lanes);
        assert_eq!(applied, vec![("STAYS".to_string(), "rr".to_string())]);
        assert!(!mgr.active().contains_key("GONE"));
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = OverrideManager::new();
        mgr.init_persistence(dir.path(), "scenario1");
        mgr.handle_ui_command("J1", "ALERT", 4, false);

        let mut reloaded = OverrideManager::new();
        reloaded.init_persistence(dir.path(), "scenario1");
        assert_eq!(reloaded.active().get("J1"), Some(&OverrideKind::Alert));
    }
}

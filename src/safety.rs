//! Safety Arbiter Worker (C5): a narrow, swappable policy that watches the
//! latest step snapshot and vetoes phase changes that would violate a hard
//! safety bound, independent of whatever the AI control path decides.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::StepSnapshot;
use crate::transport::queues::{send_lossy, SafetyVeto};

/// Abstract policy boundary: the reference implementation below is one
/// concrete choice, not the only one the arbiter could run.
pub trait SafetyPolicy: Send + Sync {
    /// Inspects the latest snapshot and returns vetoes to raise this tick.
    fn evaluate(&mut self, snapshot: &StepSnapshot) -> Vec<SafetyVeto>;
}

/// Vetoes any traffic light holding the same phase for longer than
/// `max_phase_hold_secs`. This is a minimal reference policy, not a
/// complete safety model — it catches stuck-phase failures and nothing
/// else.
pub struct MaxPhaseHoldPolicy {
    max_phase_hold_secs: f64,
    step_length: f64,
    phase_hold_ticks: BTreeMap<String, (i32, u64)>,
}

impl MaxPhaseHoldPolicy {
    pub fn new(max_phase_hold_secs: f64, step_length: f64) -> Self {
        Self {
            max_phase_hold_secs,
            step_length,
            phase_hold_ticks: BTreeMap::new(),
        }
    }
}

impl SafetyPolicy for MaxPhaseHoldPolicy {
    fn evaluate(&mut self, snapshot: &StepSnapshot) -> Vec<SafetyVeto> {
        let max_ticks = if self.step_length > 0.0 {
            (self.max_phase_hold_secs / self.step_length).ceil() as u64
        } else {
            u64::MAX
        };

        let mut vetoes = Vec::new();
        for (tls_id, &phase) in &snapshot.tls_phases {
            let entry = self.phase_hold_ticks.entry(tls_id.clone()).or_insert((phase, 0));
            if entry.0 == phase {
                entry.1 += 1;
            } else {
                *entry = (phase, 0);
            }

            if entry.1 >= max_ticks {
                vetoes.push(SafetyVeto {
                    traffic_light_id: tls_id.clone(),
                    vetoed_phase: phase,
                });
            }
        }
        vetoes
    }
}

pub async fn run_safety_worker(
    mut policy: Box<dyn SafetyPolicy>,
    mut snapshot_rx: mpsc::Receiver<StepSnapshot>,
    veto_tx: mpsc::Sender<SafetyVeto>,
    cancel: CancellationToken,
) {
    tracing::info!("safety arbiter started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe_snapshot = snapshot_rx.recv() => {
                let Some(snapshot) = maybe_snapshot else { break };
                for veto in policy.evaluate(&snapshot) {
                    tracing::warn!(
                        traffic_light_id = %veto.traffic_light_id,
                        phase = veto.vetoed_phase,
                        "safety arbiter vetoing phase hold"
                    );
                    send_lossy(&veto_tx, veto, "safety->controller");
                }
            }
        }
    }
    tracing::info!("safety arbiter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_phase(tls: &str, phase: i32) -> StepSnapshot {
        let mut s = StepSnapshot::default();
        s.step_length = 1.0;
        s.tls_phases.insert(tls.to_string(), phase);
        s
    }

    #[test]
    fn stable_phase_under_limit_does_not_veto() {
        let mut policy = MaxPhaseHoldPolicy::new(10.0, 1.0);
        for _ in 0..5 {
            let vetoes = policy.evaluate(&snapshot_with_phase("J1", 2));
            assert!(vetoes.is_empty());
        }
    }

    #[test]
    fn phase_held_past_limit_triggers_veto() {
        let mut policy = MaxPhaseHoldPolicy::new(3.0, 1.0);
        let mut last = Vec::new();
        for _ in 0..5 {
            last = policy.evaluate(&snapshot_with_phase("J1", 2));
        }
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].traffic_light_id, "J1");
        assert_eq!(last[0].vetoed_phase, 2);
    }

    #[test]
    fn phase_change_resets_hold_counter() {
        let mut policy = MaxPhaseHoldPolicy::new(3.0, 1.0);
        for _ in 0..4 {
            policy.evaluate(&snapshot_with_phase("J1", 2));
        }
        let vetoes = policy.evaluate(&snapshot_with_phase("J1", 3));
        assert!(vetoes.is_empty());
    }
}

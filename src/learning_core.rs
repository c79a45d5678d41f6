//! Learning Core Worker (C6) reference client: the system ships usable
//! end-to-end without an actual trained model attached, by way of a
//! deterministic round-robin policy that speaks the same command-pipe
//! contract a real learning core would.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::{Episode, MaturityPhase};
use crate::transport::pipe::CommandPipeClient;
use crate::transport::queues::{send_lossy, EventStorePayload, SafetyVeto};
use crate::transport::{CustomOp, RpcRequest, TrafficLightOp};

/// What a learning core needs to decide next-phase commands. The reference
/// implementation below is a stand-in for a trained model — any real policy
/// plugs in here without touching the command-pipe or episode-logging
/// plumbing.
pub trait LearningPolicy: Send + Sync {
    /// Chooses the next phase for each traffic light it knows about, given
    /// the latest batched step data from the controller.
    fn decide(&mut self, step_data: &serde_json::Value) -> BTreeMap<String, i32>;

    /// Synthetic or real maturity classification per traffic light, reported
    /// back to the controller for telemetry display.
    fn maturity_phases(&self) -> BTreeMap<String, MaturityPhase>;

    /// Reward signal for the step just observed, used for episode logging.
    fn reward(&self, step_data: &serde_json::Value) -> f64;
}

/// Cycles each known traffic light through phases 0..`phase_count` on a
/// fixed schedule, reporting maturity as a function of how many decisions
/// it has made. Reward is the negative sum of lane waiting times, the same
/// signal the original control-plane's default reward shaping used.
pub struct RoundRobinPolicy {
    phase_count: i32,
    decisions_made: BTreeMap<String, u64>,
}

impl RoundRobinPolicy {
    pub fn new(phase_count: i32) -> Self {
        Self {
            phase_count: phase_count.max(1),
            decisions_made: BTreeMap::new(),
        }
    }
}

impl LearningPolicy for RoundRobinPolicy {
    fn decide(&mut self, step_data: &serde_json::Value) -> BTreeMap<String, i32> {
        let Some(tls_phases) = step_data.get("tls_phases").and_then(|v| v.as_object()) else {
            return BTreeMap::new();
        };

        let mut out = BTreeMap::new();
        for tls_id in tls_phases.keys() {
            let count = self.decisions_made.entry(tls_id.clone()).or_insert(0);
            *count += 1;
            out.insert(tls_id.clone(), (*count % self.phase_count as u64) as i32);
        }
        out
    }

    fn maturity_phases(&self) -> BTreeMap<String, MaturityPhase> {
        self.decisions_made
            .iter()
            .map(|(id, count)| {
                let phase = match count {
                    0..=49 => MaturityPhase::Child,
                    50..=199 => MaturityPhase::Teen,
                    _ => MaturityPhase::Adult,
                };
                (id.clone(), phase)
            })
            .collect()
    }

    fn reward(&self, step_data: &serde_json::Value) -> f64 {
        let total_waiting: f64 = step_data
            .get("lane_waiting_time")
            .and_then(|v| v.as_object())
            .map(|m| m.values().filter_map(|v| v.as_f64()).sum())
            .unwrap_or(0.0);
        -total_waiting
    }
}

pub async fn run_learning_core_worker(
    pipe_client: CommandPipeClient,
    mut veto_rx: mpsc::Receiver<SafetyVeto>,
    event_store_tx: mpsc::Sender<EventStorePayload>,
    mut policy: Box<dyn LearningPolicy>,
    run_id: u64,
    decision_interval: Duration,
    episode_length_decisions: u64,
    cancel: CancellationToken,
) {
    tracing::info!("learning core worker started");
    let mut interval = tokio::time::interval(decision_interval);
    let mut episode_number = 0u64;
    let mut episode_reward = 0.0;
    let mut episode_decisions = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let mut active_vetoes: BTreeMap<String, i32> = BTreeMap::new();
                while let Ok(veto) = veto_rx.try_recv() {
                    active_vetoes.insert(veto.traffic_light_id, veto.vetoed_phase);
                }

                let step_data = match pipe_client.call(RpcRequest::Custom(CustomOp::GetBatchedStepData)).await {
                    Ok(Ok(value)) => value,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "controller rejected batched step data request");
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "command pipe call failed, stopping learning core");
                        break;
                    }
                };

                episode_reward += policy.reward(&step_data);
                episode_decisions += 1;

                let decisions = policy.decide(&step_data);
                for (tls_id, phase) in decisions {
                    if active_vetoes.get(&tls_id) == Some(&phase) {
                        tracing::warn!(tls_id, phase, "skipping vetoed phase decision");
                        continue;
                    }
                    let _ = pipe_client
                        .call(RpcRequest::TrafficLight(TrafficLightOp::SetPhase { tls_id, phase }))
                        .await;
                }

                let _ = pipe_client
                    .call(RpcRequest::Custom(CustomOp::UpdateMaturityState {
                        phases: policy.maturity_phases(),
                        run_id: Some(run_id),
                    }))
                    .await;

                if episode_decisions >= episode_length_decisions {
                    episode_number += 1;
                    send_lossy(
                        &event_store_tx,
                        EventStorePayload::LogEpisode(Episode {
                            episode_id: 0, // assigned by the event store
                            run_id,
                            episode_number,
                            total_reward: episode_reward,
                            end_time: chrono::Utc::now(),
                        }),
                        "learning_core->event_store",
                    );
                    episode_reward = 0.0;
                    episode_decisions = 0;
                }
            }
        }
    }

    let _ = pipe_client.call(RpcRequest::SystemShutdown).await;
    tracing::info!("learning core worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_phases() {
        let mut policy = RoundRobinPolicy::new(3);
        let step_data = serde_json::json!({ "tls_phases": { "J1": 0 } });

        let mut seen = Vec::new();
        for _ in 0..4 {
            let decided = policy.decide(&step_data);
            seen.push(decided["J1"]);
        }
        assert_eq!(seen, vec![1, 2, 0, 1]);
    }

    #[test]
    fn maturity_advances_with_decision_count() {
        let mut policy = RoundRobinPolicy::new(2);
        let step_data = serde_json::json!({ "tls_phases": { "J1": 0 } });
        for _ in 0..60 {
            policy.decide(&step_data);
        }
        assert_eq!(policy.maturity_phases()["J1"], MaturityPhase::Teen);
    }

    #[test]
    fn reward_is_negative_total_waiting_time() {
        let policy = RoundRobinPolicy::new(2);
        let step_data = serde_json::json!({
            "lane_waiting_time": { "a": 5.0, "b": 2.5 }
        });
        assert_eq!(policy.reward(&step_data), -7.5);
    }
}

//! Durable Event Store (C1): an append-only record of simulation runs,
//! episodes, and analysis reports.
//!
//! Realized as three named `sled::Tree`s inside one `sled::Db`, the direct
//! KV analogue of the relational schema's three tables — each row keyed by
//! an autoincrement id generated via `Tree::generate_id()` so keys sort
//! chronologically, the same tree-per-stream convention used for the
//! acknowledgement and history stores elsewhere in this codebase.

use std::sync::Arc;

use crate::errors::StorageError;
use crate::model::{AnalysisReport, Episode, Run};
use crate::transport::queues::EventStorePayload;

const RUNS_TREE: &str = "simulation_runs";
const EPISODES_TREE: &str = "episodes";
const REPORTS_TREE: &str = "analysis_reports";

#[derive(Clone)]
pub struct EventStore {
    db: Arc<sled::Db>,
}

impl EventStore {
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        // Idempotent: opening the same trees twice is a no-op, schema creation
        // is implicit in sled and requires no separate migration step.
        db.open_tree(RUNS_TREE)?;
        db.open_tree(EPISODES_TREE)?;
        db.open_tree(REPORTS_TREE)?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn log_run(&self, run: &Run) -> Result<(), StorageError> {
        self.insert(RUNS_TREE, run)
    }

    pub fn log_episode(&self, episode: &Episode) -> Result<(), StorageError> {
        self.insert(EPISODES_TREE, episode)
    }

    pub fn log_report(&self, report: &AnalysisReport) -> Result<(), StorageError> {
        self.insert(REPORTS_TREE, report)
    }

    fn insert<T: serde::Serialize>(&self, tree_name: &str, value: &T) -> Result<(), StorageError> {
        let tree = self.db.open_tree(tree_name)?;
        let id = self.db.generate_id()?;
        let key = id.to_be_bytes();
        let bytes = serde_json::to_vec(value)?;
        tree.insert(key, bytes)?;
        Ok(())
    }

    pub fn recent_reports(&self, limit: usize) -> Vec<AnalysisReport> {
        self.recent(REPORTS_TREE, limit)
    }

    pub fn recent_episodes(&self, limit: usize) -> Vec<Episode> {
        self.recent(EPISODES_TREE, limit)
    }

    fn recent<T: serde::de::DeserializeOwned>(&self, tree_name: &str, limit: usize) -> Vec<T> {
        let tree = match self.db.open_tree(tree_name) {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        };
        tree.iter()
            .rev()
            .take(limit)
            .filter_map(|item| item.ok().and_then(|(_, v)| serde_json::from_slice(&v).ok()))
            .collect()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Runs the Event Store worker loop: drains the inbound queue and persists
/// each payload, swallowing and logging per-record failures so one bad
/// record never takes the worker down. Terminates on `EventStorePayload::Shutdown`.
pub async fn run_event_store(
    store: EventStore,
    mut inbox: tokio::sync::mpsc::Receiver<EventStorePayload>,
) {
    tracing::info!("event store worker started");
    while let Some(payload) = inbox.recv().await {
        let result = match payload {
            EventStorePayload::LogRun(run) => store.log_run(&run),
            EventStorePayload::LogEpisode(episode) => store.log_episode(&episode),
            EventStorePayload::LogReport(report) => store.log_report(&report),
            EventStorePayload::Shutdown => {
                tracing::info!("event store worker received shutdown sentinel");
                break;
            }
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to persist event store record, continuing");
        }
    }
    if let Err(e) = store.flush() {
        tracing::warn!(error = %e, "event store flush on shutdown failed");
    }
    tracing::info!("event store worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_run() -> Run {
        Run {
            run_id: 1,
            start_time: Utc::now(),
            scenario_name: "demo".to_string(),
        }
    }

    #[test]
    fn open_creates_all_trees_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(dir.path()).unwrap();
        store.log_run(&sample_run()).unwrap();
        drop(store);
        let store2 = EventStore::open(dir.path()).unwrap();
        assert_eq!(store2.recent_reports(10).len(), 0);
    }

    #[test]
    fn reports_come_back_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(dir.path()).unwrap();
        for i in 0..3u64 {
            store
                .log_report(&AnalysisReport {
                    report_id: i,
                    run_id: 1,
                    timestamp: Utc::now(),
                    summary: format!("report {i}"),
                    report_content: String::new(),
                })
                .unwrap();
        }
        let recent = store.recent_reports(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].summary, "report 2");
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(dir.path()).unwrap();
        let (tx, rx) = crate::transport::queues::event_store_channel(8);
        let handle = tokio::spawn(run_event_store(store.clone(), rx));
        tx.send(EventStorePayload::LogRun(sample_run())).await.unwrap();
        tx.send(EventStorePayload::Shutdown).await.unwrap();
        handle.await.unwrap();
        assert_eq!(store.recent_reports(10).len(), 0);
    }
}

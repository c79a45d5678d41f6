//! Launcher (C9): parses configuration, opens durable storage, wires every
//! inter-task channel, and supervises the control-plane tasks under a
//! single `JoinSet` until a shutdown signal or fatal task error.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use carina_controller::config::{self, weights_watcher, Settings};
use carina_controller::controller::{CentralController, ControllerChannels};
use carina_controller::learning_core::{run_learning_core_worker, RoundRobinPolicy};
use carina_controller::safety::{run_safety_worker, MaxPhaseHoldPolicy};
use carina_controller::storage::event_store::{run_event_store, EventStore};
use carina_controller::storage::lockfile::ProcessLock;
use carina_controller::telemetry::run_telemetry_worker;
use carina_controller::transport::pipe;
use carina_controller::transport::queues::{
    event_store_channel, snapshot_channel, ui_command_channel, veto_channel, watchdog_channel,
};
use carina_controller::watchdog::run_watchdog;

#[derive(Parser, Debug)]
#[command(name = "carina-controller")]
#[command(about = "Traffic signal control plane: simulator arbitration, overrides, telemetry, and analysis")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML settings file.
    #[arg(long, default_value = "controller.toml")]
    config: PathBuf,

    /// Wipe the durable event store and all results files before starting.
    /// Destructive; intended for test runs, not production restarts.
    #[arg(long)]
    reset_data: bool,
}

/// Long enough that a normal phase cycle never trips it, short enough to
/// catch a genuinely stuck phase well before an operator would notice.
const SAFETY_MAX_PHASE_HOLD_SECS: f64 = 180.0;
const LEARNING_CORE_DECISION_INTERVAL: Duration = Duration::from_millis(500);
const LEARNING_CORE_EPISODE_LENGTH_DECISIONS: u64 = 200;
const LEARNING_CORE_PHASE_COUNT: i32 = 4;
const COMMAND_PIPE_CAPACITY: usize = 32;

fn should_reset_data(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    std::env::var("CARINA_RESET_DATA")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

fn reset_data_directories(settings: &Settings) -> Result<()> {
    for dir in [&settings.storage.data_dir, &settings.storage.results_dir] {
        if dir.exists() {
            warn!(path = %dir.display(), "reset requested, removing directory");
            std::fs::remove_dir_all(dir)
                .with_context(|| format!("removing {}", dir.display()))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let settings = Settings::load(&args.config)?;

    if should_reset_data(args.reset_data) {
        reset_data_directories(&settings)?;
    }

    config::init(settings.clone());
    info!("carina-controller starting up");

    let _process_lock =
        ProcessLock::acquire(&settings.storage.data_dir).context("acquiring process lock")?;

    let event_store = EventStore::open(settings.storage.data_dir.join("events"))
        .context("opening event store")?;

    let cancel = CancellationToken::new();
    let shutdown_token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        shutdown_token.cancel();
    });

    let (pipe_client, pipe_server) = pipe::channel(COMMAND_PIPE_CAPACITY);
    let (ui_tx, ui_rx) = ui_command_channel(16);
    let (watchdog_tx, watchdog_rx) = watchdog_channel(4);
    let (veto_tx, veto_rx) = veto_channel(16);
    let (event_store_tx, event_store_rx) = event_store_channel(64);
    let (telemetry_tx, telemetry_rx) = snapshot_channel(8);
    let (analysis_tx, analysis_rx) = snapshot_channel(8);
    let (safety_tx, safety_rx) = snapshot_channel(8);

    let weights = weights_watcher::shared(weights_watcher::CongestionWeights::from_settings(
        &settings.telemetry,
    ));

    // run_id is provisional until the learning core reports a real one via
    // UpdateMaturityState; using the next id after the last persisted report
    // keeps restarts from colliding with a prior run's id in casual use.
    let run_id = event_store
        .recent_reports(1)
        .first()
        .map(|r| r.run_id + 1)
        .unwrap_or(1);

    let controller = CentralController::startup(settings.clone(), run_id)
        .await
        .context("central controller startup sequence")?;
    let results_dir = controller.results_dir().to_path_buf();

    let mut tasks: JoinSet<&'static str> = JoinSet::new();

    {
        tasks.spawn(async move {
            run_event_store(event_store, event_store_rx).await;
            "event_store"
        });
    }

    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            run_watchdog(watchdog_tx, cancel).await;
            "watchdog"
        });
    }

    {
        let bind_addr = settings.telemetry.bind_addr.clone();
        let strategy = settings.telemetry.aggregation_strategy;
        let ui_tx = ui_tx.clone();
        let weights = weights.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            run_telemetry_worker(bind_addr, telemetry_rx, ui_tx, weights, strategy, cancel).await;
            "telemetry"
        });
    }

    {
        let weights_path = results_dir.join("heatmap_weights_live.json");
        let weights = weights.clone();
        let poll = Duration::from_secs(settings.telemetry.weights_poll_interval_secs);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = weights_watcher::run_weights_watcher(weights_path, weights, poll) => {}
            }
            "weights_watcher"
        });
    }

    {
        let analysis_settings = settings.analysis.clone();
        let results_dir = results_dir.clone();
        let event_store_tx = event_store_tx.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            carina_controller::analysis::run_analysis_worker(
                analysis_settings,
                results_dir,
                analysis_rx,
                event_store_tx,
                cancel,
            )
            .await;
            "analysis"
        });
    }

    {
        let policy = Box::new(MaxPhaseHoldPolicy::new(
            SAFETY_MAX_PHASE_HOLD_SECS,
            settings.simulator.step_length_secs,
        ));
        let cancel = cancel.clone();
        tasks.spawn(async move {
            run_safety_worker(policy, safety_rx, veto_tx, cancel).await;
            "safety"
        });
    }

    {
        let policy = Box::new(RoundRobinPolicy::new(LEARNING_CORE_PHASE_COUNT));
        let pipe_client = pipe_client.clone();
        let event_store_tx = event_store_tx.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            run_learning_core_worker(
                pipe_client,
                veto_rx,
                event_store_tx,
                policy,
                run_id,
                LEARNING_CORE_DECISION_INTERVAL,
                LEARNING_CORE_EPISODE_LENGTH_DECISIONS,
                cancel,
            )
            .await;
            "learning_core"
        });
    }

    {
        let channels = ControllerChannels {
            pipe_server,
            ui_rx,
            watchdog_rx,
            telemetry_tx,
            analysis_tx,
            safety_tx,
            event_store_tx: event_store_tx.clone(),
        };
        let cancel = cancel.clone();
        tasks.spawn(async move {
            controller.run(channels, cancel).await;
            "central_controller"
        });
    }

    drop(ui_tx);
    drop(event_store_tx);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("supervisor: shutdown requested, waiting for tasks to wind down");
                break;
            }
            result = tasks.join_next() => {
                match result {
                    Some(Ok(name)) => info!(task = name, "task completed"),
                    Some(Err(e)) => {
                        error!(error = %e, "task panicked, cancelling remaining tasks");
                        cancel.cancel();
                    }
                    None => {
                        info!("supervisor: all tasks completed");
                        return Ok(());
                    }
                }
            }
        }
    }

    let shutdown_timeout = Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    info!("carina-controller shutdown complete");
    Ok(())
}

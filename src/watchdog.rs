//! The Watchdog (C2): a single failsafe loop, oblivious to everything else
//! in the system. Every second it enqueues one command; it never reacts to
//! inputs and never reads simulator state itself.

use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

use crate::transport::queues::{send_lossy, WatchdogCommand};

const TICK: Duration = Duration::from_secs(1);
const FAILSAFE_PROGRAM: &str = "0";

pub async fn run_watchdog(tx: mpsc::Sender<WatchdogCommand>, cancel: CancellationToken) {
    tracing::info!("watchdog started");
    let mut ticker = interval(TICK);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                send_lossy(
                    &tx,
                    WatchdogCommand { program_id: FAILSAFE_PROGRAM.to_string() },
                    "watchdog->controller",
                );
            }
        }
    }
    tracing::info!("watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_a_command_within_two_ticks() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(run_watchdog(tx, cancel_clone));

        let cmd = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cmd.program_id, "0");

        cancel.cancel();
        handle.await.unwrap();
    }
}

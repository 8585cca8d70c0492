//! Command-line workbench for the live-progress client.
//!
//! Tracks the execution ids given on the command line against the push
//! endpoint from `WS_URL`, logging every snapshot change until all jobs
//! reach a terminal state. Exits non-zero when any generation fails or
//! the channel gives up reconnecting.

use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pictora_progress::channel::ConnectionState;
use pictora_progress::config::LiveConfig;
use pictora_progress::tracker::{ProgressTracker, TrackCallbacks};
use pictora_progress::LiveChannel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pictora_progress=debug,pictora_workbench=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let execution_ids: Vec<String> = std::env::args().skip(1).collect();
    if execution_ids.is_empty() {
        anyhow::bail!("usage: pictora-workbench <execution-id> [<execution-id>...]");
    }

    let config = LiveConfig::from_env();
    tracing::info!(ws_url = %config.ws_url, "Loaded live channel configuration");

    let (channel, updates) = LiveChannel::spawn(config);
    let tracker = ProgressTracker::new(channel, updates);

    // Each terminal callback reports (execution_id, succeeded) here.
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(String, bool)>();

    for execution_id in &execution_ids {
        let completed_tx = done_tx.clone();
        let completed_id = execution_id.clone();
        let failed_tx = done_tx.clone();
        let failed_id = execution_id.clone();

        tracker
            .track(
                execution_id.clone(),
                TrackCallbacks {
                    on_complete: Some(Box::new(move |_snapshot| {
                        let _ = completed_tx.send((completed_id, true));
                    })),
                    on_error: Some(Box::new(move |snapshot| {
                        tracing::warn!(message = %snapshot.message, "Generation failed");
                        let _ = failed_tx.send((failed_id, false));
                    })),
                },
            )
            .await;
    }

    let mut snapshots_rx = tracker.watch_snapshots();
    let mut state_rx = tracker.watch_connection_state();
    let mut remaining = execution_ids.len();
    let mut failures = 0usize;

    while remaining > 0 {
        tokio::select! {
            Some((execution_id, succeeded)) = done_rx.recv() => {
                tracing::info!(
                    execution_id = %execution_id,
                    succeeded,
                    "Generation finished",
                );
                if !succeeded {
                    failures += 1;
                }
                remaining -= 1;
            }
            changed = snapshots_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                for (execution_id, snapshot) in snapshots_rx.borrow_and_update().iter() {
                    tracing::info!(
                        execution_id = %execution_id,
                        status = ?snapshot.status,
                        percent = snapshot.progress_percent,
                        step = %snapshot.current_step,
                        "{}",
                        snapshot.message,
                    );
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                tracing::info!(?state, "Connection state changed");
                if state == ConnectionState::Failed {
                    tracker.shutdown();
                    anyhow::bail!("live channel gave up after exhausting reconnect attempts");
                }
            }
        }
    }

    tracker.shutdown();

    if failures > 0 {
        anyhow::bail!("{failures} of {} generations failed", execution_ids.len());
    }
    Ok(())
}

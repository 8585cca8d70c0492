//! Job progress tracking over the live-update channel.
//!
//! [`ProgressTracker`] maps execution ids to their latest
//! [`ProgressSnapshot`], keeps the channel's desired-subscription set in
//! sync with the tracked set, and fires the caller-supplied terminal
//! callbacks exactly once per tracking session.
//!
//! The tracker never returns an error and never panics on inbound data:
//! transport failure surfaces through the channel's connection state, a
//! backend-reported job failure through the per-job error callback.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use pictora_core::progress::{JobStatus, ProgressSnapshot};
use pictora_core::types::ExecutionId;

use crate::channel::{ConnectionState, LiveChannel};
use crate::messages::ProgressUpdateData;

/// The observable snapshot collection: every tracked job's latest state.
pub type SnapshotMap = HashMap<ExecutionId, ProgressSnapshot>;

/// Callback invoked with the final snapshot when a job reaches a
/// terminal state. Fires at most once per tracking session.
pub type TerminalCallback = Box<dyn FnOnce(ProgressSnapshot) + Send + 'static>;

/// Per-job callbacks supplied to [`ProgressTracker::track`].
#[derive(Default)]
pub struct TrackCallbacks {
    /// Invoked once when the job reports `completed`.
    pub on_complete: Option<TerminalCallback>,
    /// Invoked once when the job reports `failed`.
    pub on_error: Option<TerminalCallback>,
}

/// Bookkeeping for one tracked job.
///
/// `callbacks` is `Some` until the first terminal frame is observed;
/// taking it is what makes the exactly-once guarantee hold even when
/// duplicate terminal frames arrive.
struct TrackedJob {
    snapshot: ProgressSnapshot,
    callbacks: Option<TrackCallbacks>,
}

impl TrackedJob {
    fn new(callbacks: TrackCallbacks) -> Self {
        Self {
            snapshot: ProgressSnapshot::initial(),
            callbacks: Some(callbacks),
        }
    }
}

/// Tracks in-flight generation jobs over an injected [`LiveChannel`].
///
/// Cloning is cheap; all clones share the same state. UI layers render
/// from [`watch_snapshots`](Self::watch_snapshots) without polling.
#[derive(Clone)]
pub struct ProgressTracker {
    channel: LiveChannel,
    jobs: Arc<Mutex<HashMap<ExecutionId, TrackedJob>>>,
    snapshots_tx: Arc<watch::Sender<SnapshotMap>>,
    snapshots_rx: watch::Receiver<SnapshotMap>,
    cancel: CancellationToken,
}

impl ProgressTracker {
    /// Build a tracker over a spawned channel.
    ///
    /// `updates` must be the inbound stream returned by
    /// [`LiveChannel::spawn`] for the same channel; the tracker is its
    /// sole consumer.
    pub fn new(
        channel: LiveChannel,
        updates: mpsc::UnboundedReceiver<ProgressUpdateData>,
    ) -> Self {
        let jobs = Arc::new(Mutex::new(HashMap::new()));
        let (snapshots_tx, snapshots_rx) = watch::channel(SnapshotMap::new());
        let snapshots_tx = Arc::new(snapshots_tx);
        let cancel = CancellationToken::new();

        tokio::spawn(consume_updates(
            Arc::clone(&jobs),
            Arc::clone(&snapshots_tx),
            updates,
            cancel.clone(),
        ));

        Self {
            channel,
            jobs,
            snapshots_tx,
            snapshots_rx,
            cancel,
        }
    }

    /// Start tracking a job.
    ///
    /// No-op when the job is already tracked and still in flight.
    /// Re-tracking a job whose snapshot is terminal starts a fresh
    /// session: initial snapshot, callbacks re-armed. The first tracked
    /// job opens the channel connection; connect failures are logged and
    /// left to the channel's reconnect policy.
    pub async fn track(&self, execution_id: impl Into<ExecutionId>, callbacks: TrackCallbacks) {
        let execution_id = execution_id.into();
        {
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(&execution_id) {
                Some(job) if !job.snapshot.status.is_terminal() => {
                    tracing::debug!(
                        execution_id = %execution_id,
                        "Already tracking execution, ignoring",
                    );
                    return;
                }
                Some(job) => {
                    // New tracking session for a finished job.
                    *job = TrackedJob::new(callbacks);
                }
                None => {
                    jobs.insert(execution_id.clone(), TrackedJob::new(callbacks));
                }
            }
            publish(&jobs, &self.snapshots_tx);
        }

        tracing::info!(execution_id = %execution_id, "Tracking generation progress");
        self.channel.subscribe(execution_id);
        if let Err(e) = self.channel.connect().await {
            tracing::warn!(error = %e, "Live channel connect failed");
        }
    }

    /// Stop tracking a job and discard its snapshot.
    ///
    /// Unsubscribes on the channel; removing the last tracked job closes
    /// the connection.
    pub async fn stop_tracking(&self, execution_id: &str) {
        {
            let mut jobs = self.jobs.lock().await;
            if jobs.remove(execution_id).is_none() {
                return;
            }
            publish(&jobs, &self.snapshots_tx);
        }

        tracing::info!(execution_id = %execution_id, "Stopped tracking execution");
        self.channel.unsubscribe(execution_id);
    }

    /// Latest snapshot for one job, if tracked.
    pub fn snapshot(&self, execution_id: &str) -> Option<ProgressSnapshot> {
        self.snapshots_rx.borrow().get(execution_id).cloned()
    }

    /// Copy of the full snapshot collection.
    pub fn snapshots(&self) -> SnapshotMap {
        self.snapshots_rx.borrow().clone()
    }

    /// Watch the snapshot collection for changes.
    pub fn watch_snapshots(&self) -> watch::Receiver<SnapshotMap> {
        self.snapshots_rx.clone()
    }

    /// Current channel connection state.
    ///
    /// When the channel parks at [`ConnectionState::Failed`] the tracked
    /// snapshots are retained as last-known-good, not cleared.
    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    /// Watch connection state changes (for UI display).
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.channel.watch_state()
    }

    /// Stop the update consumer and disconnect the channel. Snapshots
    /// remain readable.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.channel.disconnect();
    }
}

/// Drain the channel's update stream until cancelled or the channel
/// actor exits.
async fn consume_updates(
    jobs: Arc<Mutex<HashMap<ExecutionId, TrackedJob>>>,
    snapshots_tx: Arc<watch::Sender<SnapshotMap>>,
    mut updates: mpsc::UnboundedReceiver<ProgressUpdateData>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe_update = updates.recv() => match maybe_update {
                Some(update) => apply_update(&jobs, &snapshots_tx, update).await,
                None => break,
            },
        }
    }
}

/// Apply one inbound progress frame.
///
/// Frames for untracked executions are dropped. Terminal callbacks are
/// invoked outside the lock so user code can call back into the tracker.
async fn apply_update(
    jobs: &Mutex<HashMap<ExecutionId, TrackedJob>>,
    snapshots_tx: &watch::Sender<SnapshotMap>,
    update: ProgressUpdateData,
) {
    let ProgressUpdateData {
        execution_id,
        status,
        progress,
        current_step,
        message,
    } = update;

    let fired = {
        let mut jobs = jobs.lock().await;
        let Some(job) = jobs.get_mut(&execution_id) else {
            tracing::debug!(
                execution_id = %execution_id,
                "Update for untracked execution, ignoring",
            );
            return;
        };

        job.snapshot = ProgressSnapshot {
            status,
            progress_percent: progress.min(100),
            current_step,
            message,
            last_update: Utc::now(),
        };

        let fired = if status.is_terminal() {
            job.callbacks.take().map(|callbacks| {
                let callback = match status {
                    JobStatus::Completed => callbacks.on_complete,
                    JobStatus::Failed => callbacks.on_error,
                    JobStatus::Processing => None,
                };
                (callback, job.snapshot.clone())
            })
        } else {
            None
        };

        publish(&jobs, snapshots_tx);
        fired
    };

    if let Some((callback, snapshot)) = fired {
        match snapshot.status {
            JobStatus::Failed => tracing::warn!(
                execution_id = %execution_id,
                message = %snapshot.message,
                "Generation failed",
            ),
            _ => tracing::info!(execution_id = %execution_id, "Generation completed"),
        }
        if let Some(callback) = callback {
            callback(snapshot);
        }
    }
}

/// Publish the current snapshot collection to observers.
fn publish(jobs: &HashMap<ExecutionId, TrackedJob>, snapshots_tx: &watch::Sender<SnapshotMap>) {
    let map: SnapshotMap = jobs
        .iter()
        .map(|(id, job)| (id.clone(), job.snapshot.clone()))
        .collect();
    let _ = snapshots_tx.send(map);
}

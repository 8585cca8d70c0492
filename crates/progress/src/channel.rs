//! The live-update channel: one persistent WebSocket connection to the
//! push endpoint, with automatic reconnection and subscription replay.
//!
//! [`LiveChannel`] is a cheap cloneable handle. The connection itself is
//! owned by a background actor task that processes handle commands and
//! socket events serially, so connection state, the desired-subscription
//! set, and the socket are never touched from two places at once.
//!
//! The channel knows nothing about job semantics: it decodes frames and
//! forwards progress payloads to its sole consumer (the tracker), and it
//! replays the desired subscriptions after every successful connect
//! because the endpoint keeps no subscription state across connections.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use pictora_core::types::ExecutionId;

use crate::config::LiveConfig;
use crate::messages::{parse_frame, ClientRequest, ProgressUpdateData, PushFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectAck = oneshot::Sender<Result<(), ChannelError>>;

/// Close reason sent when the client disconnects on purpose.
const INTENTIONAL_CLOSE_REASON: &str = "Intentional disconnect";

/// Connection lifecycle of the channel.
///
/// Driven only by socket events and the reconnect timer. Serializes to
/// the vocabulary the UI renders (`Failed` becomes `"error"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection and none pending.
    Disconnected,
    /// First connection attempt in flight.
    Connecting,
    /// Connected; subscriptions have been replayed.
    Connected,
    /// Waiting out the back-off delay or retrying after a drop.
    Reconnecting,
    /// Connect failed, or retries are exhausted. Only an explicit
    /// `connect()` leaves this state.
    #[serde(rename = "error")]
    Failed,
}

/// Errors surfaced through [`LiveChannel::connect`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The WebSocket handshake failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The channel actor has shut down.
    #[error("Live channel is closed")]
    Closed,
}

/// Commands from handles to the actor.
enum Command {
    Connect { ack: ConnectAck },
    Subscribe { execution_id: ExecutionId },
    Unsubscribe { execution_id: ExecutionId },
    Disconnect,
}

/// Handle to the live-update channel actor.
///
/// Cloning is cheap; all clones address the same connection. The actor
/// exits once every handle has been dropped.
#[derive(Clone)]
pub struct LiveChannel {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl LiveChannel {
    /// Spawn the channel actor.
    ///
    /// Returns the handle plus the inbound stream of decoded progress
    /// payloads. The stream has exactly one consumer; hand it to the
    /// tracker.
    pub fn spawn(config: LiveConfig) -> (Self, mpsc::UnboundedReceiver<ProgressUpdateData>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = ChannelActor {
            config,
            desired: BTreeSet::new(),
            cmd_rx,
            update_tx,
            state_tx,
            failed_attempts: 0,
        };
        tokio::spawn(actor.run());

        (Self { cmd_tx, state_rx }, update_rx)
    }

    /// Open the connection, replay desired subscriptions, and resolve.
    ///
    /// Idempotent: resolves immediately when already connected, and
    /// callers that race an in-flight attempt await that attempt's
    /// outcome instead of opening a second connection.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let (ack, outcome) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect { ack })
            .map_err(|_| ChannelError::Closed)?;
        outcome.await.map_err(|_| ChannelError::Closed)?
    }

    /// Record `execution_id` as desired and subscribe on the wire when
    /// connected; otherwise it is queued for replay on the next connect.
    pub fn subscribe(&self, execution_id: impl Into<ExecutionId>) {
        let _ = self.cmd_tx.send(Command::Subscribe {
            execution_id: execution_id.into(),
        });
    }

    /// Drop interest in `execution_id`. When the desired set becomes
    /// empty the channel closes intentionally and does not reconnect.
    pub fn unsubscribe(&self, execution_id: impl Into<ExecutionId>) {
        let _ = self.cmd_tx.send(Command::Unsubscribe {
            execution_id: execution_id.into(),
        });
    }

    /// Force an intentional close and clear all desired subscriptions.
    /// Cancels any pending reconnect.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection state changes (for UI display).
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// How a live session ended.
enum SessionEnd {
    /// Closed on purpose (disconnect, empty desired set, or the server
    /// sent a normal close). No reconnect.
    Intentional,
    /// The connection dropped or errored. Reconnect may apply.
    Abnormal,
    /// Every handle was dropped; the actor is exiting.
    Shutdown,
}

/// Outcome of waiting out a back-off delay.
enum WaitOutcome {
    /// Delay elapsed (or an explicit connect asked to retry now).
    Retry,
    /// The session was cancelled while waiting; the actor rests.
    Abort,
}

struct ChannelActor {
    config: LiveConfig,
    /// Subscriptions to replay on every successful connect. Populated by
    /// the tracker through handle commands; only this task touches it.
    desired: BTreeSet<ExecutionId>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    update_tx: mpsc::UnboundedSender<ProgressUpdateData>,
    state_tx: watch::Sender<ConnectionState>,
    /// Consecutive failed connection attempts since the last success.
    failed_attempts: u32,
}

impl ChannelActor {
    /// Rest loop: no connection and no pending reconnect. A `Connect`
    /// command starts a session; everything else is bookkeeping.
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Connect { ack } => self.run_session(vec![ack]).await,
                Command::Subscribe { execution_id } => {
                    // Queued for replay on the next connect.
                    self.desired.insert(execution_id);
                }
                Command::Unsubscribe { execution_id } => {
                    self.desired.remove(&execution_id);
                }
                Command::Disconnect => {
                    self.desired.clear();
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }

    /// Drive one connect attempt and everything that follows (serving
    /// frames, reconnect cycles) until the channel comes to rest.
    async fn run_session(&mut self, mut acks: Vec<ConnectAck>) {
        self.failed_attempts = 0;
        self.set_state(ConnectionState::Connecting);

        loop {
            match self.try_connect().await {
                Ok(mut ws) => {
                    self.failed_attempts = 0;
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(
                        subscriptions = self.desired.len(),
                        "Connected to push endpoint at {}",
                        self.config.ws_url,
                    );

                    // Replay before acknowledging, so connect() resolving
                    // implies every desired subscription is on the wire.
                    self.replay_subscriptions(&mut ws).await;
                    for ack in acks.drain(..) {
                        let _ = ack.send(Ok(()));
                    }

                    match self.serve(&mut ws).await {
                        SessionEnd::Intentional => {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        SessionEnd::Shutdown => {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        SessionEnd::Abnormal => {
                            self.set_state(ConnectionState::Disconnected);
                            if self.desired.is_empty() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Push endpoint connection failed");
                    let msg = e.to_string();
                    for ack in acks.drain(..) {
                        let _ = ack.send(Err(ChannelError::Connection(msg.clone())));
                    }
                    if self.desired.is_empty() {
                        self.set_state(ConnectionState::Failed);
                        return;
                    }
                }
            }

            if !self.config.reconnect.should_retry(self.failed_attempts) {
                tracing::error!(
                    attempts = self.failed_attempts,
                    "Reconnect attempts exhausted, giving up",
                );
                self.set_state(ConnectionState::Failed);
                return;
            }

            self.failed_attempts += 1;
            let delay = self.config.reconnect.delay_for(self.failed_attempts);
            self.set_state(ConnectionState::Reconnecting);
            tracing::info!(
                attempt = self.failed_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to push endpoint",
            );

            match self.wait_backoff(delay, &mut acks).await {
                WaitOutcome::Retry => continue,
                WaitOutcome::Abort => return,
            }
        }
    }

    /// One WebSocket handshake, including optional token acquisition.
    async fn try_connect(&self) -> Result<WsStream, ChannelError> {
        let url = match &self.config.token_provider {
            Some(provider) => {
                let token = provider
                    .token()
                    .await
                    .map_err(|e| ChannelError::Connection(e.to_string()))?;
                format!("{}?token={token}", self.config.ws_url)
            }
            None => self.config.ws_url.clone(),
        };

        let (ws, _response) = connect_async(&url).await.map_err(|e| {
            ChannelError::Connection(format!(
                "Failed to connect to push endpoint at {}: {e}",
                self.config.ws_url
            ))
        })?;

        Ok(ws)
    }

    /// Process commands and socket frames until the session ends.
    async fn serve(&mut self, ws: &mut WsStream) -> SessionEnd {
        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    None => {
                        close_intentionally(ws).await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Command::Connect { ack }) => {
                        // Already connected: resolve immediately.
                        let _ = ack.send(Ok(()));
                    }
                    Some(Command::Subscribe { execution_id }) => {
                        self.desired.insert(execution_id.clone());
                        send_subscribe(ws, &execution_id).await;
                    }
                    Some(Command::Unsubscribe { execution_id }) => {
                        self.desired.remove(&execution_id);
                        if self.desired.is_empty() {
                            tracing::info!("Last subscription removed, closing push connection");
                            close_intentionally(ws).await;
                            return SessionEnd::Intentional;
                        }
                    }
                    Some(Command::Disconnect) => {
                        self.desired.clear();
                        close_intentionally(ws).await;
                        return SessionEnd::Intentional;
                    }
                },
                maybe_frame = ws.next() => match maybe_frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Binary(_))) => {
                        tracing::trace!("Ignoring binary push frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Handled automatically by tungstenite.
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let intentional = frame
                            .as_ref()
                            .is_some_and(|f| f.code == CloseCode::Normal);
                        tracing::info!(?frame, intentional, "Push endpoint closed the connection");
                        return if intentional {
                            SessionEnd::Intentional
                        } else {
                            SessionEnd::Abnormal
                        };
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "WebSocket receive error");
                        return SessionEnd::Abnormal;
                    }
                    None => {
                        tracing::warn!("Push connection ended without a close frame");
                        return SessionEnd::Abnormal;
                    }
                },
            }
        }
    }

    /// Decode a text frame and forward the payload to the consumer.
    /// Malformed frames are logged and dropped, never fatal.
    fn handle_text(&self, text: &str) {
        match parse_frame(text) {
            Ok(PushFrame::ProgressUpdate(data)) => {
                let _ = self.update_tx.send(data);
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    raw_message = %text,
                    "Failed to parse push frame",
                );
            }
        }
    }

    /// Wait out a back-off delay while still servicing commands.
    async fn wait_backoff(&mut self, delay: Duration, acks: &mut Vec<ConnectAck>) -> WaitOutcome {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return WaitOutcome::Retry,
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    None => {
                        self.set_state(ConnectionState::Disconnected);
                        return WaitOutcome::Abort;
                    }
                    Some(Command::Connect { ack }) => {
                        // An explicit connect skips the remaining delay.
                        acks.push(ack);
                        return WaitOutcome::Retry;
                    }
                    Some(Command::Subscribe { execution_id }) => {
                        self.desired.insert(execution_id);
                    }
                    Some(Command::Unsubscribe { execution_id }) => {
                        self.desired.remove(&execution_id);
                        if self.desired.is_empty() {
                            tracing::info!("Last subscription removed, cancelling reconnect");
                            self.set_state(ConnectionState::Disconnected);
                            return WaitOutcome::Abort;
                        }
                    }
                    Some(Command::Disconnect) => {
                        self.desired.clear();
                        self.set_state(ConnectionState::Disconnected);
                        return WaitOutcome::Abort;
                    }
                },
            }
        }
    }

    /// Send one subscribe frame per desired execution id.
    async fn replay_subscriptions(&mut self, ws: &mut WsStream) {
        for execution_id in &self.desired {
            send_subscribe(ws, execution_id).await;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        tracing::debug!(?state, "Live channel state change");
        let _ = self.state_tx.send(state);
    }
}

/// Send a subscribe frame for one execution id. Send failures are logged;
/// the socket error resurfaces in the serve loop.
async fn send_subscribe(ws: &mut WsStream, execution_id: &str) {
    match serde_json::to_string(&ClientRequest::Subscribe { execution_id }) {
        Ok(json) => {
            if let Err(e) = ws.send(Message::Text(json)).await {
                tracing::warn!(
                    execution_id = %execution_id,
                    error = %e,
                    "Failed to send subscribe frame",
                );
            } else {
                tracing::debug!(execution_id = %execution_id, "Subscribed to execution");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize subscribe frame");
        }
    }
}

/// Close with code 1000 so the endpoint (and our own close handling)
/// can tell an intentional close from a dropped connection.
async fn close_intentionally(ws: &mut WsStream) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: INTENTIONAL_CLOSE_REASON.into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        tracing::debug!(error = %e, "Error closing push connection");
    }
}

//! Integration tests driving the live channel and tracker against an
//! in-process WebSocket push server.
//!
//! The stub server hands every accepted connection to the test body, so
//! tests can read subscribe frames, inject progress frames, and drop
//! connections to exercise the reconnect path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, accept_hdr_async, WebSocketStream};

use pictora_core::progress::JobStatus;
use pictora_progress::channel::{ChannelError, ConnectionState, LiveChannel};
use pictora_progress::config::{LiveConfig, TokenError, TokenProvider};
use pictora_progress::reconnect::ReconnectPolicy;
use pictora_progress::tracker::{ProgressTracker, TrackCallbacks};

// ---------------------------------------------------------------------------
// Stub push server
// ---------------------------------------------------------------------------

/// Accept loop on an ephemeral port; every accepted WebSocket connection
/// is handed to the test through the returned receiver.
async fn start_stub_server() -> (String, mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let ws = accept_async(stream).await.unwrap();
            if conn_tx.send(ws).is_err() {
                break;
            }
        }
    });

    (format!("ws://{addr}"), conn_rx)
}

fn test_config(ws_url: &str) -> LiveConfig {
    LiveConfig {
        ws_url: ws_url.to_string(),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(50),
            max_attempts: 5,
        },
        token_provider: None,
    }
}

/// Read the next text frame as JSON, skipping pings.
async fn recv_json(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended unexpectedly")
            .expect("frame error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

async fn send_progress(
    ws: &mut WebSocketStream<TcpStream>,
    execution_id: &str,
    status: &str,
    progress: u8,
    current_step: &str,
    message: &str,
) {
    let frame = serde_json::json!({
        "type": "progress_update",
        "data": {
            "execution_id": execution_id,
            "status": status,
            "progress": progress,
            "current_step": current_step,
            "message": message,
        },
    });
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Read `count` subscribe frames and return their execution ids, sorted.
async fn recv_subscriptions(ws: &mut WebSocketStream<TcpStream>, count: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let frame = recv_json(ws).await;
        assert_eq!(frame["action"], "subscribe");
        ids.push(frame["execution_id"].as_str().unwrap().to_string());
    }
    ids.sort();
    ids
}

// ---------------------------------------------------------------------------
// Channel tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_replays_queued_subscriptions() {
    let (url, mut conns) = start_stub_server().await;
    let (channel, _updates) = LiveChannel::spawn(test_config(&url));

    channel.subscribe("exec-1");
    channel.subscribe("exec-2");
    channel.connect().await.unwrap();
    assert_eq!(channel.state(), ConnectionState::Connected);

    let mut ws = conns.recv().await.unwrap();
    let ids = recv_subscriptions(&mut ws, 2).await;
    assert_eq!(ids, ["exec-1", "exec-2"]);
}

#[tokio::test]
async fn connect_is_idempotent() {
    let (url, mut conns) = start_stub_server().await;
    let (channel, _updates) = LiveChannel::spawn(test_config(&url));

    channel.subscribe("exec-1");
    channel.connect().await.unwrap();
    channel.connect().await.unwrap();

    let _ws = conns.recv().await.unwrap();
    // The second connect() must not have opened a second connection.
    assert_matches!(
        timeout(Duration::from_millis(300), conns.recv()).await,
        Err(_)
    );
}

#[tokio::test]
async fn last_unsubscribe_closes_intentionally_without_reconnect() {
    let (url, mut conns) = start_stub_server().await;
    let (channel, _updates) = LiveChannel::spawn(test_config(&url));

    channel.subscribe("exec-1");
    channel.connect().await.unwrap();
    let mut ws = conns.recv().await.unwrap();
    recv_subscriptions(&mut ws, 1).await;

    channel.unsubscribe("exec-1");

    let frame = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for close")
        .expect("connection ended unexpectedly")
        .expect("frame error");
    match frame {
        Message::Close(Some(close)) => assert_eq!(close.code, CloseCode::Normal),
        other => panic!("Expected a close frame, got {other:?}"),
    }

    let mut state_rx = channel.watch_state();
    timeout(
        Duration::from_secs(2),
        state_rx.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();

    // Intentional close: no reconnect attempt follows.
    assert_matches!(
        timeout(Duration::from_millis(300), conns.recv()).await,
        Err(_)
    );
}

#[tokio::test]
async fn exhausted_retries_park_channel_at_failed() {
    // Grab an ephemeral port, then close the listener so every connect
    // attempt is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let config = LiveConfig {
        ws_url: url,
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_attempts: 5,
        },
        token_provider: None,
    };
    let (channel, _updates) = LiveChannel::spawn(config);

    channel.subscribe("exec-1");
    assert_matches!(channel.connect().await, Err(ChannelError::Connection(_)));

    let mut state_rx = channel.watch_state();
    timeout(
        Duration::from_secs(5),
        state_rx.wait_for(|s| *s == ConnectionState::Failed),
    )
    .await
    .expect("channel never parked at Failed")
    .unwrap();
}

#[tokio::test]
async fn token_provider_is_included_in_handshake() {
    struct StaticToken;

    #[async_trait::async_trait]
    impl TokenProvider for StaticToken {
        async fn token(&self) -> Result<String, TokenError> {
            Ok("sekrit".into())
        }
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (uri_tx, uri_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
            let _ = uri_tx.send(req.uri().clone());
            Ok(resp)
        })
        .await
        .unwrap();
        // Keep the connection open until the test finishes.
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(ws);
    });

    let config =
        LiveConfig::new(format!("ws://{addr}")).with_token_provider(Arc::new(StaticToken));
    let (channel, _updates) = LiveChannel::spawn(config);
    channel.subscribe("exec-1");
    channel.connect().await.unwrap();

    let uri = timeout(Duration::from_secs(2), uri_rx).await.unwrap().unwrap();
    assert_eq!(uri.query(), Some("token=sekrit"));
}

// ---------------------------------------------------------------------------
// Tracker tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_resubscribes_every_tracked_job() {
    let (url, mut conns) = start_stub_server().await;
    let (channel, updates) = LiveChannel::spawn(test_config(&url));
    let tracker = ProgressTracker::new(channel, updates);

    tracker.track("job-1", TrackCallbacks::default()).await;
    tracker.track("job-2", TrackCallbacks::default()).await;

    let mut ws = conns.recv().await.unwrap();
    let ids = recv_subscriptions(&mut ws, 2).await;
    assert_eq!(ids, ["job-1", "job-2"]);

    // Abnormal drop: no close frame.
    drop(ws);

    // The replacement connection must re-subscribe both jobs before any
    // further frame is processed.
    let mut ws = timeout(Duration::from_secs(2), conns.recv())
        .await
        .expect("channel never reconnected")
        .unwrap();
    let ids = recv_subscriptions(&mut ws, 2).await;
    assert_eq!(ids, ["job-1", "job-2"]);

    send_progress(
        &mut ws,
        "job-1",
        "processing",
        40,
        "GeneratePrompts",
        "Writing prompts",
    )
    .await;

    let mut snapshots_rx = tracker.watch_snapshots();
    timeout(
        Duration::from_secs(2),
        snapshots_rx.wait_for(|snapshots| {
            snapshots
                .get("job-1")
                .is_some_and(|s| s.progress_percent == 40 && s.current_step == "GeneratePrompts")
        }),
    )
    .await
    .expect("snapshot never reflected the pushed frame")
    .unwrap();
}

#[tokio::test]
async fn terminal_frame_fires_callback_exactly_once_end_to_end() {
    let (url, mut conns) = start_stub_server().await;
    let (channel, updates) = LiveChannel::spawn(test_config(&url));
    let tracker = ProgressTracker::new(channel, updates);

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = Arc::clone(&fired);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    tracker
        .track(
            "exec-9",
            TrackCallbacks {
                on_complete: Some(Box::new(move |snapshot| {
                    fired_clone.fetch_add(1, Ordering::SeqCst);
                    let _ = done_tx.send(snapshot);
                })),
                on_error: None,
            },
        )
        .await;

    let mut ws = conns.recv().await.unwrap();
    recv_subscriptions(&mut ws, 1).await;

    send_progress(&mut ws, "exec-9", "processing", 80, "SaveFinalResults", "Saving").await;
    send_progress(&mut ws, "exec-9", "completed", 100, "Completed", "first").await;
    send_progress(&mut ws, "exec-9", "completed", 100, "Completed", "second").await;

    let final_snapshot = timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .expect("completion callback never fired")
        .unwrap();
    assert_eq!(final_snapshot.status, JobStatus::Completed);
    assert_eq!(final_snapshot.progress_percent, 100);

    // The duplicate terminal frame still updates the snapshot but must
    // not re-fire the callback.
    let mut snapshots_rx = tracker.watch_snapshots();
    timeout(
        Duration::from_secs(2),
        snapshots_rx.wait_for(|snapshots| {
            snapshots.get("exec-9").is_some_and(|s| s.message == "second")
        }),
    )
    .await
    .expect("snapshot never saw the duplicate frame")
    .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_tracking_last_job_closes_connection() {
    let (url, mut conns) = start_stub_server().await;
    let (channel, updates) = LiveChannel::spawn(test_config(&url));
    let tracker = ProgressTracker::new(channel, updates);

    tracker.track("exec-1", TrackCallbacks::default()).await;
    let mut ws = conns.recv().await.unwrap();
    recv_subscriptions(&mut ws, 1).await;

    tracker.stop_tracking("exec-1").await;

    let frame = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for close")
        .expect("connection ended unexpectedly")
        .expect("frame error");
    assert_matches!(frame, Message::Close(Some(close)) if close.code == CloseCode::Normal);

    assert!(tracker.snapshot("exec-1").is_none());
}

#[tokio::test]
async fn untracked_frames_do_not_disturb_snapshots() {
    let (url, mut conns) = start_stub_server().await;
    let (channel, updates) = LiveChannel::spawn(test_config(&url));
    let tracker = ProgressTracker::new(channel, updates);

    tracker.track("exec-1", TrackCallbacks::default()).await;
    let mut ws = conns.recv().await.unwrap();
    recv_subscriptions(&mut ws, 1).await;

    send_progress(&mut ws, "someone-else", "completed", 100, "Completed", "Done").await;
    send_progress(&mut ws, "exec-1", "processing", 25, "GeneratePrompts", "Working").await;

    let mut snapshots_rx = tracker.watch_snapshots();
    timeout(
        Duration::from_secs(2),
        snapshots_rx.wait_for(|snapshots| {
            snapshots.get("exec-1").is_some_and(|s| s.progress_percent == 25)
        }),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(tracker.snapshot("someone-else").is_none());
}

//! Live generation-progress client library.
//!
//! Connects to the platform's push endpoint over WebSocket and tracks
//! in-flight image-generation jobs in real time:
//!
//! - [`channel`] — the live-update channel: one persistent connection
//!   with automatic reconnection and subscription replay.
//! - [`tracker`] — per-job progress snapshots and exactly-once terminal
//!   callbacks on top of the channel.
//! - [`messages`] — typed wire frames and the frame parser.
//! - [`reconnect`] — the back-off policy applied after abnormal drops.
//! - [`config`] — endpoint configuration and the token provider seam.

pub mod channel;
pub mod config;
pub mod messages;
pub mod reconnect;
pub mod tracker;

pub use channel::{ChannelError, ConnectionState, LiveChannel};
pub use config::{LiveConfig, TokenProvider};
pub use tracker::{ProgressTracker, TrackCallbacks};

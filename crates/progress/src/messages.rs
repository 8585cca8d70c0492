//! Push-endpoint WebSocket message types and parser.
//!
//! The progress endpoint sends JSON frames with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`PushFrame`] enum and defines the outbound
//! subscribe request.

use serde::{Deserialize, Serialize};

use pictora_core::progress::{JobStatus, FALLBACK_MESSAGE};
use pictora_core::types::ExecutionId;

/// All known push frames delivered by the progress endpoint.
///
/// Deserialized via the internally-tagged `"type"` field with associated
/// `"data"` content. Frames with an unknown `type` fail to parse; callers
/// log and drop them.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PushFrame {
    /// Progress update for one in-flight generation job.
    #[serde(rename = "progress_update")]
    ProgressUpdate(ProgressUpdateData),
}

/// Payload for `progress_update` frames.
///
/// Every field except `execution_id` may be absent on the wire; absent
/// fields take the defaults the UI expects for a job that is still
/// running.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressUpdateData {
    /// The job this update belongs to.
    pub execution_id: ExecutionId,
    /// Lifecycle status (defaults to `processing`).
    #[serde(default)]
    pub status: JobStatus,
    /// Completion percentage (defaults to `0`).
    #[serde(default)]
    pub progress: u8,
    /// Label of the currently executing pipeline step (defaults to `""`).
    #[serde(default)]
    pub current_step: String,
    /// Human-readable progress description.
    #[serde(default = "default_message")]
    pub message: String,
}

fn default_message() -> String {
    FALLBACK_MESSAGE.to_string()
}

/// Requests sent by the client over the push connection.
///
/// Serialized with a flat `"action"` tag; the endpoint has exactly one
/// route beyond connect/disconnect.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest<'a> {
    /// Ask for live updates about one execution. Subscriptions are
    /// independent and commutative; re-subscribing is harmless.
    Subscribe { execution_id: &'a str },
}

/// Parse a push-endpoint text frame into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values. Callers
/// should log the failure and continue.
pub fn parse_frame(text: &str) -> Result<PushFrame, serde_json::Error> {
    serde_json::from_str(text)
}

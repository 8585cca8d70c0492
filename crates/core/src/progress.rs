//! Generation progress domain types and the pipeline step vocabulary.
//!
//! A generation batch moves through a fixed, ordered sequence of backend
//! steps before reaching a terminal state. The backend reports each step
//! by its label; [`step_message`] maps labels to the user-facing
//! descriptions shown while a batch is in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Job status
// ---------------------------------------------------------------------------

/// Lifecycle status of one generation job.
///
/// The only valid transition is `Processing` into one of the two terminal
/// states. A terminal status never changes for the lifetime of a tracking
/// session; starting a new session resets it to `Processing`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// The job is running (or queued) on the backend.
    #[default]
    Processing,
    /// The job finished and its results are available.
    Completed,
    /// The job aborted with an error.
    Failed,
}

impl JobStatus {
    /// Whether this status ends the job's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// Step vocabulary
// ---------------------------------------------------------------------------

/// Request validation and setup, the first pipeline step.
pub const STEP_VALIDATE_AND_SETUP: &str = "ValidateAndSetup";
/// Prompt generation via the language model.
pub const STEP_GENERATE_PROMPTS: &str = "GeneratePrompts";
/// Kick-off of the actual image generation.
pub const STEP_START_IMAGE_GENERATION: &str = "StartImageGeneration";
/// Polling for generated images.
pub const STEP_CHECK_IMAGE_STATUS: &str = "CheckImageStatus";
/// Post-processing and upload to storage.
pub const STEP_PROCESS_IMAGES: &str = "ProcessImages";
/// Computer-vision labeling of the results.
pub const STEP_LABEL_IMAGES: &str = "LabelImages";
/// Final persistence of batch results.
pub const STEP_SAVE_FINAL_RESULTS: &str = "SaveFinalResults";

/// Terminal step label reported with a final `completed` update.
pub const STEP_COMPLETED: &str = "Completed";
/// Terminal step label reported with a final `failed` update.
pub const STEP_FAILED: &str = "Failed";

/// All pipeline steps in backend execution order.
pub const PIPELINE_STEPS: &[&str] = &[
    STEP_VALIDATE_AND_SETUP,
    STEP_GENERATE_PROMPTS,
    STEP_START_IMAGE_GENERATION,
    STEP_CHECK_IMAGE_STATUS,
    STEP_PROCESS_IMAGES,
    STEP_LABEL_IMAGES,
    STEP_SAVE_FINAL_RESULTS,
];

/// Fallback description for unknown or missing step labels.
pub const FALLBACK_MESSAGE: &str = "Processing...";

/// Message shown the instant tracking starts, before the first update.
pub const INITIAL_MESSAGE: &str = "Initializing generation...";

/// User-facing description of a pipeline step.
///
/// Unknown labels fall back to [`FALLBACK_MESSAGE`] so that new backend
/// steps degrade gracefully in older clients.
pub fn step_message(step: &str) -> &'static str {
    match step {
        STEP_VALIDATE_AND_SETUP => "Validating request and setting up...",
        STEP_GENERATE_PROMPTS => "Generating creative prompts with AI...",
        STEP_START_IMAGE_GENERATION => "Starting image generation process...",
        STEP_CHECK_IMAGE_STATUS => "Waiting for images to be created...",
        STEP_PROCESS_IMAGES => "Processing and uploading images...",
        STEP_LABEL_IMAGES => "Analyzing images with computer vision...",
        STEP_SAVE_FINAL_RESULTS => "Saving your beautiful results...",
        _ => FALLBACK_MESSAGE,
    }
}

// ---------------------------------------------------------------------------
// Progress snapshot
// ---------------------------------------------------------------------------

/// Latest known progress state for one generation job, held client-side.
///
/// Snapshots are overwritten wholesale by each matching push frame; only
/// the most recent state is retained.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Completion percentage (0-100).
    pub progress_percent: u8,
    /// Label of the pipeline step currently executing.
    pub current_step: String,
    /// Human-readable progress description from the backend.
    pub message: String,
    /// When this snapshot was last overwritten (UTC).
    pub last_update: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Snapshot created the instant tracking of a job starts, before the
    /// first push frame arrives.
    pub fn initial() -> Self {
        Self {
            status: JobStatus::Processing,
            progress_percent: 0,
            current_step: STEP_VALIDATE_AND_SETUP.to_string(),
            message: INITIAL_MESSAGE.to_string(),
            last_update: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

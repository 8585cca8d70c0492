//! Shared domain types for the Pictora live-progress client.
//!
//! Pure data and logic with no I/O: execution identifiers, job status,
//! the generation step vocabulary, and the per-job progress snapshot
//! held by the tracking layer.

pub mod progress;
pub mod types;

pub use progress::{JobStatus, ProgressSnapshot};
pub use types::ExecutionId;

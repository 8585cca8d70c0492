//! Core identifier types shared across crates.

/// Opaque identifier of one generation request, issued by the job
/// submission API when a batch is started.
pub type ExecutionId = String;

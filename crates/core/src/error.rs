//! Error taxonomy shared across the engine.

/// Structured error code recorded on a job that was rejected at admission
/// time (missing or empty normalized payload).
pub const CODE_MISSING_PAYLOAD: &str = "E_MISSING_PAYLOAD";

/// Structured error code recorded on a job whose declared dependency was
/// known not-ready before dispatch. Tagged distinctly from an execution
/// failure so it is never retried.
pub const CODE_NOT_READY: &str = "E_NOT_READY";

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("Internal error: {0}")]
    Internal(String),
}

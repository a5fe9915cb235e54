//! Seam traits between the engine and the generation backend.
//!
//! The engine never talks to the backend directly: it is handed a
//! [`JobExecutor`], a [`CrashClassifier`] that decides which failures
//! mean "the dependent service died", and a [`ReadinessGate`] consulted
//! before dispatch. All three are injected so retry policy and gating
//! stay testable and portable.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use stagehand_core::types::Job;

/// The injected execution backend.
///
/// `execute` may block for arbitrary duration; it runs exclusively on
/// the runner's worker task (or on the caller's task in direct mode).
/// Cancellation is cooperative: implementations should poll `cancel`
/// at natural checkpoints and bail out with an error when it fires.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Classifies an execution error as a dependent-service crash.
///
/// Exactly one error class triggers the restart-and-retry policy; the
/// engine performs no string matching of its own.
pub trait CrashClassifier: Send + Sync {
    fn is_dependent_crash(&self, error: &anyhow::Error) -> bool;
}

/// Classifier that never retries anything. Default for tests and for
/// deployments without a restartable backend.
pub struct NeverCrash;

impl CrashClassifier for NeverCrash {
    fn is_dependent_crash(&self, _error: &anyhow::Error) -> bool {
        false
    }
}

/// Pre-dispatch gate for declared job dependencies.
///
/// A `Err(reason)` verdict skips execution entirely: the job is failed
/// with a readiness code, tagged distinctly from an execution failure,
/// and never retried.
pub trait ReadinessGate: Send + Sync {
    fn check(&self, job: &Job) -> Result<(), String>;
}

/// Gate that lets every job through.
pub struct AlwaysReady;

impl ReadinessGate for AlwaysReady {
    fn check(&self, _job: &Job) -> Result<(), String> {
        Ok(())
    }
}

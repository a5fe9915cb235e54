//! Job entity model and the small value types that orbit it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All timestamps are UTC.
pub type Timestamp = DateTime<Utc>;

/// Opaque job identifier. Supplied by the caller or generated at
/// submission time (UUID v4).
pub type JobId = String;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Scheduling priority. Ordering matters: `Low < Normal < High`.
///
/// Immutable after job creation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl JobPriority {
    /// Human-readable label (used in summaries and log fields).
    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Job lifecycle status. `Completed`, `Failed` and `Cancelled` are
/// terminal: a job in one of those states is read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

// ---------------------------------------------------------------------------
// Run mode
// ---------------------------------------------------------------------------

/// How a job reaches the executor: synchronously on the caller's task
/// (`Direct`) or via the background runner (`Queue`, the default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunMode {
    Direct,
    #[default]
    Queue,
}

// ---------------------------------------------------------------------------
// Retry audit trail
// ---------------------------------------------------------------------------

/// One entry in a job's ordered retry-attempt log, appended when the
/// runner restarts the dependent service and retries the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt index.
    pub attempt: u32,
    /// Stage that was executing when the failure occurred, if known.
    pub stage: Option<String>,
    /// Why the retry happened (classifier verdict + original error text).
    pub reason: String,
    pub timestamp: Timestamp,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// The scheduled unit of work.
///
/// Created by a submission call, mutated only by the queue (status) and
/// the runner (execution fields) under the queue lock, read-only once
/// terminal. Exactly one of `result` / `error` is set on a terminal job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    /// Fully-resolved normalized configuration. Never mutated after
    /// creation; cleared when the job is finalized to bound memory.
    pub payload: serde_json::Value,
    /// Ordered stage chain, the bucketing key for duration estimates.
    #[serde(default)]
    pub stages: Vec<String>,
    /// Set only on success.
    pub result: Option<serde_json::Value>,
    /// Set only on failure.
    pub error: Option<String>,
    /// Structured code for admission / readiness rejections.
    pub error_code: Option<String>,
    #[serde(default)]
    pub retry_attempts: Vec<RetryAttempt>,
    /// OS process ids spawned on this job's behalf, reaped at finalize.
    #[serde(default)]
    pub external_pids: Vec<u32>,
    #[serde(default)]
    pub run_mode: RunMode,
    /// Which subsystem submitted the job (free-form tag).
    #[serde(default)]
    pub source: String,
}

impl Job {
    /// Create a queued job with the given id and normalized payload.
    pub fn new(id: impl Into<JobId>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            priority: JobPriority::default(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            payload,
            stages: Vec::new(),
            result: None,
            error: None,
            error_code: None,
            retry_attempts: Vec::new(),
            external_pids: Vec::new(),
            run_mode: RunMode::default(),
            source: String::new(),
        }
    }

    /// Create a job with a generated UUID v4 id.
    pub fn with_generated_id(payload: serde_json::Value) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), payload)
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Stage-chain signature used as the estimation bucket key.
    pub fn chain_signature(&self) -> String {
        self.stages.join(">")
    }

    /// Wall-clock duration in milliseconds, available once both
    /// timestamps are set.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Lightweight row describing one queued/recent job, fanned out to
/// collaborators on every queue change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub created_at: Timestamp,
    pub run_mode: RunMode,
    pub source: String,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            priority: job.priority,
            status: job.status,
            created_at: job.created_at,
            run_mode: job.run_mode,
            source: job.source.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(JobPriority::Low < JobPriority::Normal);
        assert!(JobPriority::Normal < JobPriority::High);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn new_job_defaults() {
        let job = Job::new("j-1", serde_json::json!({"k": "v"}));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.run_mode, RunMode::Queue);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
        assert!(job.retry_attempts.is_empty());
    }

    #[test]
    fn chain_signature_joins_stages() {
        let job = Job::new("j-1", serde_json::Value::Null)
            .with_stages(vec!["pose".into(), "refine".into(), "upscale".into()]);
        assert_eq!(job.chain_signature(), "pose>refine>upscale");
    }

    #[test]
    fn duration_requires_both_timestamps() {
        let mut job = Job::new("j-1", serde_json::Value::Null);
        assert_eq!(job.duration_ms(), None);

        let start = Utc::now();
        job.started_at = Some(start);
        assert_eq!(job.duration_ms(), None);

        job.completed_at = Some(start + chrono::Duration::milliseconds(1500));
        assert_eq!(job.duration_ms(), Some(1500));
    }

    #[test]
    fn priority_serializes_uppercase() {
        let json = serde_json::to_string(&JobPriority::High).unwrap();
        assert_eq!(json, "\"HIGH\"");
        let back: JobPriority = serde_json::from_str("\"LOW\"").unwrap();
        assert_eq!(back, JobPriority::Low);
    }
}

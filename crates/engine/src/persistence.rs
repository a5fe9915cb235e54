//! Versioned queue snapshot save/load/migrate.
//!
//! Snapshots survive restarts of the surrounding application. Saves are
//! atomic (temp file + rename); loads tolerate a missing file (`None`)
//! and malformed content (`None`, logged). Older schema versions are
//! migrated to the current shape job by job; a job that cannot be
//! migrated is skipped with a warning rather than failing the restore.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stagehand_core::types::{Job, JobPriority, JobStatus, RunMode};

/// Current snapshot schema version.
pub const SCHEMA_VERSION: u32 = 3;

/// Persisted queue state: non-terminal jobs plus the two control flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub schema_version: u32,
    pub jobs: Vec<Job>,
    pub auto_run_enabled: bool,
    pub paused: bool,
}

impl QueueSnapshot {
    pub fn new(jobs: Vec<Job>, auto_run_enabled: bool, paused: bool) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            jobs,
            auto_run_enabled,
            paused,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("Failed to serialize queue snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write queue snapshot: {0}")]
    Io(#[from] std::io::Error),
}

/// Atomically write a snapshot: serialize to `<path>.tmp`, then rename.
pub fn save(snapshot: &QueueSnapshot, path: &Path) -> Result<(), PersistError> {
    let json = serde_json::to_string_pretty(snapshot)?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;

    tracing::debug!(path = %path.display(), jobs = snapshot.jobs.len(), "Queue snapshot saved");
    Ok(())
}

/// Load and migrate a snapshot.
///
/// Returns `None` when the file does not exist or cannot be parsed; the
/// caller starts with an empty queue either way.
pub fn load(path: &Path) -> Option<QueueSnapshot> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read queue snapshot");
            return None;
        }
    };

    let value: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Malformed queue snapshot, ignoring");
            return None;
        }
    };

    Some(migrate(value))
}

/// Normalize a version-tagged snapshot value into the current shape.
///
/// Versions newer than [`SCHEMA_VERSION`] load best-effort with a
/// warning; unknown fields are ignored.
pub fn migrate(value: Value) -> QueueSnapshot {
    let version = value
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;

    if version > SCHEMA_VERSION {
        tracing::warn!(
            found = version,
            supported = SCHEMA_VERSION,
            "Queue snapshot from a newer schema, loading best-effort",
        );
    }

    let auto_run_enabled = value
        .get("auto_run_enabled")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let paused = value.get("paused").and_then(Value::as_bool).unwrap_or(false);

    let raw_jobs = value
        .get("jobs")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut jobs = Vec::with_capacity(raw_jobs.len());
    for raw in raw_jobs {
        let migrated = match version {
            0 | 1 => migrate_v1_job(raw),
            2 => migrate_v2_job(raw),
            _ => parse_current_job(raw),
        };
        match migrated {
            Some(job) => {
                if let Some(job) = restorable(job) {
                    jobs.push(job);
                }
            }
            None => {
                tracing::warn!(version, "Skipping unmigratable job descriptor");
            }
        }
    }

    QueueSnapshot::new(jobs, auto_run_enabled, paused)
}

/// Only queued-equivalent jobs are restored: terminal ones are dropped,
/// and a job interrupted mid-run goes back to the queue. A restored job
/// always runs through the background queue; its original direct-mode
/// caller is gone.
fn restorable(mut job: Job) -> Option<Job> {
    if job.status.is_terminal() {
        return None;
    }
    if job.status == JobStatus::Running {
        job.status = JobStatus::Queued;
        job.started_at = None;
    }
    job.run_mode = RunMode::Queue;
    Some(job)
}

fn parse_current_job(raw: Value) -> Option<Job> {
    match serde_json::from_value::<Job>(raw) {
        Ok(job) => Some(job),
        Err(e) => {
            tracing::warn!(error = %e, "Job descriptor does not match current schema");
            None
        }
    }
}

/// v1 descriptors carried an integer `prio` (10 / 0 / -10), the payload
/// under `config`, and no run mode or source tag.
fn migrate_v1_job(raw: Value) -> Option<Job> {
    let id = raw.get("id")?.as_str()?.to_string();
    let payload = raw.get("config").cloned().unwrap_or(Value::Null);

    let priority = match raw.get("prio").and_then(Value::as_i64).unwrap_or(0) {
        p if p > 0 => JobPriority::High,
        p if p < 0 => JobPriority::Low,
        _ => JobPriority::Normal,
    };

    let mut job = Job::new(id, payload).with_priority(priority);
    apply_common_fields(&mut job, &raw);
    Some(job)
}

/// v2 descriptors used lowercase string priorities and the current
/// `payload` field, but had no `source` tag.
fn migrate_v2_job(raw: Value) -> Option<Job> {
    let id = raw.get("id")?.as_str()?.to_string();
    let payload = raw.get("payload").cloned().unwrap_or(Value::Null);

    let priority = match raw.get("priority").and_then(Value::as_str).unwrap_or("normal") {
        "high" => JobPriority::High,
        "low" => JobPriority::Low,
        _ => JobPriority::Normal,
    };

    let mut job = Job::new(id, payload).with_priority(priority);
    apply_common_fields(&mut job, &raw);
    Some(job)
}

/// Fields whose wire shape never changed across versions.
fn apply_common_fields(job: &mut Job, raw: &Value) {
    if let Some(status) = raw.get("status").and_then(Value::as_str) {
        job.status = match status.to_ascii_uppercase().as_str() {
            "RUNNING" => JobStatus::Running,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" => JobStatus::Failed,
            "CANCELLED" => JobStatus::Cancelled,
            _ => JobStatus::Queued,
        };
    }
    if let Some(created) = raw.get("created_at").and_then(Value::as_str) {
        if let Ok(ts) = created.parse() {
            job.created_at = ts;
        }
    }
    if let Some(stages) = raw.get("stages").and_then(Value::as_array) {
        job.stages = stages
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    if let Some(source) = raw.get("source").and_then(Value::as_str) {
        job.source = source.to_string();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

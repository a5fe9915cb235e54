//! Append-only persisted lifecycle history.
//!
//! One newline-delimited JSON record per lifecycle event. The log is the
//! durable audit/replay record; on read, the most recent entry per
//! `job_id` is authoritative. Malformed lines are skipped with a warning
//! so a partially corrupted log never takes the engine down.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use stagehand_core::types::{Job, JobId, JobStatus, RunMode, Timestamp};

/// Denormalized snapshot of a job's state at one lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_id: JobId,
    pub status: JobStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    /// Computed exactly once, at the terminal transition, as
    /// completed-minus-started in milliseconds.
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub worker_id: String,
    pub run_mode: RunMode,
    #[serde(default)]
    pub stages: Vec<String>,
    /// Opaque replay payload, captured at submission.
    pub payload: serde_json::Value,
    pub recorded_at: Timestamp,
}

impl HistoryEntry {
    /// Stage-chain signature, the duration-stats bucket key.
    pub fn chain_signature(&self) -> String {
        self.stages.join(">")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Failed to open history log {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
}

struct HistoryInner {
    entries: Vec<HistoryEntry>,
    file: Option<File>,
}

/// Append-only lifecycle log with serialized writes.
pub struct HistoryStore {
    inner: Mutex<HistoryInner>,
    /// Identifies this engine instance in persisted entries.
    worker_id: String,
}

impl HistoryStore {
    /// Open (or create) a file-backed history log, loading any existing
    /// entries so reads span prior runs.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        let entries = if path.exists() {
            Self::load_entries(path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| HistoryError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::info!(path = %path.display(), loaded = entries.len(), "History log opened");

        Ok(Self {
            inner: Mutex::new(HistoryInner {
                entries,
                file: Some(file),
            }),
            worker_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// History without a backing file. Used by tests and direct-mode
    /// tooling that does not need durability.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(HistoryInner {
                entries: Vec::new(),
                file: None,
            }),
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn load_entries(path: &Path) -> Result<Vec<HistoryEntry>, HistoryError> {
        let file = File::open(path).map_err(|source| HistoryError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let mut entries = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(line = line_no + 1, error = %e, "Unreadable history line, stopping load");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(line = line_no + 1, error = %e, "Skipping malformed history line");
                }
            }
        }
        Ok(entries)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Record the admission of a new job.
    pub fn record_job_submission(&self, job: &Job) {
        self.append(self.entry_for(job));
    }

    /// Record a status transition. `duration_ms` is filled only when the
    /// new status is terminal.
    pub fn record_status_change(&self, job: &Job) {
        self.append(self.entry_for(job));
    }

    fn entry_for(&self, job: &Job) -> HistoryEntry {
        HistoryEntry {
            job_id: job.id.clone(),
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            duration_ms: if job.status.is_terminal() {
                job.duration_ms()
            } else {
                None
            },
            error: job.error.clone(),
            result: job.result.clone(),
            worker_id: self.worker_id.clone(),
            run_mode: job.run_mode,
            stages: job.stages.clone(),
            payload: job.payload.clone(),
            recorded_at: Utc::now(),
        }
    }

    fn append(&self, entry: HistoryEntry) {
        let mut inner = self.inner.lock().expect("history mutex poisoned");

        if let Some(file) = inner.file.as_mut() {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
                        tracing::error!(job_id = %entry.job_id, error = %e, "Failed to append history entry");
                    }
                }
                Err(e) => {
                    tracing::error!(job_id = %entry.job_id, error = %e, "Failed to serialize history entry");
                }
            }
        }

        inner.entries.push(entry);
    }

    /// Latest entry per job id, newest job first, paginated.
    pub fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Vec<HistoryEntry> {
        let inner = self.inner.lock().expect("history mutex poisoned");

        // Later appends supersede earlier ones for the same job id.
        let mut latest: HashMap<&str, &HistoryEntry> = HashMap::new();
        for entry in &inner.entries {
            latest.insert(entry.job_id.as_str(), entry);
        }

        let mut jobs: Vec<HistoryEntry> = latest
            .into_values()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        jobs.into_iter().skip(offset).take(limit).collect()
    }

    /// Latest entry for a single job id.
    pub fn get_job(&self, id: &str) -> Option<HistoryEntry> {
        let inner = self.inner.lock().expect("history mutex poisoned");
        inner
            .entries
            .iter()
            .rev()
            .find(|e| e.job_id == id)
            .cloned()
    }

    /// The most recent `window` raw entries, oldest first. Feed for the
    /// duration stats service.
    pub fn recent_entries(&self, window: usize) -> Vec<HistoryEntry> {
        let inner = self.inner.lock().expect("history mutex poisoned");
        let start = inner.entries.len().saturating_sub(window);
        inner.entries[start..].to_vec()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Thread-safe priority + FIFO job queue.
//!
//! All queue state lives behind a single mutex; every mutating operation
//! is atomic relative to the others. Ordering is a max-heap keyed by
//! (priority, submission sequence); reordering operations invalidate
//! heap entries by bumping sequence numbers, and stale entries are
//! discarded while draining rather than reinserted.
//!
//! "Not found" conditions return `false`/`None`, never errors.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use stagehand_core::heartbeat::{HeartbeatSignal, Heartbeats};
use stagehand_core::scheduling::validate_transition;
use stagehand_core::types::{Job, JobId, JobPriority, JobStatus, JobSummary, RetryAttempt, RunMode};

use crate::history::HistoryStore;

/// Finalized jobs retained in memory before the history log becomes the
/// only record.
pub const RECENT_CACHE_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// Heap ordering
// ---------------------------------------------------------------------------

#[derive(Eq, PartialEq)]
struct HeapEntry {
    priority: JobPriority,
    seq: u64,
    id: JobId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

struct QueueInner {
    /// Every non-finalized job, keyed by id.
    jobs: HashMap<JobId, Job>,
    /// Current submission sequence per still-queued job. A heap entry is
    /// live only while its sequence matches this map.
    seqs: HashMap<JobId, u64>,
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
    /// Bounded cache of finalized jobs, oldest first.
    recent: VecDeque<Job>,
}

/// Thread-safe admission, ordering, and status-transition gateway.
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    paused: AtomicBool,
    history: Option<Arc<HistoryStore>>,
    heartbeats: Option<Arc<Heartbeats>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                jobs: HashMap::new(),
                seqs: HashMap::new(),
                heap: BinaryHeap::new(),
                next_seq: 0,
                recent: VecDeque::with_capacity(RECENT_CACHE_CAPACITY),
            }),
            paused: AtomicBool::new(false),
            history: None,
            heartbeats: None,
        }
    }

    /// Forward submissions and status changes to a history log.
    pub fn with_history(mut self, history: Arc<HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Beat the `queue` signal on every mutation.
    pub fn with_heartbeats(mut self, heartbeats: Arc<Heartbeats>) -> Self {
        self.heartbeats = Some(heartbeats);
        self
    }

    fn beat(&self) {
        if let Some(hb) = &self.heartbeats {
            hb.beat(HeartbeatSignal::Queue);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("queue mutex poisoned")
    }

    // -- admission ----------------------------------------------------------

    /// Admit a job, assigning the monotonic FIFO tie-break sequence.
    ///
    /// A duplicate id overwrites the existing job. This is a deliberate,
    /// documented choice: resubmission replaces the older pending entry
    /// (the stale heap entry is discarded while draining).
    ///
    /// Direct-mode jobs are tracked but never entered into the dispatch
    /// order; their submitter executes them via `claim`.
    pub fn submit(&self, job: Job) {
        let snapshot = {
            let mut inner = self.lock();
            if inner.jobs.contains_key(&job.id) {
                tracing::warn!(job_id = %job.id, "Duplicate job id submitted, overwriting");
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;

            if job.run_mode == RunMode::Queue {
                inner.heap.push(HeapEntry {
                    priority: job.priority,
                    seq,
                    id: job.id.clone(),
                });
                inner.seqs.insert(job.id.clone(), seq);
            } else {
                inner.seqs.remove(&job.id);
            }
            inner.jobs.insert(job.id.clone(), job.clone());
            job
        };

        if let Some(history) = &self.history {
            history.record_job_submission(&snapshot);
        }
        self.beat();
        tracing::debug!(job_id = %snapshot.id, priority = snapshot.priority.label(), "Job queued");
    }

    // -- draining -----------------------------------------------------------

    /// Pop the highest-priority, earliest-submitted job still queued.
    ///
    /// Stale entries (reordered, removed, overwritten, or claimed jobs)
    /// encountered while draining are dropped without reinsertion.
    pub fn get_next_job(&self) -> Option<Job> {
        let mut inner = self.lock();
        while let Some(entry) = inner.heap.pop() {
            let live = inner.seqs.get(&entry.id) == Some(&entry.seq)
                && inner
                    .jobs
                    .get(&entry.id)
                    .map_or(false, |j| j.status == JobStatus::Queued);
            if !live {
                continue;
            }
            inner.seqs.remove(&entry.id);
            return inner.jobs.get(&entry.id).cloned();
        }
        None
    }

    /// Take a specific queued job out of the dispatch order (direct-mode
    /// execution). The job stays in the queue map for status tracking.
    pub fn claim(&self, id: &str) -> Option<Job> {
        let mut inner = self.lock();
        let job = inner.jobs.get(id).cloned()?;
        if job.status != JobStatus::Queued {
            return None;
        }
        inner.seqs.remove(id);
        Some(job)
    }

    // -- status transitions -------------------------------------------------

    /// Transition a job to RUNNING, stamping `started_at`.
    pub fn mark_running(&self, id: &str) -> bool {
        let snapshot = {
            let mut inner = self.lock();
            let Some(job) = inner.jobs.get_mut(id) else {
                return false;
            };
            if let Err(e) = validate_transition(job.status, JobStatus::Running) {
                tracing::warn!(job_id = %id, error = %e, "Rejected transition to RUNNING");
                return false;
            }
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.clone()
        };

        if let Some(history) = &self.history {
            history.record_status_change(&snapshot);
        }
        self.beat();
        true
    }

    pub fn mark_completed(&self, id: &str, result: serde_json::Value) -> Option<Job> {
        self.finalize(id, JobStatus::Completed, Some(result), None, None)
    }

    pub fn mark_failed(
        &self,
        id: &str,
        error: impl Into<String>,
        error_code: Option<&str>,
    ) -> Option<Job> {
        self.finalize(
            id,
            JobStatus::Failed,
            None,
            Some(error.into()),
            error_code.map(str::to_string),
        )
    }

    pub fn mark_cancelled(&self, id: &str) -> Option<Job> {
        self.finalize(id, JobStatus::Cancelled, None, None, None)
    }

    /// Terminal transition: sets the outcome, clears the payload to
    /// bound memory, and moves the job into the bounded recent cache.
    fn finalize(
        &self,
        id: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        error_code: Option<String>,
    ) -> Option<Job> {
        let snapshot = {
            let mut inner = self.lock();
            let mut job = inner.jobs.remove(id)?;
            if let Err(e) = validate_transition(job.status, status) {
                tracing::warn!(job_id = %id, error = %e, "Rejected terminal transition");
                inner.jobs.insert(job.id.clone(), job);
                return None;
            }

            job.status = status;
            job.completed_at = Some(Utc::now());
            job.result = result;
            job.error = error;
            job.error_code = error_code;
            // Read-only from here on; the payload is dropped to bound memory.
            job.payload = serde_json::Value::Null;

            inner.seqs.remove(id);
            inner.recent.push_back(job.clone());
            if inner.recent.len() > RECENT_CACHE_CAPACITY {
                inner.recent.pop_front();
            }
            job
        };

        if let Some(history) = &self.history {
            history.record_status_change(&snapshot);
        }
        self.beat();
        Some(snapshot)
    }

    // -- execution bookkeeping ----------------------------------------------

    /// Append an entry to a job's retry audit trail.
    pub fn append_retry_attempt(&self, id: &str, attempt: RetryAttempt) -> bool {
        let mut inner = self.lock();
        match inner.jobs.get_mut(id) {
            Some(job) => {
                job.retry_attempts.push(attempt);
                true
            }
            None => false,
        }
    }

    /// Track an OS process spawned on the job's behalf.
    pub fn register_external_pid(&self, id: &str, pid: u32) -> bool {
        let mut inner = self.lock();
        match inner.jobs.get_mut(id) {
            Some(job) => {
                if !job.external_pids.contains(&pid) {
                    job.external_pids.push(pid);
                }
                true
            }
            None => false,
        }
    }

    // -- queries ------------------------------------------------------------

    /// Snapshot copy of jobs (active plus recent finalized), optionally
    /// filtered by status. Never a live reference.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = Vec::new();

        for id in Self::pending_order(&inner) {
            if let Some(job) = inner.jobs.get(&id) {
                jobs.push(job.clone());
            }
        }
        let mut running: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .cloned()
            .collect();
        running.sort_by_key(|j| j.started_at);
        jobs.extend(running);
        jobs.extend(inner.recent.iter().rev().cloned());

        match status {
            Some(s) => jobs.into_iter().filter(|j| j.status == s).collect(),
            None => jobs,
        }
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        let inner = self.lock();
        inner
            .jobs
            .get(id)
            .or_else(|| inner.recent.iter().rev().find(|j| j.id == id))
            .cloned()
    }

    /// Lightweight rows for the queue-updated event.
    pub fn summaries(&self) -> Vec<JobSummary> {
        self.list_jobs(None).iter().map(JobSummary::from).collect()
    }

    pub fn queued_count(&self) -> usize {
        let inner = self.lock();
        inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .count()
    }

    /// Non-terminal jobs in dispatch order, for queue snapshots.
    pub fn non_terminal_jobs(&self) -> Vec<Job> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = Vec::new();
        for id in Self::pending_order(&inner) {
            if let Some(job) = inner.jobs.get(&id) {
                jobs.push(job.clone());
            }
        }
        let mut running: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .cloned()
            .collect();
        running.sort_by_key(|j| j.started_at);
        // Interrupted running jobs are restored as queued-equivalent.
        jobs.extend(running);
        jobs
    }

    /// Still-queued job ids in drain order.
    fn pending_order(inner: &QueueInner) -> Vec<JobId> {
        let mut pending: Vec<(Reverse<JobPriority>, u64, JobId)> = inner
            .seqs
            .iter()
            .filter(|(id, _)| {
                inner
                    .jobs
                    .get(*id)
                    .map_or(false, |j| j.status == JobStatus::Queued)
            })
            .map(|(id, &seq)| {
                let priority = inner.jobs[id].priority;
                (Reverse(priority), seq, id.clone())
            })
            .collect();
        pending.sort();
        pending.into_iter().map(|(_, _, id)| id).collect()
    }

    // -- reordering ---------------------------------------------------------

    /// Swap a queued job with its predecessor in the drain order.
    ///
    /// Returns `false` if the job is absent, not queued, already at the
    /// head, or at the head of its priority band (priority is immutable,
    /// so reordering never crosses a band boundary).
    pub fn move_up(&self, id: &str) -> bool {
        self.swap_adjacent(id, true)
    }

    /// Swap a queued job with its successor in the drain order. Boundary
    /// rules mirror [`move_up`](Self::move_up).
    pub fn move_down(&self, id: &str) -> bool {
        self.swap_adjacent(id, false)
    }

    fn swap_adjacent(&self, id: &str, up: bool) -> bool {
        let mut inner = self.lock();
        let order = Self::pending_order(&inner);
        let Some(pos) = order.iter().position(|j| j == id) else {
            return false;
        };

        let neighbor_pos = if up {
            if pos == 0 {
                return false;
            }
            pos - 1
        } else {
            if pos + 1 >= order.len() {
                return false;
            }
            pos + 1
        };
        let neighbor = order[neighbor_pos].clone();

        if inner.jobs[&neighbor].priority != inner.jobs[id].priority {
            return false;
        }

        let seq_a = inner.seqs[id];
        let seq_b = inner.seqs[&neighbor];
        inner.seqs.insert(id.to_string(), seq_b);
        inner.seqs.insert(neighbor.clone(), seq_a);

        // Fresh heap entries; the old ones are now stale and will be
        // discarded while draining.
        let priority = inner.jobs[id].priority;
        inner.heap.push(HeapEntry {
            priority,
            seq: seq_b,
            id: id.to_string(),
        });
        inner.heap.push(HeapEntry {
            priority,
            seq: seq_a,
            id: neighbor,
        });

        drop(inner);
        self.beat();
        true
    }

    // -- removal ------------------------------------------------------------

    /// Remove a still-queued job. Running and finalized jobs are not
    /// removable this way.
    pub fn remove(&self, id: &str) -> Option<Job> {
        let mut inner = self.lock();
        if inner.jobs.get(id)?.status != JobStatus::Queued {
            return None;
        }
        inner.seqs.remove(id);
        let job = inner.jobs.remove(id);
        drop(inner);
        self.beat();
        job
    }

    /// Remove every still-queued job, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let queued: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .map(|j| j.id.clone())
            .collect();
        for id in &queued {
            inner.jobs.remove(id);
            inner.seqs.remove(id);
        }
        inner.heap.clear();
        drop(inner);
        self.beat();
        queued.len()
    }

    // -- pause flag ---------------------------------------------------------

    /// Stop the runner's poll loop from dispatching. Does not preempt an
    /// already-dispatched job.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

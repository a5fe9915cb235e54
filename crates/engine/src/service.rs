//! Orchestration facade tying queue, runner, history, stats, snapshots
//! and external-process tracking together behind one API.
//!
//! Callers construct a [`JobService`] with their executor and policy
//! traits, call [`JobService::startup`] once, and interact only through
//! this type afterwards.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use stagehand_core::error::CODE_MISSING_PAYLOAD;
use stagehand_core::heartbeat::{HeartbeatSignal, Heartbeats};
use stagehand_core::types::{Job, JobId, JobStatus, RunMode};
use stagehand_events::{EventBus, JobEvent, QueueState};

use crate::executor::{CrashClassifier, JobExecutor, ReadinessGate};
use crate::history::{HistoryEntry, HistoryStore};
use crate::persistence::{self, PersistError, QueueSnapshot};
use crate::procs::ExternalProcs;
use crate::queue::JobQueue;
use crate::runner::{JobRunner, RunnerConfig};
use crate::stats::{DurationStatsService, StatsConfig};
use crate::supervisor::ServiceSupervisor;

/// Service-level configuration. Paths default to `None`, which keeps
/// everything in memory (the test configuration).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Start the background runner during `startup`. Overridden by the
    /// persisted value when a snapshot is restored.
    pub auto_run: bool,
    /// Where the queue snapshot is written; `None` disables persistence.
    pub snapshot_path: Option<PathBuf>,
    /// Where the history log lives; `None` keeps history in memory.
    pub history_path: Option<PathBuf>,
    /// Grace period between TERM and KILL for tracked external processes.
    pub process_grace: Duration,
    pub runner: RunnerConfig,
    pub stats: StatsConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            auto_run: true,
            snapshot_path: None,
            history_path: None,
            process_grace: Duration::from_secs(5),
            runner: RunnerConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

pub struct JobService {
    queue: Arc<JobQueue>,
    runner: Arc<JobRunner>,
    history: Arc<HistoryStore>,
    stats: DurationStatsService,
    bus: Arc<EventBus>,
    procs: Arc<ExternalProcs>,
    heartbeats: Arc<Heartbeats>,
    auto_run: AtomicBool,
    snapshot_path: Option<PathBuf>,
}

impl JobService {
    pub fn new(
        executor: Arc<dyn JobExecutor>,
        classifier: Arc<dyn CrashClassifier>,
        supervisor: Arc<dyn ServiceSupervisor>,
        readiness: Arc<dyn ReadinessGate>,
        config: ServiceConfig,
    ) -> anyhow::Result<Self> {
        let history = Arc::new(match &config.history_path {
            Some(path) => HistoryStore::open(path)?,
            None => HistoryStore::in_memory(),
        });
        let heartbeats = Arc::new(Heartbeats::new());
        let bus = Arc::new(EventBus::default());
        let procs = Arc::new(ExternalProcs::new().with_grace(config.process_grace));
        let queue = Arc::new(
            JobQueue::new()
                .with_history(Arc::clone(&history))
                .with_heartbeats(Arc::clone(&heartbeats)),
        );
        let stats = DurationStatsService::new(Arc::clone(&history), config.stats.clone());
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&queue),
            executor,
            classifier,
            supervisor,
            readiness,
            Arc::clone(&procs),
            Arc::clone(&bus),
            Arc::clone(&heartbeats),
            config.runner.clone(),
        ));

        Ok(Self {
            queue,
            runner,
            history,
            stats,
            bus,
            procs,
            heartbeats,
            auto_run: AtomicBool::new(config.auto_run),
            snapshot_path: config.snapshot_path,
        })
    }

    // -- lifecycle ----------------------------------------------------------

    /// Restore the persisted queue and start the runner per the
    /// effective auto-run flag.
    pub fn startup(&self) {
        if let Some(path) = &self.snapshot_path {
            if let Some(snapshot) = persistence::load(path) {
                let restored = snapshot.jobs.len();
                for job in snapshot.jobs {
                    self.queue.submit(job);
                }
                if snapshot.paused {
                    self.queue.pause();
                }
                self.auto_run.store(snapshot.auto_run_enabled, Ordering::SeqCst);
                tracing::info!(
                    restored,
                    paused = snapshot.paused,
                    auto_run = snapshot.auto_run_enabled,
                    "Queue snapshot restored",
                );
            }
        }

        if self.auto_run.load(Ordering::SeqCst) {
            self.runner.start();
        }
        self.publish_queue_updated();
    }

    /// Stop the runner and persist the queue.
    pub async fn shutdown(&self) {
        self.runner.stop().await;
        if let Err(e) = self.save_snapshot() {
            tracing::error!(error = %e, "Failed to persist queue during shutdown");
        }
    }

    pub fn save_snapshot(&self) -> Result<(), PersistError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let snapshot = QueueSnapshot::new(
            self.queue.non_terminal_jobs(),
            self.auto_run.load(Ordering::SeqCst),
            self.queue.is_paused(),
        );
        persistence::save(&snapshot, path)
    }

    pub async fn set_auto_run(&self, enabled: bool) {
        self.auto_run.store(enabled, Ordering::SeqCst);
        if enabled {
            self.runner.start();
        } else {
            self.runner.stop().await;
        }
    }

    pub fn auto_run_enabled(&self) -> bool {
        self.auto_run.load(Ordering::SeqCst)
    }

    // -- submission ---------------------------------------------------------

    /// Route a job by its run mode. Queue mode returns `Ok(None)`
    /// immediately; direct mode blocks until execution finishes and
    /// re-raises its failure.
    pub async fn submit_job(&self, job: Job) -> anyhow::Result<Option<serde_json::Value>> {
        match job.run_mode {
            RunMode::Queue => {
                self.submit_queued(job);
                Ok(None)
            }
            RunMode::Direct => Ok(Some(self.submit_direct(job).await?)),
        }
    }

    /// Enqueue for background execution and make sure the runner is up
    /// to drain it. Admission failures are recorded on the job and
    /// published; this path never raises.
    pub fn submit_queued(&self, job: Job) -> JobId {
        let job = job.with_run_mode(RunMode::Queue);
        let id = job.id.clone();

        if let Err(reason) = validate_payload(&job) {
            tracing::warn!(job_id = %id, reason = %reason, "Rejecting queued job at admission");
            self.queue.submit(job);
            if let Some(failed) = self.queue.mark_failed(&id, &reason, Some(CODE_MISSING_PAYLOAD)) {
                self.bus.publish(JobEvent::JobFailed(failed));
            }
            self.publish_queue_updated();
            return id;
        }

        self.queue.submit(job);
        // `start` is idempotent, so this also recovers a runner that was
        // stopped after a join timeout.
        if self.auto_run.load(Ordering::SeqCst) {
            self.runner.start();
        }
        self.publish_queue_updated();
        id
    }

    /// Execute immediately on the caller's task, bypassing the
    /// background runner. Admission failures are both recorded and
    /// re-raised.
    pub async fn submit_direct(&self, job: Job) -> anyhow::Result<serde_json::Value> {
        let job = job.with_run_mode(RunMode::Direct);
        let id = job.id.clone();

        if let Err(reason) = validate_payload(&job) {
            self.queue.submit(job);
            if let Some(failed) = self.queue.mark_failed(&id, &reason, Some(CODE_MISSING_PAYLOAD)) {
                self.bus.publish(JobEvent::JobFailed(failed));
            }
            self.publish_queue_updated();
            anyhow::bail!("Invalid payload for job {id}: {reason}");
        }

        self.queue.submit(job);
        self.publish_queue_updated();
        self.runner.run_once(&id).await
    }

    // -- queue control ------------------------------------------------------

    pub fn pause(&self) {
        self.queue.pause();
        self.bus.publish(JobEvent::QueueStatus(QueueState::Paused));
    }

    pub fn resume(&self) {
        self.queue.resume();
        self.bus.publish(JobEvent::QueueStatus(QueueState::Idle));
    }

    pub fn is_paused(&self) -> bool {
        self.queue.is_paused()
    }

    /// Cancel a job wherever it currently is: cooperatively if it is
    /// the one running, directly if it is still queued.
    pub fn cancel_job(&self, id: &str) -> bool {
        if self.runner.current_job_id().as_deref() == Some(id) {
            return self.runner.cancel_current();
        }
        let cancelled = self.queue.mark_cancelled(id).is_some();
        if cancelled {
            self.publish_queue_updated();
        }
        cancelled
    }

    pub fn cancel_current(&self) -> bool {
        let cancelled = self.runner.cancel_current();
        if cancelled {
            self.publish_queue_updated();
        }
        cancelled
    }

    pub fn move_job_up(&self, id: &str) -> bool {
        let moved = self.queue.move_up(id);
        if moved {
            self.publish_queue_updated();
        }
        moved
    }

    pub fn move_job_down(&self, id: &str) -> bool {
        let moved = self.queue.move_down(id);
        if moved {
            self.publish_queue_updated();
        }
        moved
    }

    pub fn remove_job(&self, id: &str) -> Option<Job> {
        let removed = self.queue.remove(id);
        if removed.is_some() {
            self.publish_queue_updated();
        }
        removed
    }

    pub fn clear_queue(&self) -> usize {
        let cleared = self.queue.clear();
        if cleared > 0 {
            self.publish_queue_updated();
        }
        cleared
    }

    // -- inspection ---------------------------------------------------------

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        self.queue.list_jobs(status)
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.queue.get_job(id)
    }

    pub fn current_job_id(&self) -> Option<JobId> {
        self.runner.current_job_id()
    }

    pub fn job_history(
        &self,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Vec<HistoryEntry> {
        self.history.list_jobs(status, limit, offset)
    }

    pub fn history_entry(&self, id: &str) -> Option<HistoryEntry> {
        self.history.get_job(id)
    }

    // -- estimates ----------------------------------------------------------

    /// Recompute chain statistics and estimate total remaining queue
    /// time. Returns `(seconds, jobs_with_history_backed_estimates)`.
    pub fn queue_estimate(&self) -> (f64, usize) {
        self.stats.refresh();
        self.stats
            .queue_total_estimate(&self.queue.list_jobs(Some(JobStatus::Queued)))
    }

    pub fn stats(&self) -> &DurationStatsService {
        &self.stats
    }

    // -- external processes -------------------------------------------------

    /// Track a PID spawned on behalf of a job so it is torn down when
    /// the job finalizes.
    pub fn register_external_process(&self, id: &str, pid: u32) {
        self.procs.register(id, pid);
        self.queue.register_external_pid(id, pid);
    }

    pub fn cleanup_external_processes(&self, id: &str) -> usize {
        self.procs.cleanup(id)
    }

    // -- plumbing -----------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.bus.subscribe()
    }

    pub fn beat_ui(&self) {
        self.heartbeats.beat(HeartbeatSignal::Ui);
    }

    pub fn heartbeats(&self) -> &Arc<Heartbeats> {
        &self.heartbeats
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    fn publish_queue_updated(&self) {
        self.bus
            .publish(JobEvent::QueueUpdated(self.queue.summaries()));
    }
}

/// Admission rule: a payload must be a non-empty JSON object.
fn validate_payload(job: &Job) -> Result<(), String> {
    match &job.payload {
        serde_json::Value::Object(map) if !map.is_empty() => Ok(()),
        serde_json::Value::Object(_) => Err("job payload is empty".into()),
        other => Err(format!(
            "job payload must be an object, got {}",
            value_kind(other)
        )),
    }
}

fn value_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use crate::executor::{AlwaysReady, NeverCrash};
    use crate::supervisor::NoopSupervisor;

    /// Echoes the payload back as the result.
    struct EchoExecutor;

    #[async_trait]
    impl JobExecutor for EchoExecutor {
        async fn execute(
            &self,
            job: &Job,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({ "echo": job.payload }))
        }
    }

    fn service(config: ServiceConfig) -> JobService {
        JobService::new(
            Arc::new(EchoExecutor),
            Arc::new(NeverCrash),
            Arc::new(NoopSupervisor),
            Arc::new(AlwaysReady),
            config,
        )
        .unwrap()
    }

    fn in_memory_service() -> JobService {
        service(ServiceConfig {
            auto_run: false,
            ..ServiceConfig::default()
        })
    }

    // -- admission ----------------------------------------------------------

    #[tokio::test]
    async fn queued_submit_with_missing_payload_records_failure_without_raising() {
        let svc = in_memory_service();
        let mut events = svc.subscribe();

        let id = svc.submit_queued(Job::new("bad", serde_json::Value::Null));
        assert_eq!(id, "bad");

        let job = svc.get_job("bad").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code.as_deref(), Some(CODE_MISSING_PAYLOAD));

        // The failure is published, not raised.
        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(&event, JobEvent::JobFailed(j) if j.id == "bad") {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn direct_submit_with_missing_payload_records_and_raises() {
        let svc = in_memory_service();

        let result = svc
            .submit_direct(Job::new("bad", serde_json::json!({})))
            .await;
        assert!(result.is_err());

        let job = svc.get_job("bad").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code.as_deref(), Some(CODE_MISSING_PAYLOAD));
    }

    #[tokio::test]
    async fn direct_submit_executes_synchronously() {
        let svc = in_memory_service();

        let result = svc
            .submit_direct(Job::new("d", serde_json::json!({"scene": 7})))
            .await
            .unwrap();
        assert_eq!(result["echo"]["scene"], 7);
        assert_eq!(svc.get_job("d").unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn submit_job_routes_by_run_mode() {
        let svc = in_memory_service();

        let queued = svc
            .submit_job(Job::new("q", serde_json::json!({"scene": 1})))
            .await
            .unwrap();
        assert!(queued.is_none());
        assert_eq!(svc.get_job("q").unwrap().status, JobStatus::Queued);

        let direct = svc
            .submit_job(
                Job::new("d", serde_json::json!({"scene": 2})).with_run_mode(RunMode::Direct),
            )
            .await
            .unwrap();
        assert!(direct.is_some());
    }

    #[tokio::test]
    async fn submit_queued_starts_the_runner_when_auto_run_enabled() {
        let svc = service(ServiceConfig {
            auto_run: true,
            runner: RunnerConfig {
                poll_interval: Duration::from_millis(10),
                stop_join_timeout: Duration::from_secs(2),
            },
            ..ServiceConfig::default()
        });

        // No startup() call: submission alone must bring the runner up.
        svc.submit_queued(Job::new("solo", serde_json::json!({"scene": 1})));

        for _ in 0..200 {
            if svc.get_job("solo").map(|j| j.status) == Some(JobStatus::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        svc.shutdown().await;

        assert_eq!(svc.get_job("solo").unwrap().status, JobStatus::Completed);
    }

    // -- queue control ------------------------------------------------------

    #[tokio::test]
    async fn cancel_current_publishes_queue_update() {
        /// Executor that parks until cancelled.
        struct ParkingExecutor;

        #[async_trait]
        impl JobExecutor for ParkingExecutor {
            async fn execute(
                &self,
                _job: &Job,
                cancel: &CancellationToken,
            ) -> anyhow::Result<serde_json::Value> {
                cancel.cancelled().await;
                anyhow::bail!("interrupted")
            }
        }

        let svc = JobService::new(
            Arc::new(ParkingExecutor),
            Arc::new(NeverCrash),
            Arc::new(NoopSupervisor),
            Arc::new(AlwaysReady),
            ServiceConfig {
                auto_run: true,
                runner: RunnerConfig {
                    poll_interval: Duration::from_millis(10),
                    stop_join_timeout: Duration::from_secs(2),
                },
                ..ServiceConfig::default()
            },
        )
        .unwrap();

        svc.submit_queued(Job::new("parked", serde_json::json!({"scene": 1})));
        for _ in 0..200 {
            if svc.current_job_id().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut events = svc.subscribe();
        assert!(svc.cancel_current());

        let mut saw_update = false;
        for _ in 0..200 {
            while let Ok(event) = events.try_recv() {
                if matches!(event, JobEvent::QueueUpdated(_)) {
                    saw_update = true;
                }
            }
            if saw_update {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        svc.shutdown().await;

        assert!(saw_update);
        // Nothing running anymore, so a second cancel finds no target.
        assert!(!svc.cancel_current());
    }

    #[tokio::test]
    async fn cancel_queued_job() {
        let svc = in_memory_service();
        svc.submit_queued(Job::new("q", serde_json::json!({"scene": 1})));

        assert!(svc.cancel_job("q"));
        assert_eq!(svc.get_job("q").unwrap().status, JobStatus::Cancelled);
        // Second cancel finds nothing to do.
        assert!(!svc.cancel_job("q"));
    }

    #[tokio::test]
    async fn pause_resume_publish_status() {
        let svc = in_memory_service();
        let mut events = svc.subscribe();

        svc.pause();
        assert!(svc.is_paused());
        svc.resume();
        assert!(!svc.is_paused());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let JobEvent::QueueStatus(state) = event {
                states.push(state);
            }
        }
        assert_eq!(states, vec![QueueState::Paused, QueueState::Idle]);
    }

    // -- persistence --------------------------------------------------------

    #[tokio::test]
    async fn snapshot_round_trip_through_shutdown_and_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let svc = service(ServiceConfig {
            auto_run: false,
            snapshot_path: Some(path.clone()),
            ..ServiceConfig::default()
        });
        svc.submit_queued(Job::new("keep", serde_json::json!({"scene": 1})));
        svc.pause();
        svc.shutdown().await;

        let restored = service(ServiceConfig {
            auto_run: false,
            snapshot_path: Some(path),
            ..ServiceConfig::default()
        });
        restored.startup();

        assert_eq!(restored.get_job("keep").unwrap().status, JobStatus::Queued);
        assert!(restored.is_paused());
    }

    #[tokio::test]
    async fn startup_without_snapshot_starts_empty() {
        let svc = in_memory_service();
        svc.startup();
        assert!(svc.list_jobs(None).is_empty());
        svc.shutdown().await;
    }
}

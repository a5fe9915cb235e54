//! Background execution worker.
//!
//! Exactly one worker task drains the queue: poll, dispatch, execute,
//! finalize. `start`/`stop` are idempotent; `stop` performs a bounded
//! join and proceeds even if the worker is wedged (the watchdog surfaces
//! that case). Cancellation is cooperative only — the executor must poll
//! the token it is handed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use stagehand_core::error::CODE_NOT_READY;
use stagehand_core::heartbeat::{HeartbeatSignal, Heartbeats};
use stagehand_core::types::{Job, JobId, RetryAttempt};
use stagehand_events::{EventBus, JobEvent, QueueState};

use crate::executor::{CrashClassifier, JobExecutor, ReadinessGate};
use crate::procs::ExternalProcs;
use crate::queue::JobQueue;
use crate::supervisor::ServiceSupervisor;

/// Runner tunables, constructor-time only.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How often the worker polls the queue for the next job.
    pub poll_interval: Duration,
    /// Upper bound on waiting for the worker to join during `stop`.
    /// Long enough not to truncate a typical run.
    pub stop_join_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            stop_join_timeout: Duration::from_secs(30),
        }
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct CurrentJob {
    id: JobId,
    cancel: CancellationToken,
}

enum Outcome {
    Completed(serde_json::Value),
    Failed(anyhow::Error),
    Cancelled,
}

/// Single background worker draining the queue and invoking the
/// injected executor.
pub struct JobRunner {
    queue: Arc<JobQueue>,
    executor: Arc<dyn JobExecutor>,
    classifier: Arc<dyn CrashClassifier>,
    supervisor: Arc<dyn ServiceSupervisor>,
    readiness: Arc<dyn ReadinessGate>,
    procs: Arc<ExternalProcs>,
    bus: Arc<EventBus>,
    heartbeats: Arc<Heartbeats>,
    config: RunnerConfig,
    worker: Mutex<Option<Worker>>,
    current: Mutex<Option<CurrentJob>>,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<JobQueue>,
        executor: Arc<dyn JobExecutor>,
        classifier: Arc<dyn CrashClassifier>,
        supervisor: Arc<dyn ServiceSupervisor>,
        readiness: Arc<dyn ReadinessGate>,
        procs: Arc<ExternalProcs>,
        bus: Arc<EventBus>,
        heartbeats: Arc<Heartbeats>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            queue,
            executor,
            classifier,
            supervisor,
            readiness,
            procs,
            bus,
            heartbeats,
            config,
            worker: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Spawn the poll loop. Idempotent: a second call while the worker
    /// is alive is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().expect("runner mutex poisoned");
        if worker.as_ref().map_or(false, |w| !w.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let runner = Arc::clone(self);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            runner.run_loop(loop_cancel).await;
        });

        *worker = Some(Worker { cancel, handle });
        tracing::info!("Job runner started");
    }

    /// Signal the worker to stop and join it with a bounded timeout.
    ///
    /// Idempotent; a no-op on a non-running runner. Proceeds even when
    /// the join times out — a wedged `execute` is surfaced by the
    /// watchdog, never silently hidden.
    pub async fn stop(&self) {
        let worker = self.worker.lock().expect("runner mutex poisoned").take();
        let Some(worker) = worker else {
            tracing::debug!("Runner stop requested but worker is not running");
            return;
        };

        worker.cancel.cancel();
        match tokio::time::timeout(self.config.stop_join_timeout, worker.handle).await {
            Ok(_) => tracing::info!("Job runner stopped"),
            Err(_) => tracing::warn!(
                timeout_secs = self.config.stop_join_timeout.as_secs(),
                "Runner worker did not join in time, proceeding",
            ),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .expect("runner mutex poisoned")
            .as_ref()
            .map_or(false, |w| !w.handle.is_finished())
    }

    /// Id of the job currently dispatched to the executor, if any.
    pub fn current_job_id(&self) -> Option<JobId> {
        self.current
            .lock()
            .expect("runner mutex poisoned")
            .as_ref()
            .map(|c| c.id.clone())
    }

    /// Best-effort cooperative cancellation of the dispatched job.
    ///
    /// Effective only if the executor polls its cancellation token.
    pub fn cancel_current(&self) -> bool {
        match &*self.current.lock().expect("runner mutex poisoned") {
            Some(current) => {
                tracing::info!(job_id = %current.id, "Cancellation requested for running job");
                current.cancel.cancel();
                true
            }
            None => false,
        }
    }

    // -- poll loop ----------------------------------------------------------

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("Runner polling for jobs");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Runner poll loop exiting");
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            self.heartbeats.beat(HeartbeatSignal::Runner);

            if self.queue.is_paused() {
                continue;
            }

            let Some(job) = self.queue.get_next_job() else {
                continue;
            };

            self.bus.publish(JobEvent::QueueStatus(QueueState::Running));
            let id = job.id.clone();
            if let Err(e) = self.execute_job(job).await {
                tracing::warn!(job_id = %id, error = %e, "Queued job did not complete");
            }
            self.heartbeats.beat(HeartbeatSignal::Runner);

            if self.queue.queued_count() == 0 {
                self.bus.publish(JobEvent::QueueEmpty);
                self.bus.publish(JobEvent::QueueStatus(QueueState::Idle));
            }
        }
    }

    // -- execution ----------------------------------------------------------

    /// Synchronous direct-mode path: executes the already-admitted job
    /// on the caller's task and re-raises failures.
    pub async fn run_once(&self, id: &str) -> anyhow::Result<serde_json::Value> {
        let Some(job) = self.queue.claim(id) else {
            anyhow::bail!("Job {id} is not queued");
        };
        self.execute_job(job).await
    }

    /// Full dispatch of one job: readiness gate, RUNNING transition,
    /// execute with the one-shot crash-retry policy, finalize, publish.
    async fn execute_job(&self, job: Job) -> anyhow::Result<serde_json::Value> {
        let id = job.id.clone();

        // Readiness gate: skipped entirely, tagged distinctly from an
        // execution failure, never retried.
        if let Err(reason) = self.readiness.check(&job) {
            tracing::warn!(job_id = %id, reason = %reason, "Dependency not ready, skipping execution");
            let failed = self.queue.mark_failed(&id, &reason, Some(CODE_NOT_READY));
            self.cleanup_external(&id).await;
            if let Some(failed) = failed {
                self.bus.publish(JobEvent::JobFailed(failed));
            }
            self.publish_queue_updated();
            anyhow::bail!("Dependency not ready for job {id}: {reason}");
        }

        if !self.queue.mark_running(&id) {
            anyhow::bail!("Job {id} could not transition to RUNNING");
        }
        if let Some(running) = self.queue.get_job(&id) {
            self.bus.publish(JobEvent::JobStarted(running));
        }
        self.publish_queue_updated();

        let cancel = CancellationToken::new();
        *self.current.lock().expect("runner mutex poisoned") = Some(CurrentJob {
            id: id.clone(),
            cancel: cancel.clone(),
        });

        let mut retried = false;
        let outcome = loop {
            match self.executor.execute(&job, &cancel).await {
                Ok(result) => break Outcome::Completed(result),
                Err(_) if cancel.is_cancelled() => break Outcome::Cancelled,
                Err(error) => {
                    if !retried && self.classifier.is_dependent_crash(&error) {
                        retried = true;
                        tracing::warn!(
                            job_id = %id,
                            error = %error,
                            "Dependent service crash, restarting and retrying once",
                        );
                        let restart = self.supervisor.restart().await;
                        self.queue.append_retry_attempt(
                            &id,
                            RetryAttempt {
                                attempt: 1,
                                stage: None,
                                reason: format!(
                                    "dependent service crashed: {error} (restart: {})",
                                    restart.message,
                                ),
                                timestamp: Utc::now(),
                            },
                        );
                        continue;
                    }
                    // A second crash-class failure, or any other class,
                    // is terminal.
                    break Outcome::Failed(error);
                }
            }
        };

        *self.current.lock().expect("runner mutex poisoned") = None;
        self.cleanup_external(&id).await;
        self.heartbeats.beat(HeartbeatSignal::Runner);

        match outcome {
            Outcome::Completed(result) => {
                if let Some(done) = self.queue.mark_completed(&id, result.clone()) {
                    tracing::info!(job_id = %id, "Job completed");
                    self.bus.publish(JobEvent::JobFinished(done));
                }
                self.publish_queue_updated();
                Ok(result)
            }
            Outcome::Cancelled => {
                self.queue.mark_cancelled(&id);
                tracing::info!(job_id = %id, "Job cancelled");
                self.publish_queue_updated();
                anyhow::bail!("Job {id} was cancelled");
            }
            Outcome::Failed(error) => {
                if let Some(failed) = self.queue.mark_failed(&id, error.to_string(), None) {
                    tracing::error!(job_id = %id, error = %error, "Job failed");
                    self.bus.publish(JobEvent::JobFailed(failed));
                }
                self.publish_queue_updated();
                Err(error)
            }
        }
    }

    /// Tear down the job's registered OS processes on the blocking
    /// pool; termination polls the OS with sleeps and must not stall an
    /// async worker.
    async fn cleanup_external(&self, id: &JobId) {
        let procs = Arc::clone(&self.procs);
        let job_id = id.clone();
        match tokio::task::spawn_blocking(move || procs.cleanup(&job_id)).await {
            Ok(killed) if killed > 0 => {
                tracing::info!(job_id = %id, killed, "External processes cleaned up");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "External process cleanup task failed");
            }
        }
    }

    fn publish_queue_updated(&self) {
        self.bus
            .publish(JobEvent::QueueUpdated(self.queue.summaries()));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use crate::executor::AlwaysReady;
    use crate::supervisor::RestartOutcome;
    use stagehand_core::types::{JobStatus, RunMode};

    /// Executor fed a scripted sequence of outcomes.
    struct ScriptedExecutor {
        script: Mutex<VecDeque<Result<serde_json::Value, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<Result<serde_json::Value, String>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            _job: &Job,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(value)) => Ok(value),
                Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
                None => Ok(serde_json::json!({})),
            }
        }
    }

    /// Crash classifier keyed on a marker string in the test error.
    struct MarkerClassifier;

    impl CrashClassifier for MarkerClassifier {
        fn is_dependent_crash(&self, error: &anyhow::Error) -> bool {
            error.to_string().contains("BACKEND_DOWN")
        }
    }

    struct CountingSupervisor {
        restarts: AtomicUsize,
    }

    #[async_trait]
    impl ServiceSupervisor for CountingSupervisor {
        async fn restart(&self) -> RestartOutcome {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            RestartOutcome {
                success: true,
                message: "restarted".into(),
                duration_ms: 1,
            }
        }
    }

    struct Harness {
        queue: Arc<JobQueue>,
        runner: Arc<JobRunner>,
        supervisor: Arc<CountingSupervisor>,
        executor: Arc<ScriptedExecutor>,
        procs: Arc<ExternalProcs>,
    }

    fn harness(script: Vec<Result<serde_json::Value, String>>) -> Harness {
        harness_with_readiness(script, Arc::new(AlwaysReady))
    }

    fn harness_with_readiness(
        script: Vec<Result<serde_json::Value, String>>,
        readiness: Arc<dyn ReadinessGate>,
    ) -> Harness {
        let queue = Arc::new(JobQueue::new());
        let executor = Arc::new(ScriptedExecutor::new(script));
        let supervisor = Arc::new(CountingSupervisor {
            restarts: AtomicUsize::new(0),
        });
        let procs = Arc::new(ExternalProcs::new().with_grace(Duration::from_millis(100)));
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&queue),
            Arc::clone(&executor) as Arc<dyn JobExecutor>,
            Arc::new(MarkerClassifier),
            Arc::clone(&supervisor) as Arc<dyn ServiceSupervisor>,
            readiness,
            Arc::clone(&procs),
            Arc::new(EventBus::default()),
            Arc::new(Heartbeats::new()),
            RunnerConfig {
                poll_interval: Duration::from_millis(10),
                stop_join_timeout: Duration::from_secs(2),
            },
        ));
        Harness {
            queue,
            runner,
            supervisor,
            executor,
            procs,
        }
    }

    fn submit(queue: &JobQueue, id: &str) {
        queue.submit(
            Job::new(id, serde_json::json!({"scene": 1})).with_run_mode(RunMode::Direct),
        );
    }

    // -- retry policy -------------------------------------------------------

    #[tokio::test]
    async fn generic_error_fails_without_retry() {
        let h = harness(vec![Err("out of VRAM".into())]);
        submit(&h.queue, "j");

        let result = h.runner.run_once("j").await;
        assert!(result.is_err());

        let job = h.queue.get_job("j").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.retry_attempts.is_empty());
        assert_eq!(h.supervisor.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn crash_class_error_retries_exactly_once_then_succeeds() {
        let h = harness(vec![
            Err("BACKEND_DOWN: connection refused".into()),
            Ok(serde_json::json!({"frames": 16})),
        ]);
        submit(&h.queue, "j");

        let result = h.runner.run_once("j").await.unwrap();
        assert_eq!(result["frames"], 16);

        let job = h.queue.get_job("j").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_attempts.len(), 1);
        assert_eq!(job.retry_attempts[0].attempt, 1);
        assert!(job.retry_attempts[0].reason.contains("BACKEND_DOWN"));
        assert_eq!(h.supervisor.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_crash_class_failure_is_terminal() {
        let h = harness(vec![
            Err("BACKEND_DOWN: crash 1".into()),
            Err("BACKEND_DOWN: crash 2".into()),
        ]);
        submit(&h.queue, "j");

        assert!(h.runner.run_once("j").await.is_err());

        let job = h.queue.get_job("j").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_attempts.len(), 1);
        assert_eq!(h.supervisor.restarts.load(Ordering::SeqCst), 1);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 2);
    }

    // -- external process teardown ------------------------------------------

    #[tokio::test]
    async fn finalization_clears_registered_processes() {
        let h = harness(vec![Ok(serde_json::json!({}))]);
        submit(&h.queue, "j");
        // A pid that cannot exist; cleanup consumes the registration
        // without finding anything alive.
        h.procs.register("j", u32::MAX - 1);

        h.runner.run_once("j").await.unwrap();

        assert_eq!(h.queue.get_job("j").unwrap().status, JobStatus::Completed);
        assert!(h.procs.tracked("j").is_empty());
    }

    // -- readiness gate -----------------------------------------------------

    #[tokio::test]
    async fn not_ready_job_is_failed_without_execution() {
        struct NeverReady;
        impl ReadinessGate for NeverReady {
            fn check(&self, _job: &Job) -> Result<(), String> {
                Err("checkpoint model missing".into())
            }
        }

        let h = harness_with_readiness(vec![Ok(serde_json::json!({}))], Arc::new(NeverReady));
        submit(&h.queue, "j");

        assert!(h.runner.run_once("j").await.is_err());

        let job = h.queue.get_job("j").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_matches!(job.error_code.as_deref(), Some(CODE_NOT_READY));
        assert!(job.retry_attempts.is_empty());
        // The executor must never have been invoked.
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
    }

    // -- lifecycle ----------------------------------------------------------

    #[tokio::test]
    async fn stop_on_non_running_runner_is_a_noop() {
        let h = harness(vec![]);
        // Must not panic or hang.
        h.runner.stop().await;
        h.runner.stop().await;
        assert!(!h.runner.is_running());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_joins() {
        let h = harness(vec![]);
        h.runner.start();
        h.runner.start();
        assert!(h.runner.is_running());

        h.runner.stop().await;
        assert!(!h.runner.is_running());
    }

    #[tokio::test]
    async fn background_loop_drains_queued_jobs() {
        let h = harness(vec![
            Ok(serde_json::json!({"n": 1})),
            Ok(serde_json::json!({"n": 2})),
        ]);
        h.queue.submit(Job::new("a", serde_json::json!({"scene": 1})));
        h.queue.submit(Job::new("b", serde_json::json!({"scene": 2})));

        h.runner.start();
        for _ in 0..100 {
            if h.queue.list_jobs(Some(JobStatus::Completed)).len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        h.runner.stop().await;

        assert_eq!(h.queue.list_jobs(Some(JobStatus::Completed)).len(), 2);
    }

    #[tokio::test]
    async fn paused_queue_is_not_drained() {
        let h = harness(vec![Ok(serde_json::json!({}))]);
        h.queue.pause();
        h.queue.submit(Job::new("a", serde_json::json!({"scene": 1})));

        h.runner.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.runner.stop().await;

        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.queue.queued_count(), 1);
    }

    // -- cancellation -------------------------------------------------------

    #[tokio::test]
    async fn cancel_current_is_cooperative() {
        /// Executor that parks until its cancellation token fires.
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

        let queue = Arc::new(JobQueue::new());
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&queue),
            Arc::new(ParkingExecutor),
            Arc::new(MarkerClassifier),
            Arc::new(CountingSupervisor {
                restarts: AtomicUsize::new(0),
            }),
            Arc::new(AlwaysReady),
            Arc::new(ExternalProcs::new()),
            Arc::new(EventBus::default()),
            Arc::new(Heartbeats::new()),
            RunnerConfig {
                poll_interval: Duration::from_millis(10),
                stop_join_timeout: Duration::from_secs(2),
            },
        ));

        queue.submit(Job::new("long", serde_json::json!({"scene": 1})));
        runner.start();

        // Wait for dispatch, then cancel.
        for _ in 0..100 {
            if runner.current_job_id().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(runner.cancel_current());

        for _ in 0..100 {
            if queue.get_job("long").map(|j| j.status) == Some(JobStatus::Cancelled) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        runner.stop().await;

        assert_eq!(queue.get_job("long").unwrap().status, JobStatus::Cancelled);
        // Nothing left to cancel.
        assert!(!runner.cancel_current());
    }
}

//! System watchdog: periodic heartbeat staleness checks with a
//! per-reason cooldown and asynchronous diagnostics capture.
//!
//! The watchdog never restarts anything itself. It observes the shared
//! [`Heartbeats`] registry, and when a signal goes stale it publishes a
//! [`WatchdogViolation`] on the event bus and hands an envelope to the
//! injected [`DiagnosticsSink`]. A reason that has triggered recently,
//! or whose diagnostics capture is still in flight, is suppressed so a
//! sustained stall produces one trigger per cooldown window instead of
//! one per check.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use stagehand_core::heartbeat::{HeartbeatSignal, Heartbeats};
use stagehand_core::types::JobId;
use stagehand_events::{EventBus, JobEvent, WatchdogEnvelope};

/// Receives violation envelopes for diagnostics capture (log bundles,
/// process dumps, operator alerts). Failures are logged and swallowed.
#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn capture(&self, envelope: &WatchdogEnvelope) -> anyhow::Result<()>;
}

/// Sink that records nothing.
pub struct NoopDiagnostics;

#[async_trait]
impl DiagnosticsSink for NoopDiagnostics {
    async fn capture(&self, _envelope: &WatchdogEnvelope) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Resolves the job currently being executed, so violations can be
/// attributed to it.
pub type ActiveJobFn = Arc<dyn Fn() -> Option<JobId> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub check_interval: Duration,
    /// Stale thresholds, seconds since last heartbeat.
    pub ui_threshold_secs: i64,
    pub queue_threshold_secs: i64,
    pub runner_threshold_secs: i64,
    /// Minimum spacing between two triggers for the same reason.
    pub cooldown: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            ui_threshold_secs: 120,
            queue_threshold_secs: 300,
            runner_threshold_secs: 600,
            cooldown: Duration::from_secs(600),
        }
    }
}

impl WatchdogConfig {
    fn threshold_secs(&self, signal: HeartbeatSignal) -> i64 {
        match signal {
            HeartbeatSignal::Ui => self.ui_threshold_secs,
            HeartbeatSignal::Queue => self.queue_threshold_secs,
            HeartbeatSignal::Runner => self.runner_threshold_secs,
        }
    }
}

#[derive(Default)]
struct ReasonState {
    last_trigger: Option<Instant>,
    in_flight: Arc<AtomicBool>,
}

pub struct Watchdog {
    heartbeats: Arc<Heartbeats>,
    bus: Arc<EventBus>,
    sink: Arc<dyn DiagnosticsSink>,
    active_job: ActiveJobFn,
    config: WatchdogConfig,
    reasons: Mutex<HashMap<&'static str, ReasonState>>,
}

impl Watchdog {
    pub fn new(
        heartbeats: Arc<Heartbeats>,
        bus: Arc<EventBus>,
        sink: Arc<dyn DiagnosticsSink>,
        active_job: ActiveJobFn,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            heartbeats,
            bus,
            sink,
            active_job,
            config,
            reasons: Mutex::new(HashMap::new()),
        }
    }

    /// One staleness sweep over all signals. Returns the envelopes that
    /// actually triggered (suppressed reasons are not included).
    pub fn check(&self) -> Vec<WatchdogEnvelope> {
        let mut triggered = Vec::new();
        for signal in HeartbeatSignal::ALL {
            let stalled_secs = self.heartbeats.elapsed_secs(signal);
            let threshold_secs = self.config.threshold_secs(signal);
            if stalled_secs <= threshold_secs {
                continue;
            }
            if let Some(envelope) = self.trigger(signal, stalled_secs, threshold_secs) {
                triggered.push(envelope);
            }
        }
        triggered
    }

    fn trigger(
        &self,
        signal: HeartbeatSignal,
        stalled_secs: i64,
        threshold_secs: i64,
    ) -> Option<WatchdogEnvelope> {
        let reason = signal.name();
        let in_flight = {
            let mut reasons = self.reasons.lock().expect("watchdog mutex poisoned");
            let state = reasons.entry(reason).or_default();

            if state.in_flight.load(Ordering::SeqCst) {
                tracing::debug!(reason, "Watchdog trigger suppressed, diagnostics in flight");
                return None;
            }
            if let Some(last) = state.last_trigger {
                if last.elapsed() < self.config.cooldown {
                    tracing::debug!(reason, "Watchdog trigger suppressed by cooldown");
                    return None;
                }
            }

            state.last_trigger = Some(Instant::now());
            state.in_flight.store(true, Ordering::SeqCst);
            Arc::clone(&state.in_flight)
        };

        let envelope = WatchdogEnvelope {
            reason: reason.to_string(),
            stalled_secs,
            threshold_secs,
            triggered_at: Utc::now(),
        };
        let job_id = (self.active_job)();
        tracing::warn!(
            reason,
            stalled_secs,
            threshold_secs,
            job_id = job_id.as_deref().unwrap_or("-"),
            "Watchdog violation",
        );
        self.bus.publish(JobEvent::WatchdogViolation {
            job_id,
            envelope: envelope.clone(),
        });

        let sink = Arc::clone(&self.sink);
        let task_envelope = envelope.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.capture(&task_envelope).await {
                tracing::error!(
                    reason = %task_envelope.reason,
                    error = %e,
                    "Diagnostics capture failed",
                );
            }
            in_flight.store(false, Ordering::SeqCst);
        });

        Some(envelope)
    }

    /// Periodic check loop, stopped through the token. Individual check
    /// problems never escape the loop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.check_interval.as_secs(),
            "Watchdog started",
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Watchdog stopped");
                    return;
                }
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
            self.check();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

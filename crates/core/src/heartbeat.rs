//! Shared activity-heartbeat registry.
//!
//! One injected [`Heartbeats`] instance replaces ambient process-wide
//! timestamps: the UI layer, the queue, and the runner each beat their
//! own signal; the watchdog only reads. Readers tolerate small races, so
//! relaxed atomics over unix-milliseconds are enough.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// The three monitored activity signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeartbeatSignal {
    Ui,
    Queue,
    Runner,
}

impl HeartbeatSignal {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ui => "ui",
            Self::Queue => "queue",
            Self::Runner => "runner",
        }
    }

    pub const ALL: [HeartbeatSignal; 3] = [Self::Ui, Self::Queue, Self::Runner];
}

/// Lock-free last-activity timestamps, one per signal.
///
/// All three signals start at construction time so a freshly started
/// application is never reported as stalled.
#[derive(Debug)]
pub struct Heartbeats {
    ui_ms: AtomicI64,
    queue_ms: AtomicI64,
    runner_ms: AtomicI64,
}

impl Heartbeats {
    pub fn new() -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            ui_ms: AtomicI64::new(now),
            queue_ms: AtomicI64::new(now),
            runner_ms: AtomicI64::new(now),
        }
    }

    fn cell(&self, signal: HeartbeatSignal) -> &AtomicI64 {
        match signal {
            HeartbeatSignal::Ui => &self.ui_ms,
            HeartbeatSignal::Queue => &self.queue_ms,
            HeartbeatSignal::Runner => &self.runner_ms,
        }
    }

    /// Record activity on a signal, stamping it with the current time.
    pub fn beat(&self, signal: HeartbeatSignal) {
        self.cell(signal)
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Overwrite a signal's timestamp. Used by collaborators that batch
    /// their activity reports, and by staleness tests.
    pub fn force(&self, signal: HeartbeatSignal, at: DateTime<Utc>) {
        self.cell(signal)
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    /// Seconds elapsed since the signal's last beat.
    pub fn elapsed_secs(&self, signal: HeartbeatSignal) -> i64 {
        let last = self.cell(signal).load(Ordering::Relaxed);
        (Utc::now().timestamp_millis() - last) / 1000
    }
}

impl Default for Heartbeats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fresh_registry_is_not_stale() {
        let hb = Heartbeats::new();
        for signal in HeartbeatSignal::ALL {
            assert!(hb.elapsed_secs(signal) < 2);
        }
    }

    #[test]
    fn beat_resets_elapsed() {
        let hb = Heartbeats::new();
        hb.force(HeartbeatSignal::Runner, Utc::now() - Duration::seconds(120));
        assert!(hb.elapsed_secs(HeartbeatSignal::Runner) >= 120);

        hb.beat(HeartbeatSignal::Runner);
        assert!(hb.elapsed_secs(HeartbeatSignal::Runner) < 2);
    }

    #[test]
    fn signals_are_independent() {
        let hb = Heartbeats::new();
        hb.force(HeartbeatSignal::Ui, Utc::now() - Duration::seconds(600));
        assert!(hb.elapsed_secs(HeartbeatSignal::Ui) >= 600);
        assert!(hb.elapsed_secs(HeartbeatSignal::Queue) < 2);
        assert!(hb.elapsed_secs(HeartbeatSignal::Runner) < 2);
    }
}

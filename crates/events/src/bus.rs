//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the central publish/subscribe hub for [`JobEvent`]s.
//! It is designed to be shared via `Arc<EventBus>` across the engine and
//! its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use stagehand_core::types::{Job, JobId, JobSummary};

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

/// Coarse activity state of the queue, published on every pause/resume
/// and dispatch transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Idle,
    Running,
    Paused,
}

// ---------------------------------------------------------------------------
// Watchdog envelope
// ---------------------------------------------------------------------------

/// Diagnostics envelope attached to a watchdog violation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogEnvelope {
    /// Stalled signal name (`ui`, `queue`, `runner`).
    pub reason: String,
    /// Seconds since the signal's last heartbeat.
    pub stalled_secs: i64,
    /// Threshold that was exceeded.
    pub threshold_secs: i64,
    pub triggered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// A lifecycle event emitted by the job engine.
///
/// Job-carrying variants hold a cloned snapshot of the job at the moment
/// of the event, never a live reference into the queue.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// The ordering or membership of the queue changed.
    QueueUpdated(Vec<JobSummary>),
    /// The queue's coarse activity state changed.
    QueueStatus(QueueState),
    JobStarted(Job),
    JobFinished(Job),
    JobFailed(Job),
    /// The runner found nothing left to dispatch.
    QueueEmpty,
    /// The watchdog detected a stalled signal.
    WatchdogViolation {
        /// Job running at the time of the violation, if any.
        job_id: Option<JobId>,
        envelope: WatchdogEnvelope,
    },
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`JobEvent`].
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are
    /// dropped and slow receivers observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped;
    /// the history store remains the durable record.
    pub fn publish(&self, event: JobEvent) {
        // Ignore the SendError — it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(JobEvent::QueueStatus(QueueState::Paused));

        let received = rx.recv().await.expect("should receive the event");
        assert_matches!(received, JobEvent::QueueStatus(QueueState::Paused));
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(JobEvent::QueueEmpty);

        assert_matches!(rx1.recv().await.unwrap(), JobEvent::QueueEmpty);
        assert_matches!(rx2.recv().await.unwrap(), JobEvent::QueueEmpty);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        // No subscribers — this must not panic.
        bus.publish(JobEvent::QueueEmpty);
    }

    #[tokio::test]
    async fn job_events_carry_snapshots() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let job = Job::new("j-1", serde_json::json!({"scene": 4}));
        bus.publish(JobEvent::JobStarted(job.clone()));

        match rx.recv().await.unwrap() {
            JobEvent::JobStarted(snapshot) => assert_eq!(snapshot.id, "j-1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

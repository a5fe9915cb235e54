//! In-process event fan-out for job lifecycle notifications.
//!
//! The presentation layer and other collaborators subscribe here; the
//! engine never calls them directly.

pub mod bus;

pub use bus::{EventBus, JobEvent, QueueState, WatchdogEnvelope};

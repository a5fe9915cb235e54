//! The stagehand job engine: queue, runner, service facade, history,
//! duration stats, and queue persistence.
//!
//! Entry point for collaborators is [`service::JobService`]; everything
//! else is composed behind it.

pub mod executor;
pub mod history;
pub mod persistence;
pub mod procs;
pub mod queue;
pub mod runner;
pub mod service;
pub mod stats;
pub mod supervisor;

pub use executor::{CrashClassifier, JobExecutor, ReadinessGate};
pub use history::HistoryStore;
pub use queue::JobQueue;
pub use runner::{JobRunner, RunnerConfig};
pub use service::{JobService, ServiceConfig};
pub use stats::{DurationStatsService, StatsConfig};

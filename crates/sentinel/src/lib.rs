//! Liveness and hygiene daemons: the system watchdog (heartbeat
//! staleness -> diagnostics) and the process reaper (orphaned helper
//! process cleanup).

pub mod reaper;
pub mod watchdog;

pub use reaper::{KilledProcess, ProcessReaper, ProtectedPidsFn, ReaperConfig, ScanSummary};
pub use watchdog::{ActiveJobFn, DiagnosticsSink, NoopDiagnostics, Watchdog, WatchdogConfig};

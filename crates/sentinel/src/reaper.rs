//! Process reaper: periodic scan for orphaned helper processes left
//! behind by finished jobs, with a conservative skip policy.
//!
//! Candidates must live under the configured workspace root and exceed
//! BOTH the age and memory thresholds before they are touched. The
//! reaper's own process and its parent are always protected, on top of
//! the caller-supplied protected-pid callback and an editor/tooling
//! signature allowlist.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tokio_util::sync::CancellationToken;

/// Kill-log ring bound.
const KILL_LOG_CAPACITY: usize = 100;

const WAIT_STEP: Duration = Duration::from_millis(200);

/// Process names that are never reaped, regardless of location or
/// resource usage. Matched as a substring of the lowercased name.
const EDITOR_SIGNATURES: &[&str] = &[
    "code", "codium", "cursor", "zed", "sublime", "idea", "nvim", "vim", "emacs",
];

/// Supplies pids that must not be touched (e.g. processes registered to
/// still-active jobs).
pub type ProtectedPidsFn = Arc<dyn Fn() -> Vec<u32> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between scans.
    pub interval: Duration,
    /// Minimum process age before it is considered abandoned.
    pub idle_secs: u64,
    /// Minimum resident memory before it is considered worth reaping.
    pub memory_mb: u64,
    /// Only processes whose cwd or exe lives under this tree are
    /// candidates.
    pub workspace_root: PathBuf,
    /// TERM-to-KILL escalation window.
    pub grace: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            idle_secs: 1_800,
            memory_mb: 4_096,
            workspace_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            grace: Duration::from_secs(5),
        }
    }
}

/// One reaped process, as recorded in the kill log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KilledProcess {
    pub pid: u32,
    pub name: String,
    pub age_secs: u64,
    pub memory_mb: u64,
    pub killed_at: DateTime<Utc>,
}

/// Outcome of a single scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub timestamp: DateTime<Utc>,
    pub scanned: usize,
    pub killed: Vec<KilledProcess>,
}

pub struct ProcessReaper {
    config: ReaperConfig,
    protected: ProtectedPidsFn,
    kill_log: Mutex<VecDeque<KilledProcess>>,
}

impl ProcessReaper {
    pub fn new(config: ReaperConfig, protected: ProtectedPidsFn) -> Self {
        Self {
            config,
            protected,
            kill_log: Mutex::new(VecDeque::new()),
        }
    }

    /// Pids that are never candidates: our own process and its parent,
    /// plus whatever the callback currently declares.
    fn protected_pids(&self, sys: &System) -> HashSet<u32> {
        let mut protected: HashSet<u32> = (self.protected)().into_iter().collect();
        if let Ok(own) = sysinfo::get_current_pid() {
            protected.insert(own.as_u32());
            if let Some(parent) = sys.process(own).and_then(|p| p.parent()) {
                protected.insert(parent.as_u32());
            }
        }
        protected
    }

    /// One full enumeration pass. Every per-process problem is logged
    /// and skipped; the scan itself never fails.
    pub fn scan_once(&self) -> ScanSummary {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let protected = self.protected_pids(&sys);
        let memory_floor = self.config.memory_mb.saturating_mul(1024 * 1024);

        let mut scanned = 0;
        let mut candidates = Vec::new();
        for (pid, process) in sys.processes() {
            scanned += 1;
            let pid_u32 = pid.as_u32();
            if protected.contains(&pid_u32) {
                continue;
            }

            let name = process.name().to_string_lossy().to_lowercase();
            if is_editor_signature(&name) {
                continue;
            }
            if !in_workspace(process.cwd(), process.exe(), &self.config.workspace_root) {
                continue;
            }
            if process.run_time() < self.config.idle_secs || process.memory() < memory_floor {
                continue;
            }

            candidates.push(KilledProcess {
                pid: pid_u32,
                name: process.name().to_string_lossy().into_owned(),
                age_secs: process.run_time(),
                memory_mb: process.memory() / (1024 * 1024),
                killed_at: Utc::now(),
            });
        }

        let mut killed = Vec::new();
        for candidate in candidates {
            tracing::warn!(
                pid = candidate.pid,
                name = %candidate.name,
                age_secs = candidate.age_secs,
                memory_mb = candidate.memory_mb,
                "Reaping abandoned process",
            );
            if terminate(&mut sys, candidate.pid, self.config.grace) {
                killed.push(candidate);
            } else {
                tracing::warn!(pid = candidate.pid, "Process disappeared before termination");
            }
        }

        self.record_kills(&killed);
        ScanSummary {
            timestamp: Utc::now(),
            scanned,
            killed,
        }
    }

    fn record_kills(&self, killed: &[KilledProcess]) {
        let mut log = self.kill_log.lock().expect("reaper mutex poisoned");
        for kill in killed {
            if log.len() == KILL_LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(kill.clone());
        }
    }

    /// Recent kills, oldest first, capped at 100 entries.
    pub fn kill_log(&self) -> Vec<KilledProcess> {
        self.kill_log
            .lock()
            .expect("reaper mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Periodic scan loop. Scans run on the blocking pool; errors never
    /// escape the loop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            root = %self.config.workspace_root.display(),
            "Process reaper started",
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Process reaper stopped");
                    return;
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            let reaper = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || reaper.scan_once()).await {
                Ok(summary) if !summary.killed.is_empty() => {
                    tracing::info!(
                        scanned = summary.scanned,
                        killed = summary.killed.len(),
                        "Reaper scan finished",
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Reaper scan task failed"),
            }
        }
    }
}

fn is_editor_signature(lower_name: &str) -> bool {
    EDITOR_SIGNATURES.iter().any(|sig| lower_name.contains(sig))
}

/// A process belongs to the workspace when its cwd or exe lives under
/// the configured root. Processes exposing neither are skipped.
fn in_workspace(cwd: Option<&Path>, exe: Option<&Path>, root: &Path) -> bool {
    cwd.map_or(false, |p| p.starts_with(root)) || exe.map_or(false, |p| p.starts_with(root))
}

/// TERM, bounded wait, then KILL. Returns false when the pid was
/// already gone.
fn terminate(sys: &mut System, pid: u32, grace: Duration) -> bool {
    let sys_pid = Pid::from_u32(pid);
    let Some(process) = sys.process(sys_pid) else {
        return false;
    };

    // kill_with returns None on platforms without TERM; fall back to a
    // hard kill there.
    match process.kill_with(Signal::Term) {
        Some(_) => {}
        None => return process.kill(),
    }

    let mut waited = Duration::ZERO;
    while waited < grace {
        std::thread::sleep(WAIT_STEP);
        waited += WAIT_STEP;
        if sys.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true) == 0 {
            return true;
        }
    }

    match sys.process(sys_pid) {
        Some(process) => {
            tracing::warn!(pid, "Process survived TERM grace period, sending KILL");
            process.kill()
        }
        None => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

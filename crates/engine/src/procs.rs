//! Per-job external OS process tracking and cleanup.
//!
//! Generation backends occasionally fork helpers (encoders, preview
//! servers) on a job's behalf. Those pids are registered here and
//! terminated when the job finalizes, regardless of outcome: graceful
//! TERM first, then KILL after a bounded wait.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

use stagehand_core::types::JobId;

/// How long a process gets to exit after TERM before KILL.
const DEFAULT_GRACE: Duration = Duration::from_secs(5);
/// Poll step while waiting for a terminated process to exit.
const WAIT_STEP: Duration = Duration::from_millis(200);

/// Registry of OS processes spawned on behalf of jobs.
pub struct ExternalProcs {
    pids: Mutex<HashMap<JobId, Vec<u32>>>,
    grace: Duration,
}

impl ExternalProcs {
    pub fn new() -> Self {
        Self {
            pids: Mutex::new(HashMap::new()),
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Track a pid for later cleanup.
    pub fn register(&self, job_id: &str, pid: u32) {
        let mut pids = self.pids.lock().expect("procs mutex poisoned");
        let entry = pids.entry(job_id.to_string()).or_default();
        if !entry.contains(&pid) {
            entry.push(pid);
            tracing::debug!(job_id, pid, "External process registered");
        }
    }

    /// Pids currently tracked for a job.
    pub fn tracked(&self, job_id: &str) -> Vec<u32> {
        self.pids
            .lock()
            .expect("procs mutex poisoned")
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Terminate every process registered for the job: TERM, bounded
    /// wait, then KILL. Returns how many were still alive and killed.
    ///
    /// Invoked automatically at job finalization; errors never escape.
    pub fn cleanup(&self, job_id: &str) -> usize {
        let pids = match self
            .pids
            .lock()
            .expect("procs mutex poisoned")
            .remove(job_id)
        {
            Some(pids) if !pids.is_empty() => pids,
            _ => return 0,
        };

        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut killed = 0;
        for pid in pids {
            if terminate(&mut sys, pid, self.grace) {
                killed += 1;
                tracing::info!(job_id, pid, "External process terminated");
            }
        }
        killed
    }
}

impl Default for ExternalProcs {
    fn default() -> Self {
        Self::new()
    }
}

/// Graceful-then-forceful termination of a single pid.
///
/// Returns `true` if the process existed and was signalled.
pub fn terminate(sys: &mut System, pid: u32, grace: Duration) -> bool {
    let sys_pid = Pid::from_u32(pid);
    let Some(process) = sys.process(sys_pid) else {
        return false;
    };

    // Some platforms don't support per-signal kills; fall back to KILL.
    if process.kill_with(Signal::Term).is_none() {
        return process.kill();
    }

    let mut waited = Duration::ZERO;
    while waited < grace {
        std::thread::sleep(WAIT_STEP);
        waited += WAIT_STEP;
        sys.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        if sys.process(sys_pid).is_none() {
            return true;
        }
    }

    tracing::warn!(pid, "Process ignored TERM, escalating to KILL");
    if let Some(process) = sys.process(sys_pid) {
        process.kill();
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

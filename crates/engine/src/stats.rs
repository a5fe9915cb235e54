//! Queue ETA estimation from historical durations.
//!
//! Reads a bounded window of recent history, buckets completed-job
//! durations by stage-chain signature, and serves median-based
//! estimates. Chains without enough samples fall back to static
//! per-stage defaults.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use stagehand_core::estimation::{
    compute_stats, fallback_estimate_secs, ChainStats, DEFAULT_MIN_SAMPLES,
};
use stagehand_core::types::{Job, JobStatus};

use crate::history::HistoryStore;

/// Tunables for the stats service, constructor-time only.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// How many recent history entries to scan on refresh.
    pub history_window: usize,
    /// Most recent samples kept per chain signature.
    pub max_samples_per_chain: usize,
    /// Chains with fewer samples than this are discarded.
    pub min_samples: usize,
    /// Static per-stage second defaults for the fallback estimate.
    pub stage_defaults: Vec<(String, f64)>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            history_window: 500,
            max_samples_per_chain: 50,
            min_samples: DEFAULT_MIN_SAMPLES,
            stage_defaults: Vec::new(),
        }
    }
}

/// Serves per-chain duration estimates recomputed from history.
pub struct DurationStatsService {
    history: Arc<HistoryStore>,
    config: StatsConfig,
    chains: Mutex<HashMap<String, ChainStats>>,
}

impl DurationStatsService {
    pub fn new(history: Arc<HistoryStore>, config: StatsConfig) -> Self {
        Self {
            history,
            config,
            chains: Mutex::new(HashMap::new()),
        }
    }

    /// Recompute all chain stats from the recent history window.
    pub fn refresh(&self) {
        let entries = self.history.recent_entries(self.config.history_window);

        // Oldest-first; keeping the tail keeps the most recent samples.
        let mut samples: HashMap<String, Vec<i64>> = HashMap::new();
        for entry in &entries {
            if entry.status != JobStatus::Completed || entry.stages.is_empty() {
                continue;
            }
            let Some(duration_ms) = entry.duration_ms else {
                continue;
            };
            samples
                .entry(entry.chain_signature())
                .or_default()
                .push(duration_ms);
        }

        let now = Utc::now();
        let mut chains = HashMap::new();
        for (chain, mut durations) in samples {
            if durations.len() > self.config.max_samples_per_chain {
                durations.drain(..durations.len() - self.config.max_samples_per_chain);
            }
            if durations.len() < self.config.min_samples {
                continue;
            }
            if let Some(stats) = compute_stats(&chain, &durations, now) {
                chains.insert(chain, stats);
            }
        }

        tracing::debug!(chains = chains.len(), window = entries.len(), "Duration stats refreshed");
        *self.chains.lock().expect("stats mutex poisoned") = chains;
    }

    /// Median-based estimate in seconds, `None` without enough history.
    pub fn estimate_for_chain(&self, chain: &str) -> Option<f64> {
        self.chains
            .lock()
            .expect("stats mutex poisoned")
            .get(chain)
            .map(|s| s.median_ms / 1000.0)
    }

    /// Sum of static per-stage defaults, used absent history.
    pub fn fallback_estimate(&self, stages: &[String]) -> f64 {
        fallback_estimate_secs(stages, &self.config.stage_defaults)
    }

    /// Total estimated seconds for a set of jobs, plus how many of them
    /// had history-backed estimates.
    pub fn queue_total_estimate(&self, jobs: &[Job]) -> (f64, usize) {
        let mut total = 0.0;
        let mut with_history = 0;
        for job in jobs {
            match self.estimate_for_chain(&job.chain_signature()) {
                Some(secs) => {
                    total += secs;
                    with_history += 1;
                }
                None => total += self.fallback_estimate(&job.stages),
            }
        }
        (total, with_history)
    }

    /// Snapshot of the current chain stats, for display.
    pub fn chain_stats(&self) -> Vec<ChainStats> {
        self.chains
            .lock()
            .expect("stats mutex poisoned")
            .values()
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn record_completed(history: &HistoryStore, id: &str, stages: &[&str], duration_ms: i64) {
        let mut job = Job::new(id, serde_json::json!({}))
            .with_stages(stages.iter().map(|s| s.to_string()).collect());
        let start = Utc::now();
        job.status = JobStatus::Completed;
        job.started_at = Some(start);
        job.completed_at = Some(start + chrono::Duration::milliseconds(duration_ms));
        job.result = Some(serde_json::json!({}));
        history.record_status_change(&job);
    }

    fn service_with(history: Arc<HistoryStore>) -> DurationStatsService {
        DurationStatsService::new(history, StatsConfig::default())
    }

    #[test]
    fn estimate_uses_median_of_chain_samples() {
        let history = Arc::new(HistoryStore::in_memory());
        for (i, ms) in [10_000, 20_000, 90_000].iter().enumerate() {
            record_completed(&history, &format!("j-{i}"), &["pose", "refine"], *ms);
        }

        let stats = service_with(history);
        stats.refresh();

        let secs = stats.estimate_for_chain("pose>refine").unwrap();
        assert!((secs - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn chains_below_min_samples_are_discarded() {
        let history = Arc::new(HistoryStore::in_memory());
        record_completed(&history, "j-1", &["solo"], 5_000);
        record_completed(&history, "j-2", &["solo"], 5_000);

        let stats = service_with(history);
        stats.refresh();
        assert!(stats.estimate_for_chain("solo").is_none());
    }

    #[test]
    fn refresh_keeps_most_recent_samples() {
        let history = Arc::new(HistoryStore::in_memory());
        // 60 slow runs followed by 50 fast ones with a 50-sample cap:
        // only the fast tail should survive.
        for i in 0..60 {
            record_completed(&history, &format!("slow-{i}"), &["gen"], 100_000);
        }
        for i in 0..50 {
            record_completed(&history, &format!("fast-{i}"), &["gen"], 1_000);
        }

        let stats = service_with(history);
        stats.refresh();
        let secs = stats.estimate_for_chain("gen").unwrap();
        assert!((secs - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fallback_estimate_for_unknown_chain() {
        let history = Arc::new(HistoryStore::in_memory());
        let config = StatsConfig {
            stage_defaults: vec![("pose".to_string(), 45.0)],
            ..Default::default()
        };
        let stats = DurationStatsService::new(history, config);

        let secs = stats.fallback_estimate(&["pose".to_string()]);
        assert!((secs - 45.0).abs() < f64::EPSILON);
    }

    #[test]
    fn queue_total_mixes_history_and_fallback() {
        let history = Arc::new(HistoryStore::in_memory());
        for i in 0..5 {
            record_completed(&history, &format!("j-{i}"), &["gen"], 30_000);
        }

        let config = StatsConfig {
            stage_defaults: vec![("novel".to_string(), 10.0)],
            ..Default::default()
        };
        let stats = DurationStatsService::new(history, config);
        stats.refresh();

        let jobs = vec![
            Job::new("a", serde_json::json!({})).with_stages(vec!["gen".into()]),
            Job::new("b", serde_json::json!({})).with_stages(vec!["novel".into()]),
        ];
        let (total, with_history) = stats.queue_total_estimate(&jobs);
        assert_eq!(with_history, 1);
        assert!((total - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failed_jobs_contribute_no_samples() {
        let history = Arc::new(HistoryStore::in_memory());
        for i in 0..5 {
            let mut job =
                Job::new(format!("f-{i}"), serde_json::json!({})).with_stages(vec!["gen".into()]);
            job.status = JobStatus::Failed;
            job.error = Some("boom".into());
            history.record_status_change(&job);
        }

        let stats = service_with(history);
        stats.refresh();
        assert!(stats.estimate_for_chain("gen").is_none());
    }
}

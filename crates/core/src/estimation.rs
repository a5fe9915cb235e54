//! Duration statistics math for queue ETA estimates.
//!
//! Pure functions over millisecond samples; the engine's stats service
//! owns the history window and sample bookkeeping.

use serde::Serialize;

use crate::types::Timestamp;

/// Minimum samples a stage chain needs before its stats are trusted.
pub const DEFAULT_MIN_SAMPLES: usize = 3;

/// Fallback estimate for a stage with no static default configured.
pub const DEFAULT_STAGE_SECS: f64 = 60.0;

/// Derived duration statistics for one stage-chain signature.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStats {
    pub chain: String,
    pub sample_count: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub min_ms: i64,
    pub max_ms: i64,
    pub stddev_ms: f64,
    pub last_updated: Timestamp,
}

/// Compute chain stats from raw millisecond samples.
///
/// Returns `None` for an empty sample set; the minimum-sample threshold
/// is enforced by the caller so it stays configurable.
pub fn compute_stats(chain: &str, samples: &[i64], now: Timestamp) -> Option<ChainStats> {
    if samples.is_empty() {
        return None;
    }

    let count = samples.len();
    let sum: i64 = samples.iter().sum();
    let mean = sum as f64 / count as f64;

    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let median = if count % 2 == 0 {
        (sorted[count / 2 - 1] + sorted[count / 2]) as f64 / 2.0
    } else {
        sorted[count / 2] as f64
    };

    // Population standard deviation.
    let variance = samples
        .iter()
        .map(|&s| {
            let d = s as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / count as f64;

    Some(ChainStats {
        chain: chain.to_string(),
        sample_count: count,
        mean_ms: mean,
        median_ms: median,
        min_ms: sorted[0],
        max_ms: sorted[count - 1],
        stddev_ms: variance.sqrt(),
        last_updated: now,
    })
}

/// Sum of static per-stage defaults, used when a chain has no history.
///
/// `stage_defaults` maps stage name to expected seconds; unknown stages
/// fall back to [`DEFAULT_STAGE_SECS`].
pub fn fallback_estimate_secs(stages: &[String], stage_defaults: &[(String, f64)]) -> f64 {
    stages
        .iter()
        .map(|stage| {
            stage_defaults
                .iter()
                .find(|(name, _)| name == stage)
                .map(|(_, secs)| *secs)
                .unwrap_or(DEFAULT_STAGE_SECS)
        })
        .sum()
}

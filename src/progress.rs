//! Progress and ETA estimates. Informational only; nothing here affects control flow.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::params::MigrationParams;
use crate::store::{IntervalRecord, IntervalStatus};

/// Linear extrapolation from a single interval.
///
/// Any field is `None` when the inputs make it undefined (zero-width key
/// space or zero-width interval) instead of carrying NaN or infinity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    pub loaded_pct: Option<f64>,
    pub this_run_pct: Option<f64>,
    pub estimated_total_secs: Option<f64>,
    pub remaining_hours: Option<f64>,
}

pub fn estimate(
    total_start: i128,
    total_end: i128,
    interval_start: i128,
    interval_end: i128,
    elapsed_secs: f64,
) -> Estimate {
    let span = (total_end - total_start) as f64;
    if span <= 0.0 {
        return Estimate {
            loaded_pct: None,
            this_run_pct: None,
            estimated_total_secs: None,
            remaining_hours: None,
        };
    }
    let loaded = ((interval_end - total_start) as f64 * 100.0 / span).clamp(0.0, 100.0);
    let this_run = (interval_end - interval_start) as f64 * 100.0 / span;
    let total = if this_run > 0.0 {
        Some(elapsed_secs / this_run * 100.0)
    } else {
        None
    };
    Estimate {
        loaded_pct: Some(loaded),
        this_run_pct: Some(this_run),
        estimated_total_secs: total,
        remaining_hours: total.map(|t| (t - elapsed_secs) / 3600.0),
    }
}

fn pct(value: Option<f64>) -> String {
    value.map_or_else(|| "unknown".to_string(), |v| format!("{:.4}%", v))
}

impl fmt::Display for Estimate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "loaded {} (this run {}), estimated total {}, remaining {}",
            pct(self.loaded_pct),
            pct(self.this_run_pct),
            self.estimated_total_secs
                .map_or_else(|| "unknown".to_string(), |s| format!("{:.0}s", s)),
            self.remaining_hours
                .map_or_else(|| "unknown".to_string(), |h| format!("{:.2}h", h)),
        )
    }
}

/// Position of the cursor within the key space, capped to 0..=100.
pub fn cursor_pct(params: &MigrationParams) -> Option<f64> {
    estimate(
        params.start_token,
        params.end_token,
        params.last_end_token,
        params.last_end_token,
        0.0,
    )
    .loaded_pct
}

/// ETA from the mean elapsed time of completed intervals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryEstimate {
    pub samples: usize,
    pub mean_interval_secs: f64,
    pub remaining_intervals: u64,
    pub remaining: Duration,
}

impl HistoryEstimate {
    /// `None` until at least one SUCCESS interval with a recorded elapsed time exists.
    pub fn from_records(records: &[IntervalRecord], params: &MigrationParams) -> Option<Self> {
        let timings: Vec<i64> = records
            .iter()
            .filter(|r| r.status == IntervalStatus::Success)
            .filter_map(|r| r.elapsed_time)
            .collect();
        if timings.is_empty() {
            return None;
        }
        let mean = timings.iter().sum::<i64>() as f64 / timings.len() as f64;
        let remaining_intervals = params.remaining_intervals();
        let remaining_secs = (mean * remaining_intervals as f64).max(0.0);
        Some(Self {
            samples: timings.len(),
            mean_interval_secs: mean,
            remaining_intervals,
            remaining: Duration::try_from_secs_f64(remaining_secs).unwrap_or(Duration::MAX),
        })
    }
}

impl fmt::Display for HistoryEstimate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} intervals left at {:.0}s each (mean of {}): {:.2}h",
            self.remaining_intervals,
            self.mean_interval_secs,
            self.samples,
            self.remaining.as_secs_f64() / 3600.0
        )
    }
}

//! Thread-safe aggregation of per-request results into a run summary.
//!
//! The aggregator is the only state shared by concurrent virtual users.
//! All mutation goes through [`MetricsAggregator::record`], one short
//! critical section per completed iteration; [`MetricsAggregator::snapshot`]
//! reads a consistent point-in-time copy under the same lock.

use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use crate::check::CheckResult;
use crate::executor::Outcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckTally {
    pub passes: u64,
    pub fails: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyStats {
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

/// Aggregated results of one run. Mutated incrementally through the
/// aggregator while the run is live, frozen once the scheduler returns it.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total_requests: u64,
    /// Sum of per-virtual-user iteration counts, filled in at run end.
    pub total_iterations: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub status_counts: HashMap<u16, u64>,
    pub checks: BTreeMap<String, CheckTally>,
    pub latency: LatencyStats,
}

impl RunSummary {
    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.total_iterations = iterations;
        self
    }

    pub fn log(&self) {
        info!("════════════════════════════════════════════");
        info!("                RUN SUMMARY");
        info!("════════════════════════════════════════════");
        info!("Requests total:     {}", self.total_requests);
        info!("Iterations counted: {}", self.total_iterations);
        info!(
            "Errors:             {} ({:.2}%)",
            self.error_count,
            self.error_rate * 100.0
        );

        if !self.status_counts.is_empty() {
            info!("Status codes:");
            let mut codes: Vec<_> = self.status_counts.iter().collect();
            codes.sort();
            for (code, count) in codes {
                info!("  {}: {}", code, count);
            }
        }

        if !self.checks.is_empty() {
            info!("Checks:");
            for (name, tally) in &self.checks {
                info!("  {}: {} passed, {} failed", name, tally.passes, tally.fails);
            }
        }

        info!("Latency (ms):");
        if self.total_requests > 0 {
            info!("  Min:    {:.2}", as_ms(self.latency.min));
            info!("  Mean:   {:.2}", as_ms(self.latency.mean));
            info!("  p50:    {:.2}", as_ms(self.latency.p50));
            info!("  p90:    {:.2}", as_ms(self.latency.p90));
            info!("  p95:    {:.2}", as_ms(self.latency.p95));
            info!("  p99:    {:.2}", as_ms(self.latency.p99));
            info!("  Max:    {:.2}", as_ms(self.latency.max));
        } else {
            info!("  No data");
        }
        info!("════════════════════════════════════════════");
    }
}

fn as_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

struct MetricsState {
    total: u64,
    errors: u64,
    latency: Histogram<u64>,
    status_counts: HashMap<u16, u64>,
    checks: BTreeMap<String, CheckTally>,
}

#[derive(Clone)]
pub struct MetricsAggregator {
    inner: Arc<Mutex<MetricsState>>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                total: 0,
                errors: 0,
                latency: Histogram::new(3).expect("Create histogram"),
                status_counts: HashMap::new(),
                checks: BTreeMap::new(),
            })),
        }
    }

    /// Records one completed iteration. Called once per iteration from
    /// every virtual user.
    pub fn record(&self, outcome: &Outcome, checks: &[CheckResult]) {
        let mut state = self.inner.lock().unwrap();
        state.total += 1;
        if outcome.is_error() {
            state.errors += 1;
        }
        if let Some(status) = outcome.status {
            *state.status_counts.entry(status).or_default() += 1;
        }
        // The histogram floor is 1; sub-microsecond samples still count.
        let micros = (outcome.latency.as_micros() as u64).max(1);
        state.latency.record(micros).ok();
        for result in checks {
            let tally = state.checks.entry(result.name.clone()).or_default();
            if result.passed {
                tally.passes += 1;
            } else {
                tally.fails += 1;
            }
        }
    }

    /// Consistent point-in-time copy. `total_iterations` is zero until the
    /// scheduler folds in the per-user counts at run end.
    pub fn snapshot(&self) -> RunSummary {
        let state = self.inner.lock().unwrap();
        let latency = if state.latency.len() == 0 {
            LatencyStats::default()
        } else {
            LatencyStats {
                min: Duration::from_micros(state.latency.min()),
                max: Duration::from_micros(state.latency.max()),
                mean: Duration::from_micros(state.latency.mean() as u64),
                p50: Duration::from_micros(state.latency.value_at_quantile(0.50)),
                p90: Duration::from_micros(state.latency.value_at_quantile(0.90)),
                p95: Duration::from_micros(state.latency.value_at_quantile(0.95)),
                p99: Duration::from_micros(state.latency.value_at_quantile(0.99)),
            }
        };

        RunSummary {
            total_requests: state.total,
            total_iterations: 0,
            error_count: state.errors,
            error_rate: if state.total == 0 {
                0.0
            } else {
                state.errors as f64 / state.total as f64
            },
            status_counts: state.status_counts.clone(),
            checks: state.checks.clone(),
            latency,
        }
    }
}

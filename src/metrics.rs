//! Reduction of raw timing samples into per-configuration metric rows.

use crate::config::{ConcurrencyConfig, ExecutionMode};
use crate::sweep::{SweepEntry, TimingSample};
use crate::{serialize_ms, BenchError, BenchResult};
use hdrhistogram::Histogram;
use serde::Serialize;
use std::time::{Duration, Instant};

// ────────────────────────────────────────────────────────────────────────────────
// Latency recorder (HDR histogram)
// ────────────────────────────────────────────────────────────────────────────────

/// Per-query latency histogram, nanosecond resolution, 60s ceiling.
pub struct LatencyRecorder {
    hist: Histogram<u64>,
}

impl LatencyRecorder {
    pub fn new() -> Self {
        Self {
            hist: Histogram::<u64>::new_with_bounds(1, 60_000_000_000, 3)
                .expect("constant histogram bounds are valid"),
        }
    }

    /// Start a latency measurement.
    #[inline(always)]
    pub fn start(&self) -> Instant {
        Instant::now()
    }

    /// Record the elapsed time since `start`.
    #[inline(always)]
    pub fn record(&mut self, start: Instant) {
        self.record_ns(start.elapsed().as_nanos() as u64);
    }

    pub fn record_ns(&mut self, nanos: u64) {
        let nanos = nanos.clamp(1, self.hist.high());
        let _ = self.hist.record(nanos);
    }

    pub fn count(&self) -> u64 {
        self.hist.len()
    }

    pub fn summary(&self) -> LatencySummary {
        if self.hist.is_empty() {
            return LatencySummary::default();
        }
        LatencySummary {
            count: self.hist.len(),
            mean_us: self.hist.mean() / 1_000.0,
            p50_us: self.hist.value_at_percentile(50.0) as f64 / 1_000.0,
            p99_us: self.hist.value_at_percentile(99.0) as f64 / 1_000.0,
            max_us: self.hist.max() as f64 / 1_000.0,
        }
    }
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Distribution of individual query latencies within one configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_us: f64,
    pub p50_us: f64,
    pub p99_us: f64,
    pub max_us: f64,
}

// ────────────────────────────────────────────────────────────────────────────────
// Metric rows
// ────────────────────────────────────────────────────────────────────────────────

/// Derived metrics for one measured configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRow {
    pub config: ConcurrencyConfig,
    pub query_count: usize,
    #[serde(rename = "duration_ms", serialize_with = "serialize_ms")]
    pub duration: Duration,
    #[serde(rename = "latency_per_query_ms", serialize_with = "serialize_ms")]
    pub latency_per_query: Duration,
    pub queries_per_second: f64,
    pub speedup_vs_baseline: f64,
    pub query_latency: LatencySummary,
}

/// A configuration that was not measured, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRow {
    pub config: ConcurrencyConfig,
    pub reason: String,
}

/// One report row per sweep entry, in sweep order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SweepRow {
    Measured(MetricRow),
    Skipped(SkippedRow),
}

impl SweepRow {
    pub fn config(&self) -> ConcurrencyConfig {
        match self {
            SweepRow::Measured(row) => row.config,
            SweepRow::Skipped(row) => row.config,
        }
    }

    pub fn measured(&self) -> Option<&MetricRow> {
        match self {
            SweepRow::Measured(row) => Some(row),
            SweepRow::Skipped(_) => None,
        }
    }
}

pub struct MetricsCollector;

impl MetricsCollector {
    /// Turn sweep entries into rows. The first entry must be a measured
    /// sequential baseline; every speedup is relative to it.
    pub fn reduce(entries: &[SweepEntry]) -> BenchResult<Vec<SweepRow>> {
        let baseline = match entries.first() {
            Some(SweepEntry::Measured(sample))
                if sample.config.mode == ExecutionMode::Sequential =>
            {
                sample
            }
            _ => {
                return Err(BenchError::Config(
                    "the first sweep entry must be a measured sequential baseline".into(),
                ))
            }
        };
        let baseline_qps = queries_per_second(baseline)?;

        entries
            .iter()
            .map(|entry| match entry {
                SweepEntry::Measured(sample) => {
                    let qps = queries_per_second(sample)?;
                    Ok(SweepRow::Measured(MetricRow {
                        config: sample.config,
                        query_count: sample.query_count,
                        duration: sample.duration,
                        latency_per_query: sample.duration.div_f64(sample.query_count as f64),
                        queries_per_second: qps,
                        speedup_vs_baseline: qps / baseline_qps,
                        query_latency: sample.query_latency,
                    }))
                }
                SweepEntry::Skipped { config, reason } => Ok(SweepRow::Skipped(SkippedRow {
                    config: *config,
                    reason: reason.clone(),
                })),
            })
            .collect()
    }
}

fn queries_per_second(sample: &TimingSample) -> BenchResult<f64> {
    if sample.query_count == 0 {
        return Err(BenchError::Benchmark(format!(
            "{} completed zero queries",
            sample.config
        )));
    }
    // A zero-length timer reading still has to yield a finite rate.
    let secs = sample.duration.max(Duration::from_nanos(1)).as_secs_f64();
    Ok(sample.query_count as f64 / secs)
}

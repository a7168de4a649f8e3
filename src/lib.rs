//! Shared types, error handling and run orchestration for the ANN concurrency sweep.
//!
//! A run goes through fixed phases: validate the [`RunConfig`], build the
//! [`BenchmarkContext`] (corpus, query sample, canonical index), warm the index
//! up, drive every [`ConcurrencyConfig`] through the [`SweepRunner`], reduce the
//! timing samples with [`MetricsCollector`] and hand the rows to [`report`].

pub mod adapters;
pub mod config;
pub mod context;
pub mod corpus;
pub mod isolated;
pub mod metrics;
pub mod pool;
pub mod report;
pub mod sweep;

pub use adapters::{AnnIndex, IndexBackend, IndexError, IndexHandle, IndexParams, Neighbor};
pub use config::{ConcurrencyConfig, ExecutionMode, Metric, RunConfig};
pub use context::BenchmarkContext;
pub use corpus::{Corpus, DataGen, Query, QuerySample};
pub use isolated::WorkerLauncher;
pub use metrics::{MetricRow, MetricsCollector, SweepRow};
pub use sweep::{SweepEntry, SweepRunner, TimingSample};

use serde::Serialize;
use std::time::Duration;

// ────────────────────────────────────────────────────────────────────────────────
// Error type
// ────────────────────────────────────────────────────────────────────────────────

pub type BenchResult<T> = std::result::Result<T, BenchError>;

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    /// Invalid or inconsistent run parameters. Raised before any timing.
    #[error("config error: {0}")]
    Config(String),

    /// The index library rejected an operation.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Internal invariant violation; nothing downstream can be trusted.
    #[error("benchmark error: {0}")]
    Benchmark(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for BenchError {
    fn from(e: serde_json::Error) -> Self {
        BenchError::Serde(e.to_string())
    }
}

/// Phase of a run, used to say where a fatal error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Config,
    Corpus,
    IndexBuild,
    WarmUp,
    Sweep,
    Report,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Config => write!(f, "config"),
            Phase::Corpus => write!(f, "corpus"),
            Phase::IndexBuild => write!(f, "index build"),
            Phase::WarmUp => write!(f, "warm-up"),
            Phase::Sweep => write!(f, "sweep"),
            Phase::Report => write!(f, "report"),
        }
    }
}

/// A fatal error tagged with the phase it came from.
#[derive(Debug, thiserror::Error)]
#[error("{phase} failed: {source}")]
pub struct RunFailure {
    pub phase: Phase,
    #[source]
    pub source: BenchError,
}

/// Attach a phase to a fallible step.
pub trait InPhase<T> {
    fn in_phase(self, phase: Phase) -> Result<T, RunFailure>;
}

impl<T> InPhase<T> for BenchResult<T> {
    fn in_phase(self, phase: Phase) -> Result<T, RunFailure> {
        self.map_err(|source| RunFailure { phase, source })
    }
}

// ────────────────────────────────────────────────────────────────────────────────
// Run output
// ────────────────────────────────────────────────────────────────────────────────

/// Everything one run produced, ready for rendering or export.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub system_info: SystemInfo,
    pub params: RunConfig,
    pub corpus_size: usize,
    pub dim: usize,
    pub query_count: usize,
    #[serde(serialize_with = "serialize_ms")]
    pub build_time: Duration,
    pub rows: Vec<SweepRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub cpus: usize,
    pub timestamp: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpus: num_cpus::get(),
            timestamp: epoch_timestamp(),
        }
    }
}

fn epoch_timestamp() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{}s-since-epoch", secs)
}

pub(crate) fn serialize_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1_000.0)
}

/// Run every phase in order and return the report.
///
/// `launcher` decides which program isolated workers run as; the binary passes
/// its own executable.
pub fn run(config: &RunConfig, launcher: &WorkerLauncher) -> Result<RunReport, RunFailure> {
    config.validate().in_phase(Phase::Config)?;

    let corpus = match &config.embeddings {
        Some(path) => Corpus::from_embeddings_json(path),
        None => DataGen::new(config.seed).corpus(config.corpus_size, config.dim),
    }
    .in_phase(Phase::Corpus)?;
    config.validate_against(&corpus).in_phase(Phase::Config)?;

    let ctx = BenchmarkContext::setup(config, corpus).in_phase(Phase::IndexBuild)?;
    ctx.warm_up().in_phase(Phase::WarmUp)?;

    let runner = SweepRunner::new(&ctx, launcher.clone());
    let entries = runner.run(&config.sweep).in_phase(Phase::Sweep)?;
    let rows = MetricsCollector::reduce(&entries).in_phase(Phase::Report)?;

    Ok(RunReport {
        system_info: SystemInfo::collect(),
        params: config.clone(),
        corpus_size: ctx.corpus().len(),
        dim: ctx.corpus().dim(),
        query_count: ctx.queries().len(),
        build_time: ctx.build_time(),
        rows,
    })
}

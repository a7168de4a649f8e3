//! Drives each concurrency configuration over the same query sample.
//!
//! Configurations run strictly one after another so they never compete for
//! CPU. Each one yields a [`TimingSample`] or, for isolated runs the machine
//! cannot host, a skip entry with the reason.

use crate::adapters::IndexHandle;
use crate::config::{ConcurrencyConfig, ExecutionMode};
use crate::context::BenchmarkContext;
use crate::corpus::Query;
use crate::isolated::{self, IndexSnapshot, WorkerLauncher};
use crate::metrics::{LatencyRecorder, LatencySummary};
use crate::pool::{self, PoolConfig};
use crate::{BenchError, BenchResult};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Raw measurement of one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingSample {
    pub config: ConcurrencyConfig,
    /// Wall clock from dispatch of the first query to completion of the last.
    pub duration: Duration,
    pub query_count: usize,
    pub query_latency: LatencySummary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SweepEntry {
    Measured(TimingSample),
    Skipped {
        config: ConcurrencyConfig,
        reason: String,
    },
}

/// Hands out the index each mode needs.
///
/// Sequential and pooled runs share the canonical index. Isolated runs need a
/// snapshot, written and verified on first use and removed when the provider
/// is dropped.
pub struct HandleProvider<'a> {
    ctx: &'a BenchmarkContext,
    launcher: WorkerLauncher,
    snapshot_root: Option<PathBuf>,
    snapshot: Option<IndexSnapshot>,
}

impl<'a> HandleProvider<'a> {
    pub fn new(ctx: &'a BenchmarkContext, launcher: WorkerLauncher) -> Self {
        Self {
            ctx,
            launcher,
            snapshot_root: None,
            snapshot: None,
        }
    }

    /// Create the snapshot directory under `root` instead of the system temp dir.
    pub fn with_snapshot_root(mut self, root: Option<PathBuf>) -> Self {
        self.snapshot_root = root;
        self
    }

    pub fn canonical(&self) -> &IndexHandle {
        self.ctx.index()
    }

    pub fn launcher(&self) -> &WorkerLauncher {
        &self.launcher
    }

    pub fn snapshot(&mut self) -> BenchResult<&IndexSnapshot> {
        if self.snapshot.is_none() {
            let index = self.ctx.index();
            let snapshot = IndexSnapshot::write(index, self.snapshot_root.as_deref())?;
            let first = self
                .ctx
                .queries()
                .as_slice()
                .first()
                .ok_or_else(|| BenchError::Benchmark("query sample is empty".into()))?;
            snapshot.verify(index, first, self.ctx.config().k)?;
            self.snapshot = Some(snapshot);
        }
        self.snapshot
            .as_ref()
            .ok_or_else(|| BenchError::Benchmark("index snapshot unavailable".into()))
    }
}

impl ExecutionMode {
    /// Time `queries` under `config` and return the raw sample.
    pub fn execute(
        &self,
        config: ConcurrencyConfig,
        provider: &mut HandleProvider<'_>,
        queries: &[Query],
        k: usize,
    ) -> BenchResult<TimingSample> {
        let (duration, completed, latency) = match self {
            ExecutionMode::Sequential => {
                let index = provider.canonical();
                let mut latency = LatencyRecorder::new();
                let start = Instant::now();
                for query in queries {
                    let t = latency.start();
                    index.query(&query.vector, k)?;
                    latency.record(t);
                }
                (start.elapsed(), queries.len(), latency)
            }
            ExecutionMode::Pooled => {
                let outcome = pool::run_pooled(
                    provider.canonical(),
                    queries,
                    k,
                    &PoolConfig::with_threads(config.workers),
                )?;
                (outcome.elapsed, outcome.completed, outcome.latency)
            }
            ExecutionMode::Isolated => {
                let launcher = provider.launcher().clone();
                let snapshot = provider.snapshot()?;
                let outcome =
                    isolated::run_isolated(snapshot, &launcher, queries, config.workers, k)?;
                outcome.verify_against(provider.canonical(), queries, k)?;
                (outcome.elapsed, outcome.completed, outcome.latency)
            }
        };

        if completed != queries.len() {
            return Err(BenchError::Benchmark(format!(
                "{} completed {} of {} queries",
                config,
                completed,
                queries.len()
            )));
        }
        Ok(TimingSample {
            config,
            duration,
            query_count: completed,
            query_latency: latency.summary(),
        })
    }
}

/// Why `config` cannot run on this machine, if it cannot.
pub fn skip_reason(config: &ConcurrencyConfig, parallelism: usize) -> Option<String> {
    if config.mode == ExecutionMode::Isolated && config.workers > parallelism {
        return Some(format!(
            "{} workers exceed available parallelism {}",
            config.workers, parallelism
        ));
    }
    None
}

pub struct SweepRunner<'a> {
    ctx: &'a BenchmarkContext,
    launcher: WorkerLauncher,
    snapshot_root: Option<PathBuf>,
}

impl<'a> SweepRunner<'a> {
    pub fn new(ctx: &'a BenchmarkContext, launcher: WorkerLauncher) -> Self {
        Self {
            ctx,
            launcher,
            snapshot_root: None,
        }
    }

    /// Parent directory for the isolated-worker snapshot.
    pub fn with_snapshot_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.snapshot_root = Some(root.into());
        self
    }

    /// Run every configuration in order. The first fatal error aborts the sweep.
    pub fn run(&self, sweep: &[ConcurrencyConfig]) -> BenchResult<Vec<SweepEntry>> {
        let parallelism = self.ctx.config().parallelism();
        let k = self.ctx.config().k;
        let queries = self.ctx.queries().as_slice();
        let mut provider = HandleProvider::new(self.ctx, self.launcher.clone())
            .with_snapshot_root(self.snapshot_root.clone());
        let mut entries = Vec::with_capacity(sweep.len());

        for config in sweep {
            if let Some(reason) = skip_reason(config, parallelism) {
                tracing::warn!(%config, %reason, "skipping configuration");
                entries.push(SweepEntry::Skipped {
                    config: *config,
                    reason,
                });
                continue;
            }

            tracing::info!(%config, queries = queries.len(), "running configuration");
            let sample = config.mode.execute(*config, &mut provider, queries, k)?;
            tracing::info!(
                %config,
                duration_ms = sample.duration.as_secs_f64() * 1_000.0,
                p99_us = sample.query_latency.p99_us,
                "configuration finished"
            );
            entries.push(SweepEntry::Measured(sample));
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Metric, RunConfig};
    use crate::corpus::DataGen;

    fn context(max_parallelism: usize) -> BenchmarkContext {
        let config = RunConfig {
            corpus_size: 600,
            dim: 8,
            query_count: 30,
            k: 4,
            metric: Metric::L2,
            max_parallelism: Some(max_parallelism),
            ..RunConfig::default()
        };
        let corpus = DataGen::new(config.seed).corpus(600, 8).unwrap();
        BenchmarkContext::setup(&config, corpus).unwrap()
    }

    #[test]
    fn test_skip_reason_only_for_oversized_isolated() {
        assert!(skip_reason(&ConcurrencyConfig::isolated(8), 4).is_some());
        assert!(skip_reason(&ConcurrencyConfig::isolated(4), 4).is_none());
        assert!(skip_reason(&ConcurrencyConfig::pooled(50), 4).is_none());
        assert!(skip_reason(&ConcurrencyConfig::sequential(), 1).is_none());
    }

    #[test]
    fn test_in_process_sweep_measures_every_query() {
        let ctx = context(2);
        let runner = SweepRunner::new(&ctx, WorkerLauncher::new("/nonexistent/worker"));
        let sweep = [
            ConcurrencyConfig::sequential(),
            ConcurrencyConfig::pooled(3),
            ConcurrencyConfig::isolated(4),
        ];
        let entries = runner.run(&sweep).unwrap();
        assert_eq!(entries.len(), 3);
        for entry in &entries[..2] {
            match entry {
                SweepEntry::Measured(sample) => {
                    assert_eq!(sample.query_count, 30);
                    assert_eq!(sample.query_latency.count, 30);
                }
                other => panic!("expected a measurement, got {:?}", other),
            }
        }
        assert!(matches!(
            &entries[2],
            SweepEntry::Skipped { config, .. } if *config == ConcurrencyConfig::isolated(4)
        ));
    }

    #[test]
    fn test_failed_worker_launch_aborts_sweep_and_removes_snapshot() {
        let ctx = context(4);
        let root = tempfile::tempdir().unwrap();
        let runner = SweepRunner::new(&ctx, WorkerLauncher::new("/nonexistent/worker"))
            .with_snapshot_root(root.path());
        let sweep = [ConcurrencyConfig::sequential(), ConcurrencyConfig::isolated(2)];
        assert!(matches!(
            runner.run(&sweep),
            Err(BenchError::Benchmark(msg)) if msg.contains("failed to start")
        ));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_snapshot_is_created_once_and_reused() {
        let ctx = context(4);
        let mut provider = HandleProvider::new(&ctx, WorkerLauncher::new("/nonexistent/worker"));
        let first = provider.snapshot().unwrap().path().to_path_buf();
        let second = provider.snapshot().unwrap().path().to_path_buf();
        assert_eq!(first, second);
        drop(provider);
        assert!(!first.exists());
    }
}

//! Shared-context worker pool.
//!
//! `k` named worker threads pull query positions from a bounded channel and
//! run them against one shared [`IndexHandle`]. The coordinator submits the
//! whole sample and blocks until every query has reported back.
//!
//! Whether the workers make parallel progress depends on the index: a backend
//! that serialises searches behind a lock gains nothing from more workers.

use crate::adapters::{IndexError, IndexHandle};
use crate::corpus::Query;
use crate::metrics::LatencyRecorder;
use crate::{BenchError, BenchResult};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Configuration for a query pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads
    pub num_threads: usize,
    /// Maximum queued positions before submission blocks
    pub queue_depth: usize,
    /// Stack size per thread
    pub stack_size: usize,
    /// Thread name prefix
    pub name_prefix: String,
}

impl PoolConfig {
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads,
            queue_depth: 1024,
            stack_size: 2 * 1024 * 1024,
            name_prefix: "sweep-pool".to_string(),
        }
    }
}

/// Pool metrics for observability
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Total queries submitted
    pub tasks_submitted: AtomicU64,
    /// Queries that finished (successfully or not)
    pub tasks_completed: AtomicU64,
    /// Total execution time (microseconds)
    pub total_exec_time_us: AtomicU64,
    /// Maximum execution time seen (microseconds)
    pub max_exec_time_us: AtomicU64,
}

impl PoolMetrics {
    pub fn record_execution(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        let us = duration.as_micros() as u64;
        self.total_exec_time_us.fetch_add(us, Ordering::Relaxed);
        let _ = self.max_exec_time_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn avg_exec_time_us(&self) -> u64 {
        let completed = self.tasks_completed.load(Ordering::Relaxed);
        if completed == 0 {
            return 0;
        }
        self.total_exec_time_us.load(Ordering::Relaxed) / completed
    }
}

/// What one pooled pass produced.
pub struct PoolOutcome {
    /// First submission to last completion.
    pub elapsed: Duration,
    pub completed: usize,
    pub latency: LatencyRecorder,
    pub metrics: PoolMetrics,
}

struct Completion {
    latency: Duration,
    result: Result<(), IndexError>,
}

/// Run every query in `queries` on a pool of `config.num_threads` workers.
///
/// Workers are started before the timer; the measured interval covers only
/// submission and completion. Any query error fails the whole pass.
pub fn run_pooled(
    index: &IndexHandle,
    queries: &[Query],
    k: usize,
    config: &PoolConfig,
) -> BenchResult<PoolOutcome> {
    if config.num_threads == 0 {
        return Err(BenchError::Config("pool needs at least one worker".into()));
    }
    let metrics = PoolMetrics::default();

    let (elapsed, latency, completed) = thread::scope(|scope| -> BenchResult<_> {
        let (task_tx, task_rx) = bounded::<usize>(config.queue_depth.max(1));
        let (done_tx, done_rx) = unbounded::<Completion>();

        for i in 0..config.num_threads {
            let task_rx = task_rx.clone();
            let done_tx = done_tx.clone();
            let metrics = &metrics;
            thread::Builder::new()
                .name(format!("{}-{}", config.name_prefix, i))
                .stack_size(config.stack_size)
                .spawn_scoped(scope, move || {
                    worker_loop(task_rx, done_tx, index, queries, k, metrics);
                })?;
        }
        drop(task_rx);
        drop(done_tx);

        let start = Instant::now();
        for position in 0..queries.len() {
            task_tx
                .send(position)
                .map_err(|_| BenchError::Benchmark("pool workers exited early".into()))?;
            metrics.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        }
        drop(task_tx);

        let mut latency = LatencyRecorder::new();
        let mut first_error = None;
        for _ in 0..queries.len() {
            let done = done_rx
                .recv()
                .map_err(|_| BenchError::Benchmark("pool workers exited early".into()))?;
            match done.result {
                Ok(()) => latency.record_ns(done.latency.as_nanos() as u64),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        let elapsed = start.elapsed();

        if let Some(e) = first_error {
            return Err(e.into());
        }
        let completed = latency.count() as usize;
        Ok((elapsed, latency, completed))
    })?;

    tracing::debug!(
        workers = config.num_threads,
        completed = metrics.tasks_completed.load(Ordering::Relaxed),
        avg_exec_us = metrics.avg_exec_time_us(),
        max_exec_us = metrics.max_exec_time_us.load(Ordering::Relaxed),
        "pool pass finished"
    );

    Ok(PoolOutcome {
        elapsed,
        completed,
        latency,
        metrics,
    })
}

/// Worker thread main loop; exits once the task channel is drained and closed.
fn worker_loop(
    tasks: Receiver<usize>,
    done: Sender<Completion>,
    index: &IndexHandle,
    queries: &[Query],
    k: usize,
    metrics: &PoolMetrics,
) {
    for position in tasks.iter() {
        let start = Instant::now();
        let result = index.query(&queries[position].vector, k).map(|_| ());
        let latency = start.elapsed();
        metrics.record_execution(latency);
        if done.send(Completion { latency, result }).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{IndexBackend, IndexParams};
    use crate::config::Metric;
    use crate::corpus::DataGen;

    fn fixture(n: usize, m: usize) -> (IndexHandle, Vec<Query>) {
        let mut gen = DataGen::new(8);
        let corpus = gen.corpus(n, 8).unwrap();
        let queries = gen.sample_queries(&corpus, m).unwrap();
        let params = IndexParams {
            metric: Metric::L2,
            dim: 8,
            connectivity: 16,
            ef_construction: 200,
            ef_search: 50,
            max_capacity: n,
        };
        let index = IndexBackend::Flat.build(&corpus, params).unwrap();
        (index, queries.as_slice().to_vec())
    }

    #[test]
    fn test_pool_completes_every_query() {
        let (index, queries) = fixture(500, 40);
        for threads in [1, 3, 8, 50] {
            let outcome =
                run_pooled(&index, &queries, 5, &PoolConfig::with_threads(threads)).unwrap();
            assert_eq!(outcome.completed, 40);
            assert_eq!(outcome.latency.count(), 40);
            assert_eq!(outcome.metrics.tasks_submitted.load(Ordering::Relaxed), 40);
            assert_eq!(outcome.metrics.tasks_completed.load(Ordering::Relaxed), 40);
            assert!(outcome.elapsed > Duration::ZERO);
        }
    }

    #[test]
    fn test_small_queue_does_not_deadlock() {
        let (index, queries) = fixture(200, 30);
        let config = PoolConfig {
            queue_depth: 1,
            ..PoolConfig::with_threads(2)
        };
        let outcome = run_pooled(&index, &queries, 3, &config).unwrap();
        assert_eq!(outcome.completed, 30);
    }

    #[test]
    fn test_query_error_fails_the_pass() {
        let (index, mut queries) = fixture(100, 10);
        queries[4].vector.pop();
        let err = run_pooled(&index, &queries, 3, &PoolConfig::with_threads(4)).err();
        assert!(matches!(err, Some(BenchError::Index(IndexError::DimensionMismatch { .. }))));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let (index, queries) = fixture(50, 5);
        assert!(run_pooled(&index, &queries, 3, &PoolConfig::with_threads(0)).is_err());
    }

    #[test]
    fn test_metrics_average() {
        let metrics = PoolMetrics::default();
        assert_eq!(metrics.avg_exec_time_us(), 0);
        metrics.record_execution(Duration::from_micros(10));
        metrics.record_execution(Duration::from_micros(30));
        assert_eq!(metrics.avg_exec_time_us(), 20);
        assert_eq!(metrics.max_exec_time_us.load(Ordering::Relaxed), 30);
    }
}

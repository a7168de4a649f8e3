//! Per-run state handed to every phase: corpus, query sample and the canonical index.

use crate::adapters::{IndexHandle, IndexParams};
use crate::config::RunConfig;
use crate::corpus::{Corpus, DataGen, QuerySample};
use crate::BenchResult;
use std::time::{Duration, Instant};

/// Untimed queries issued before the first measured configuration.
pub const WARMUP_QUERIES: usize = 10;

pub struct BenchmarkContext {
    config: RunConfig,
    corpus: Corpus,
    queries: QuerySample,
    index: IndexHandle,
    build_time: Duration,
}

impl BenchmarkContext {
    /// Draw the query sample and build the one canonical index for the run.
    pub fn setup(config: &RunConfig, corpus: Corpus) -> BenchResult<Self> {
        let mut gen = DataGen::new(config.seed.wrapping_add(1));
        let queries = gen.sample_queries(&corpus, config.query_count)?;

        let params = IndexParams {
            metric: config.metric,
            dim: corpus.dim(),
            connectivity: config.connectivity,
            ef_construction: config.ef_construction,
            ef_search: config.ef_search,
            max_capacity: config.capacity(corpus.len()),
        };
        tracing::info!(
            backend = %config.backend,
            vectors = corpus.len(),
            dim = corpus.dim(),
            metric = %config.metric,
            "building index"
        );
        let start = Instant::now();
        let index = config.backend.build(&corpus, params)?;
        let build_time = start.elapsed();
        tracing::info!(build_ms = build_time.as_secs_f64() * 1_000.0, "index built");

        Ok(Self {
            config: config.clone(),
            corpus,
            queries,
            index,
            build_time,
        })
    }

    /// Exclude one-time initialisation costs from the first measurement.
    pub fn warm_up(&self) -> BenchResult<()> {
        let Some(first) = self.queries.as_slice().first() else {
            return Ok(());
        };
        for _ in 0..WARMUP_QUERIES {
            self.index.query(&first.vector, self.config.k)?;
        }
        tracing::debug!(queries = WARMUP_QUERIES, "warm-up done");
        Ok(())
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn queries(&self) -> &QuerySample {
        &self.queries
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    pub fn build_time(&self) -> Duration {
        self.build_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Metric;

    #[test]
    fn test_setup_builds_index_over_whole_corpus() {
        let config = RunConfig {
            corpus_size: 300,
            dim: 4,
            query_count: 20,
            k: 3,
            metric: Metric::L2,
            ..RunConfig::default()
        };
        let corpus = DataGen::new(config.seed).corpus(300, 4).unwrap();
        let ctx = BenchmarkContext::setup(&config, corpus).unwrap();
        assert_eq!(ctx.index().len(), 300);
        assert_eq!(ctx.queries().len(), 20);
        assert_eq!(ctx.index().params().ef_search, config.ef_search);
        ctx.warm_up().unwrap();
    }

    #[test]
    fn test_query_sample_is_reproducible_for_a_seed() {
        let config = RunConfig {
            corpus_size: 100,
            dim: 4,
            query_count: 10,
            k: 3,
            ..RunConfig::default()
        };
        let a = BenchmarkContext::setup(&config, DataGen::new(1).corpus(100, 4).unwrap()).unwrap();
        let b = BenchmarkContext::setup(&config, DataGen::new(1).corpus(100, 4).unwrap()).unwrap();
        assert!(a.queries().labels().eq(b.queries().labels()));
    }
}

//! Run parameters: corpus shape, index parameters and the concurrency sweep.
//!
//! A [`RunConfig`] can be built from defaults, loaded from TOML and then
//! overridden from the command line. [`RunConfig::validate`] must pass before
//! any corpus or index work starts.

use crate::adapters::IndexBackend;
use crate::corpus::Corpus;
use crate::{BenchError, BenchResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Distance metric used by the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// 1 - cosine similarity
    #[default]
    Cosine,
    /// Squared euclidean distance
    L2,
    /// 1 - dot product
    Ip,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cosine => write!(f, "cosine"),
            Self::L2 => write!(f, "l2"),
            Self::Ip => write!(f, "ip"),
        }
    }
}

impl FromStr for Metric {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" | "cos" => Ok(Self::Cosine),
            "l2" | "l2sq" | "euclidean" => Ok(Self::L2),
            "ip" | "dot" | "inner_product" => Ok(Self::Ip),
            other => Err(BenchError::Config(format!(
                "unknown metric '{}', use: cosine, l2, ip",
                other
            ))),
        }
    }
}

/// How queries are dispatched for one configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One query after another on the calling thread. The baseline.
    Sequential,
    /// Worker threads sharing the canonical index in one address space.
    Pooled,
    /// Worker processes, each restoring a private index from a snapshot.
    Isolated,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Pooled => write!(f, "pooled"),
            Self::Isolated => write!(f, "isolated"),
        }
    }
}

/// One entry of the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub mode: ExecutionMode,
    pub workers: usize,
}

impl ConcurrencyConfig {
    pub fn sequential() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            workers: 1,
        }
    }

    pub fn pooled(workers: usize) -> Self {
        Self {
            mode: ExecutionMode::Pooled,
            workers,
        }
    }

    pub fn isolated(workers: usize) -> Self {
        Self {
            mode: ExecutionMode::Isolated,
            workers,
        }
    }
}

impl fmt::Display for ConcurrencyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            ExecutionMode::Sequential => write!(f, "sequential"),
            mode => write!(f, "{}:{}", mode, self.workers),
        }
    }
}

impl FromStr for ConcurrencyConfig {
    type Err = BenchError;

    /// Accepts `sequential` (or `seq`), `pooled:<k>` and `isolated:<p>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "sequential" || s == "seq" {
            return Ok(Self::sequential());
        }
        let (mode, count) = s.split_once(':').ok_or_else(|| {
            BenchError::Config(format!(
                "invalid sweep entry '{}', use: sequential, pooled:<k>, isolated:<p>",
                s
            ))
        })?;
        let workers: usize = count
            .parse()
            .map_err(|_| BenchError::Config(format!("invalid worker count in '{}'", s)))?;
        match mode {
            "pooled" | "pool" | "threads" => Ok(Self::pooled(workers)),
            "isolated" | "proc" | "processes" => Ok(Self::isolated(workers)),
            other => Err(BenchError::Config(format!("unknown execution mode '{}'", other))),
        }
    }
}

/// Default sweep: one baseline, four pool sizes and
/// three process counts.
pub fn default_sweep() -> Vec<ConcurrencyConfig> {
    let mut sweep = vec![ConcurrencyConfig::sequential()];
    sweep.extend([5, 10, 20, 50].into_iter().map(ConcurrencyConfig::pooled));
    sweep.extend([2, 4, 8].into_iter().map(ConcurrencyConfig::isolated));
    sweep
}

/// Complete parameter set for one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub corpus_size: usize,
    pub dim: usize,
    pub query_count: usize,
    pub k: usize,
    pub metric: Metric,
    /// Graph degree ("M") for graph-based backends.
    pub connectivity: usize,
    /// Construction-time candidate list size.
    pub ef_construction: usize,
    /// Search-time recall knob.
    pub ef_search: usize,
    /// Index capacity; `None` sizes the index to the corpus.
    pub max_capacity: Option<usize>,
    pub seed: u64,
    pub backend: IndexBackend,
    /// Embedding file replacing the synthetic corpus.
    pub embeddings: Option<PathBuf>,
    /// Overrides detected hardware parallelism for the isolated skip rule.
    pub max_parallelism: Option<usize>,
    pub sweep: Vec<ConcurrencyConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            corpus_size: 31_173,
            dim: 768,
            query_count: 100,
            k: 10,
            metric: Metric::Cosine,
            connectivity: 16,
            ef_construction: 200,
            ef_search: 50,
            max_capacity: None,
            seed: 42,
            backend: IndexBackend::default(),
            embeddings: None,
            max_parallelism: None,
            sweep: default_sweep(),
        }
    }
}

impl RunConfig {
    /// Load a run configuration from a TOML file. Missing keys keep defaults.
    pub fn load_toml(path: &Path) -> BenchResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BenchError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| BenchError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Hardware parallelism available to isolated workers.
    pub fn parallelism(&self) -> usize {
        self.max_parallelism.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn capacity(&self, corpus_len: usize) -> usize {
        self.max_capacity.unwrap_or(corpus_len)
    }

    /// Check parameters that do not depend on the corpus contents.
    pub fn validate(&self) -> BenchResult<()> {
        if self.embeddings.is_none() {
            if self.corpus_size == 0 {
                return Err(BenchError::Config("corpus_size must be positive".into()));
            }
            if self.dim == 0 {
                return Err(BenchError::Config("dim must be positive".into()));
            }
            self.check_sizes(self.corpus_size)?;
        }
        if self.query_count == 0 {
            return Err(BenchError::Config("query_count must be positive".into()));
        }
        if self.k == 0 {
            return Err(BenchError::Config("k must be positive".into()));
        }
        if self.ef_search == 0 {
            return Err(BenchError::Config("ef_search must be positive".into()));
        }
        if self.connectivity == 0 || self.ef_construction == 0 {
            return Err(BenchError::Config(
                "connectivity and ef_construction must be positive".into(),
            ));
        }
        self.validate_sweep()
    }

    /// Re-check size constraints once the corpus is known (real corpora set
    /// their own size).
    pub fn validate_against(&self, corpus: &Corpus) -> BenchResult<()> {
        self.check_sizes(corpus.len())
    }

    fn check_sizes(&self, corpus_len: usize) -> BenchResult<()> {
        if self.query_count > corpus_len {
            return Err(BenchError::Config(format!(
                "query_count {} exceeds corpus size {}",
                self.query_count, corpus_len
            )));
        }
        if self.k > corpus_len {
            return Err(BenchError::Config(format!(
                "k {} exceeds corpus size {}",
                self.k, corpus_len
            )));
        }
        let capacity = self.capacity(corpus_len);
        if capacity < corpus_len {
            return Err(BenchError::Config(format!(
                "max_capacity {} is smaller than corpus size {}",
                capacity, corpus_len
            )));
        }
        Ok(())
    }

    fn validate_sweep(&self) -> BenchResult<()> {
        let first = self
            .sweep
            .first()
            .ok_or_else(|| BenchError::Config("sweep is empty".into()))?;
        if first.mode != ExecutionMode::Sequential {
            return Err(BenchError::Config(format!(
                "first sweep entry must be the sequential baseline, got {}",
                first
            )));
        }
        for entry in &self.sweep {
            if entry.workers == 0 {
                return Err(BenchError::Config(format!("{} has zero workers", entry)));
            }
            if entry.mode == ExecutionMode::Sequential && entry.workers != 1 {
                return Err(BenchError::Config(format!(
                    "sequential runs use exactly one worker, got {}",
                    entry.workers
                )));
            }
        }
        Ok(())
    }
}

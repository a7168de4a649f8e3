//! Benchmark dataset: the corpus of labelled vectors and the query sample.
//!
//! Vectors live in one contiguous `f32` buffer; label `i` is row `i`. Both
//! structures are immutable once created.

use crate::{BenchError, BenchResult};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Ordered, immutable set of `len` vectors of `dim` components.
#[derive(Debug, Clone)]
pub struct Corpus {
    dim: usize,
    data: Vec<f32>,
}

impl Corpus {
    /// Wrap a row-major buffer. `data.len()` must be a non-zero multiple of `dim`.
    pub fn from_flat(dim: usize, data: Vec<f32>) -> BenchResult<Self> {
        if dim == 0 {
            return Err(BenchError::Config("dim must be positive".into()));
        }
        if data.is_empty() || data.len() % dim != 0 {
            return Err(BenchError::Config(format!(
                "buffer of {} floats is not a non-empty multiple of dim {}",
                data.len(),
                dim
            )));
        }
        Ok(Self { dim, data })
    }

    /// Read the embedding pipeline's JSON output.
    ///
    /// Accepts a top-level `verses` or `items` array whose objects carry an
    /// `embedding` field. Every embedding must have the same length.
    pub fn from_embeddings_json(path: &Path) -> BenchResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BenchError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let file: EmbeddingFile = serde_json::from_str(&content).map_err(|e| {
            BenchError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;

        let records = file.verses.or(file.items).unwrap_or_default();
        let dim = records
            .first()
            .map(|r| r.embedding.len())
            .ok_or_else(|| BenchError::Config(format!("{} has no embeddings", path.display())))?;
        if let Some(expected) = file.metadata.and_then(|m| m.embedding_dim) {
            if expected != dim {
                return Err(BenchError::Config(format!(
                    "metadata says dim {}, first embedding has {}",
                    expected, dim
                )));
            }
        }

        let mut data = Vec::with_capacity(records.len() * dim);
        for (i, record) in records.iter().enumerate() {
            if record.embedding.len() != dim {
                return Err(BenchError::Config(format!(
                    "embedding {} has dim {}, expected {}",
                    i,
                    record.embedding.len(),
                    dim
                )));
            }
            data.extend_from_slice(&record.embedding);
        }
        tracing::info!(path = %path.display(), vectors = records.len(), dim, "loaded embeddings");
        Self::from_flat(dim, data)
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Vector stored under `label`.
    pub fn vector(&self, label: usize) -> &[f32] {
        &self.data[label * self.dim..(label + 1) * self.dim]
    }

    /// `(label, vector)` pairs in ascending label order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[f32])> + '_ {
        self.data
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(i, v)| (i as u64, v))
    }
}

#[derive(Deserialize)]
struct EmbeddingFile {
    #[serde(default)]
    metadata: Option<EmbeddingMeta>,
    #[serde(default)]
    verses: Option<Vec<EmbeddingRecord>>,
    #[serde(default)]
    items: Option<Vec<EmbeddingRecord>>,
}

#[derive(Deserialize)]
struct EmbeddingMeta {
    #[serde(default)]
    embedding_dim: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingRecord {
    embedding: Vec<f32>,
}

/// One query: the corpus label it was drawn from and a copy of its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub label: u64,
    pub vector: Vec<f32>,
}

/// Fixed, ordered set of queries reused verbatim by every configuration.
#[derive(Debug, Clone)]
pub struct QuerySample {
    queries: Vec<Query>,
}

impl QuerySample {
    pub fn new(queries: Vec<Query>) -> Self {
        Self { queries }
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn as_slice(&self) -> &[Query] {
        &self.queries
    }

    pub fn labels(&self) -> impl Iterator<Item = u64> + '_ {
        self.queries.iter().map(|q| q.label)
    }
}

// ────────────────────────────────────────────────────────────────────────────────
// Data generator (deterministic via ChaCha8Rng)
// ────────────────────────────────────────────────────────────────────────────────

pub struct DataGen {
    rng: ChaCha8Rng,
}

impl DataGen {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// `n` vectors of `dim` independent components uniform in `[0, 1)`.
    pub fn corpus(&mut self, n: usize, dim: usize) -> BenchResult<Corpus> {
        if n == 0 || dim == 0 {
            return Err(BenchError::Config(format!(
                "corpus needs n > 0 and dim > 0, got n={} dim={}",
                n, dim
            )));
        }
        let total = n.checked_mul(dim).ok_or_else(|| {
            BenchError::Config(format!("corpus of {} x {} floats overflows", n, dim))
        })?;
        let data: Vec<f32> = (0..total).map(|_| self.rng.gen::<f32>()).collect();
        tracing::info!(vectors = n, dim, "generated random corpus");
        Corpus::from_flat(dim, data)
    }

    /// Draw `m` distinct labels uniformly without replacement.
    pub fn sample_queries(&mut self, corpus: &Corpus, m: usize) -> BenchResult<QuerySample> {
        if m > corpus.len() {
            return Err(BenchError::Config(format!(
                "cannot sample {} queries from a corpus of {}",
                m,
                corpus.len()
            )));
        }
        let queries = rand::seq::index::sample(&mut self.rng, corpus.len(), m)
            .into_iter()
            .map(|label| Query {
                label: label as u64,
                vector: corpus.vector(label).to_vec(),
            })
            .collect();
        Ok(QuerySample::new(queries))
    }
}

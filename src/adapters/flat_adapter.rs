//! Exact brute-force index.
//!
//! Scans every stored vector with a bounded max-heap, O(N log k) per query.
//! Results are exact, so the search parameter has no effect.

use super::{
    sort_neighbors, AnnIndex, IndexBackend, IndexError, IndexParams, IndexResult, Neighbor,
    BUILD_BATCH_SIZE,
};
use crate::config::Metric;
use crate::corpus::Corpus;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

const SNAPSHOT_MAGIC: &[u8; 8] = b"ANNFLAT1";
/// magic + metric + dim + count
const HEADER_LEN: usize = 8 + 1 + 4 + 8;

// ────────────────────────────────────────────────────────────────────────────────
// Heap entry ordered by (distance, label)
// ────────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq)]
struct Candidate {
    distance: f32,
    label: u64,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.label.cmp(&other.label))
    }
}

pub struct FlatIndex {
    metric: Metric,
    dim: usize,
    /// dim * count floats, contiguous, label = row
    data: Vec<f32>,
    /// Per-row L2 norms, only filled for cosine.
    norms: Vec<f32>,
}

impl FlatIndex {
    pub fn build(corpus: &Corpus, params: &IndexParams) -> IndexResult<Self> {
        let mut index = Self::empty(params.metric, corpus.dim(), params.max_capacity);

        let total = corpus.len();
        let mut inserted = 0usize;
        let mut batch: Vec<&[f32]> = Vec::with_capacity(BUILD_BATCH_SIZE);
        for (_, vector) in corpus.iter() {
            batch.push(vector);
            if batch.len() == BUILD_BATCH_SIZE {
                index.add_batch(&batch)?;
                inserted += batch.len();
                batch.clear();
                tracing::debug!(inserted, total, "flat build progress");
            }
        }
        if !batch.is_empty() {
            index.add_batch(&batch)?;
        }
        Ok(index)
    }

    fn empty(metric: Metric, dim: usize, capacity: usize) -> Self {
        Self {
            metric,
            dim,
            data: Vec::with_capacity(dim * capacity),
            norms: Vec::new(),
        }
    }

    fn add_batch(&mut self, batch: &[&[f32]]) -> IndexResult<()> {
        for vector in batch {
            if vector.len() != self.dim {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dim,
                    got: vector.len(),
                });
            }
            self.data.extend_from_slice(vector);
            if self.metric == Metric::Cosine {
                self.norms.push(norm(vector));
            }
        }
        Ok(())
    }

    pub fn deserialize(bytes: &[u8], metric: Metric, dim: usize) -> IndexResult<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..8] != SNAPSHOT_MAGIC {
            return Err(IndexError::Snapshot("not a flat index snapshot".into()));
        }
        let stored_metric = metric_from_tag(bytes[8])?;
        if stored_metric != metric {
            return Err(IndexError::Snapshot(format!(
                "snapshot metric is {}, expected {}",
                stored_metric, metric
            )));
        }
        let stored_dim = u32::from_le_bytes(read_array(&bytes[9..13])) as usize;
        if stored_dim == 0 || stored_dim != dim {
            return Err(IndexError::DimensionMismatch {
                expected: dim,
                got: stored_dim,
            });
        }
        let count = u64::from_le_bytes(read_array(&bytes[13..21])) as usize;
        let body = &bytes[HEADER_LEN..];
        let expected = count
            .checked_mul(dim * 4)
            .ok_or_else(|| IndexError::Snapshot(format!("vector count {} overflows", count)))?;
        if body.len() != expected {
            return Err(IndexError::Snapshot(format!(
                "expected {} payload bytes, found {}",
                expected,
                body.len()
            )));
        }

        let mut index = Self::empty(metric, dim, count);
        index.data = body
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if metric == Metric::Cosine {
            index.norms = index.data.chunks_exact(dim).map(norm).collect();
        }
        Ok(index)
    }

    fn distance(&self, query: &[f32], query_norm: f32, row: usize) -> f32 {
        let v = &self.data[row * self.dim..(row + 1) * self.dim];
        match self.metric {
            Metric::L2 => query
                .iter()
                .zip(v)
                .map(|(a, b)| (a - b) * (a - b))
                .sum(),
            Metric::Ip => 1.0 - dot(query, v),
            Metric::Cosine => {
                let denom = query_norm * self.norms[row];
                if denom > 0.0 {
                    1.0 - dot(query, v) / denom
                } else {
                    1.0
                }
            }
        }
    }
}

impl AnnIndex for FlatIndex {
    fn backend(&self) -> IndexBackend {
        IndexBackend::Flat
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    fn set_search_param(&mut self, _ef: usize) -> IndexResult<()> {
        Ok(())
    }

    fn query(&self, vector: &[f32], k: usize) -> IndexResult<Vec<Neighbor>> {
        let count = self.len();
        if count == 0 {
            return Err(IndexError::EmptyIndex);
        }
        let query_norm = if self.metric == Metric::Cosine {
            norm(vector)
        } else {
            0.0
        };

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        for row in 0..count {
            let candidate = Candidate {
                distance: self.distance(vector, query_norm, row),
                label: row as u64,
            };
            if heap.len() < k {
                heap.push(candidate);
            } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                heap.pop();
                heap.push(candidate);
            }
        }

        let mut hits: Vec<Neighbor> = heap
            .into_vec()
            .into_iter()
            .map(|c| Neighbor {
                label: c.label,
                distance: c.distance,
            })
            .collect();
        sort_neighbors(&mut hits);
        Ok(hits)
    }

    fn serialize(&self) -> IndexResult<Vec<u8>> {
        let count = self.len();
        let dim = u32::try_from(self.dim)
            .map_err(|_| IndexError::Snapshot(format!("dim {} too large", self.dim)))?;
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.push(metric_tag(self.metric));
        out.extend_from_slice(&dim.to_le_bytes());
        out.extend_from_slice(&(count as u64).to_le_bytes());
        for f in &self.data {
            out.extend_from_slice(&f.to_le_bytes());
        }
        Ok(out)
    }
}

// ────────────────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────────────────

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

fn metric_tag(metric: Metric) -> u8 {
    match metric {
        Metric::Cosine => 0,
        Metric::L2 => 1,
        Metric::Ip => 2,
    }
}

fn metric_from_tag(tag: u8) -> IndexResult<Metric> {
    match tag {
        0 => Ok(Metric::Cosine),
        1 => Ok(Metric::L2),
        2 => Ok(Metric::Ip),
        other => Err(IndexError::Snapshot(format!("unknown metric tag {}", other))),
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::DataGen;

    fn params(metric: Metric, dim: usize, capacity: usize) -> IndexParams {
        IndexParams {
            metric,
            dim,
            connectivity: 16,
            ef_construction: 200,
            ef_search: 50,
            max_capacity: capacity,
        }
    }

    fn corpus_from(rows: &[[f32; 2]]) -> Corpus {
        Corpus::from_flat(2, rows.iter().flatten().copied().collect()).unwrap()
    }

    #[test]
    fn test_query_returns_nearest_first() {
        let corpus = corpus_from(&[[0.0, 0.0], [3.0, 0.0], [1.0, 0.0], [10.0, 10.0]]);
        let index = FlatIndex::build(&corpus, &params(Metric::L2, 2, 4)).unwrap();
        let hits = index.query(&[0.9, 0.0], 3).unwrap();
        let labels: Vec<u64> = hits.iter().map(|h| h.label).collect();
        assert_eq!(labels, vec![2, 0, 1]);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_ties_resolved_by_ascending_label() {
        // Labels 1, 2 and 3 are equidistant from the query.
        let corpus = corpus_from(&[[5.0, 5.0], [1.0, 0.0], [-1.0, 0.0], [0.0, 1.0]]);
        let index = FlatIndex::build(&corpus, &params(Metric::L2, 2, 4)).unwrap();
        let hits = index.query(&[0.0, 0.0], 2).unwrap();
        let labels: Vec<u64> = hits.iter().map(|h| h.label).collect();
        assert_eq!(labels, vec![1, 2]);
    }

    #[test]
    fn test_repeated_queries_are_identical() {
        let mut gen = DataGen::new(5);
        let corpus = gen.corpus(500, 8).unwrap();
        let index = FlatIndex::build(&corpus, &params(Metric::Cosine, 8, 500)).unwrap();
        let q = corpus.vector(17).to_vec();
        let first = index.query(&q, 5).unwrap();
        for _ in 0..5 {
            assert_eq!(index.query(&q, 5).unwrap(), first);
        }
        assert_eq!(first.len(), 5);
        assert_eq!(first[0].label, 17);
    }

    #[test]
    fn test_build_spans_multiple_batches() {
        let corpus = DataGen::new(9).corpus(BUILD_BATCH_SIZE * 2 + 7, 3).unwrap();
        let index = FlatIndex::build(&corpus, &params(Metric::L2, 3, corpus.len())).unwrap();
        assert_eq!(index.len(), corpus.len());
        let last = corpus.len() - 1;
        let hits = index.query(corpus.vector(last), 1).unwrap();
        assert_eq!(hits[0].label, last as u64);
    }

    #[test]
    fn test_snapshot_restores_equivalent_index() {
        let corpus = DataGen::new(2).corpus(300, 6).unwrap();
        let index = FlatIndex::build(&corpus, &params(Metric::Cosine, 6, 300)).unwrap();
        let bytes = index.serialize().unwrap();
        let restored = FlatIndex::deserialize(&bytes, Metric::Cosine, 6).unwrap();
        assert_eq!(restored.len(), 300);
        let q = corpus.vector(42);
        assert_eq!(index.query(q, 10).unwrap(), restored.query(q, 10).unwrap());
    }

    #[test]
    fn test_snapshot_rejects_wrong_metric_dim_and_garbage() {
        let corpus = DataGen::new(2).corpus(20, 6).unwrap();
        let bytes = FlatIndex::build(&corpus, &params(Metric::L2, 6, 20))
            .unwrap()
            .serialize()
            .unwrap();
        assert!(matches!(
            FlatIndex::deserialize(&bytes, Metric::Cosine, 6),
            Err(IndexError::Snapshot(_))
        ));
        assert!(matches!(
            FlatIndex::deserialize(&bytes, Metric::L2, 7),
            Err(IndexError::DimensionMismatch { .. })
        ));
        assert!(FlatIndex::deserialize(&bytes[..bytes.len() - 1], Metric::L2, 6).is_err());
        assert!(FlatIndex::deserialize(b"nope", Metric::L2, 6).is_err());
    }
}

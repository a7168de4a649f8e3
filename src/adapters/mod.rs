//! Index adapters: the narrow interface the harness uses to talk to an ANN library.
//!
//! Every backend implements [`AnnIndex`]. Construction goes through
//! [`IndexBackend::build`] and [`IndexBackend::deserialize`] so the harness
//! never names a concrete index type.

pub mod flat_adapter;

#[cfg(feature = "usearch-index")]
pub mod usearch_adapter;

use crate::config::Metric;
use crate::corpus::Corpus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Vectors inserted per batch during a build.
pub(crate) const BUILD_BATCH_SIZE: usize = 1000;

pub type IndexResult<T> = std::result::Result<T, IndexError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndexError {
    #[error("dimension mismatch: index has {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("capacity {capacity} exceeded by {requested} vectors")]
    CapacityExceeded { capacity: usize, requested: usize },

    #[error("index is empty")]
    EmptyIndex,

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend '{0}' is not compiled into this binary")]
    Unavailable(IndexBackend),
}

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub label: u64,
    pub distance: f32,
}

/// Nearest first; equal distances ordered by ascending label.
pub(crate) fn sort_neighbors(hits: &mut [Neighbor]) {
    hits.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.label.cmp(&b.label))
    });
}

/// Parameters fixed at build time, plus the current search parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexParams {
    pub metric: Metric,
    pub dim: usize,
    /// Graph degree ("M").
    pub connectivity: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_capacity: usize,
}

/// Contract every ANN backend fulfils.
pub trait AnnIndex: Send + Sync {
    fn backend(&self) -> IndexBackend;

    fn dim(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adjust the search-time recall/speed tradeoff.
    fn set_search_param(&mut self, ef: usize) -> IndexResult<()>;

    /// `k` nearest neighbours of `vector`, nearest first.
    fn query(&self, vector: &[f32], k: usize) -> IndexResult<Vec<Neighbor>>;

    /// Self-contained snapshot that [`IndexBackend::deserialize`] can restore.
    fn serialize(&self) -> IndexResult<Vec<u8>>;
}

/// Which ANN library backs the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    /// Exact brute-force search, always available.
    #[default]
    Flat,
    /// HNSW from the usearch library (feature `usearch-index`).
    Usearch,
}

impl fmt::Display for IndexBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexBackend::Flat => write!(f, "flat"),
            IndexBackend::Usearch => write!(f, "usearch"),
        }
    }
}

impl std::str::FromStr for IndexBackend {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flat" | "exact" => Ok(IndexBackend::Flat),
            "usearch" | "hnsw" => Ok(IndexBackend::Usearch),
            other => Err(IndexError::InvalidParameter(format!(
                "unknown backend '{}', use: flat, usearch",
                other
            ))),
        }
    }
}

impl IndexBackend {
    /// Build an index over `corpus`, inserting in ascending label order.
    pub fn build(&self, corpus: &Corpus, params: IndexParams) -> IndexResult<IndexHandle> {
        if params.dim != corpus.dim() {
            return Err(IndexError::DimensionMismatch {
                expected: params.dim,
                got: corpus.dim(),
            });
        }
        if corpus.len() > params.max_capacity {
            return Err(IndexError::CapacityExceeded {
                capacity: params.max_capacity,
                requested: corpus.len(),
            });
        }
        let index: Box<dyn AnnIndex> = match self {
            IndexBackend::Flat => Box::new(flat_adapter::FlatIndex::build(corpus, &params)?),
            #[cfg(feature = "usearch-index")]
            IndexBackend::Usearch => {
                Box::new(usearch_adapter::UsearchIndex::build(corpus, &params)?)
            }
            #[cfg(not(feature = "usearch-index"))]
            IndexBackend::Usearch => return Err(IndexError::Unavailable(*self)),
        };
        let mut handle = IndexHandle { index, params };
        handle.set_search_param(params.ef_search)?;
        Ok(handle)
    }

    /// Restore an index from bytes produced by [`AnnIndex::serialize`].
    pub fn deserialize(&self, bytes: &[u8], params: IndexParams) -> IndexResult<IndexHandle> {
        let index: Box<dyn AnnIndex> = match self {
            IndexBackend::Flat => Box::new(flat_adapter::FlatIndex::deserialize(
                bytes,
                params.metric,
                params.dim,
            )?),
            #[cfg(feature = "usearch-index")]
            IndexBackend::Usearch => Box::new(usearch_adapter::UsearchIndex::deserialize(
                bytes, &params,
            )?),
            #[cfg(not(feature = "usearch-index"))]
            IndexBackend::Usearch => return Err(IndexError::Unavailable(*self)),
        };
        let mut handle = IndexHandle { index, params };
        handle.set_search_param(params.ef_search)?;
        Ok(handle)
    }
}

/// Owned index plus the parameters it was built with.
pub struct IndexHandle {
    index: Box<dyn AnnIndex>,
    params: IndexParams,
}

impl IndexHandle {
    pub fn params(&self) -> &IndexParams {
        &self.params
    }

    pub fn backend(&self) -> IndexBackend {
        self.index.backend()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn set_search_param(&mut self, ef: usize) -> IndexResult<()> {
        if ef == 0 {
            return Err(IndexError::InvalidParameter("ef must be positive".into()));
        }
        self.index.set_search_param(ef)?;
        self.params.ef_search = ef;
        Ok(())
    }

    pub fn query(&self, vector: &[f32], k: usize) -> IndexResult<Vec<Neighbor>> {
        if vector.len() != self.index.dim() {
            return Err(IndexError::DimensionMismatch {
                expected: self.index.dim(),
                got: vector.len(),
            });
        }
        if k == 0 {
            return Err(IndexError::InvalidParameter("k must be positive".into()));
        }
        self.index.query(vector, k)
    }

    pub fn serialize(&self) -> IndexResult<Vec<u8>> {
        self.index.serialize()
    }
}

impl fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexHandle")
            .field("backend", &self.index.backend())
            .field("len", &self.index.len())
            .field("params", &self.params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::DataGen;

    fn params(dim: usize, capacity: usize) -> IndexParams {
        IndexParams {
            metric: Metric::L2,
            dim,
            connectivity: 16,
            ef_construction: 200,
            ef_search: 50,
            max_capacity: capacity,
        }
    }

    #[test]
    fn test_build_rejects_dimension_mismatch() {
        let corpus = DataGen::new(1).corpus(10, 4).unwrap();
        let err = IndexBackend::Flat.build(&corpus, params(8, 10)).unwrap_err();
        assert_eq!(err, IndexError::DimensionMismatch { expected: 8, got: 4 });
    }

    #[test]
    fn test_build_rejects_over_capacity() {
        let corpus = DataGen::new(1).corpus(10, 4).unwrap();
        let err = IndexBackend::Flat.build(&corpus, params(4, 5)).unwrap_err();
        assert!(matches!(err, IndexError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_handle_tracks_search_param() {
        let corpus = DataGen::new(1).corpus(10, 4).unwrap();
        let mut handle = IndexBackend::Flat.build(&corpus, params(4, 10)).unwrap();
        assert_eq!(handle.params().ef_search, 50);
        handle.set_search_param(128).unwrap();
        assert_eq!(handle.params().ef_search, 128);
        assert!(handle.set_search_param(0).is_err());
    }

    #[test]
    fn test_query_validates_input() {
        let corpus = DataGen::new(1).corpus(10, 4).unwrap();
        let handle = IndexBackend::Flat.build(&corpus, params(4, 10)).unwrap();
        assert!(matches!(
            handle.query(&[0.0; 3], 1),
            Err(IndexError::DimensionMismatch { .. })
        ));
        assert!(handle.query(&[0.0; 4], 0).is_err());
    }

    #[test]
    fn test_sort_neighbors_breaks_ties_by_label() {
        let mut hits = vec![
            Neighbor { label: 9, distance: 0.5 },
            Neighbor { label: 3, distance: 0.5 },
            Neighbor { label: 7, distance: 0.1 },
        ];
        sort_neighbors(&mut hits);
        let labels: Vec<u64> = hits.iter().map(|h| h.label).collect();
        assert_eq!(labels, vec![7, 3, 9]);
    }

    #[cfg(not(feature = "usearch-index"))]
    #[test]
    fn test_usearch_unavailable_without_feature() {
        let corpus = DataGen::new(1).corpus(10, 4).unwrap();
        assert_eq!(
            IndexBackend::Usearch.build(&corpus, params(4, 10)).unwrap_err(),
            IndexError::Unavailable(IndexBackend::Usearch)
        );
    }
}

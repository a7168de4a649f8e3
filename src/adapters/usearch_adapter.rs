//! HNSW index backed by usearch.
//!
//! Snapshots use usearch's native serialization, written to and read from an
//! in-memory buffer.

use super::{
    sort_neighbors, AnnIndex, IndexBackend, IndexError, IndexParams, IndexResult, Neighbor,
    BUILD_BATCH_SIZE,
};
use crate::config::Metric;
use crate::corpus::Corpus;
use usearch::{new_index, Index, IndexOptions, MetricKind, ScalarKind};

pub struct UsearchIndex {
    index: Index,
    dim: usize,
}

impl UsearchIndex {
    fn options(params: &IndexParams) -> IndexOptions {
        IndexOptions {
            dimensions: params.dim,
            metric: match params.metric {
                Metric::Cosine => MetricKind::Cos,
                Metric::L2 => MetricKind::L2sq,
                Metric::Ip => MetricKind::IP,
            },
            quantization: ScalarKind::F32,
            connectivity: params.connectivity,
            expansion_add: params.ef_construction,
            expansion_search: params.ef_search,
            multi: false,
        }
    }

    pub fn build(corpus: &Corpus, params: &IndexParams) -> IndexResult<Self> {
        let index = new_index(&Self::options(params))
            .map_err(|e| IndexError::Backend(format!("create: {}", e.what())))?;
        index
            .reserve(params.max_capacity)
            .map_err(|e| IndexError::Backend(format!("reserve: {}", e.what())))?;

        let total = corpus.len();
        let mut inserted = 0usize;
        let rows: Vec<(u64, &[f32])> = corpus.iter().collect();
        for batch in rows.chunks(BUILD_BATCH_SIZE) {
            for &(label, vector) in batch {
                index
                    .add(label, vector)
                    .map_err(|e| IndexError::Backend(format!("add {}: {}", label, e.what())))?;
            }
            inserted += batch.len();
            if inserted % (BUILD_BATCH_SIZE * 5) == 0 || inserted == total {
                tracing::info!(inserted, total, "usearch build progress");
            }
        }

        Ok(Self {
            index,
            dim: params.dim,
        })
    }

    pub fn deserialize(bytes: &[u8], params: &IndexParams) -> IndexResult<Self> {
        let index = new_index(&Self::options(params))
            .map_err(|e| IndexError::Backend(format!("create: {}", e.what())))?;
        index
            .load_from_buffer(bytes)
            .map_err(|e| IndexError::Snapshot(format!("load: {}", e.what())))?;
        if index.dimensions() != params.dim {
            return Err(IndexError::DimensionMismatch {
                expected: params.dim,
                got: index.dimensions(),
            });
        }
        Ok(Self {
            index,
            dim: params.dim,
        })
    }
}

impl AnnIndex for UsearchIndex {
    fn backend(&self) -> IndexBackend {
        IndexBackend::Usearch
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.index.size()
    }

    fn set_search_param(&mut self, ef: usize) -> IndexResult<()> {
        self.index.change_expansion_search(ef);
        Ok(())
    }

    fn query(&self, vector: &[f32], k: usize) -> IndexResult<Vec<Neighbor>> {
        if self.index.size() == 0 {
            return Err(IndexError::EmptyIndex);
        }
        let matches = self
            .index
            .search(vector, k)
            .map_err(|e| IndexError::Backend(format!("search: {}", e.what())))?;
        let mut hits: Vec<Neighbor> = matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .map(|(&label, &distance)| Neighbor { label, distance })
            .collect();
        sort_neighbors(&mut hits);
        Ok(hits)
    }

    fn serialize(&self) -> IndexResult<Vec<u8>> {
        let mut buffer = vec![0u8; self.index.serialized_length()];
        self.index
            .save_to_buffer(&mut buffer)
            .map_err(|e| IndexError::Snapshot(format!("save: {}", e.what())))?;
        Ok(buffer)
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
    fn test_build_query_and_snapshot() {
        let corpus = DataGen::new(4).corpus(2000, 8).unwrap();
        let index = UsearchIndex::build(&corpus, &params(8, 2000)).unwrap();
        assert_eq!(index.len(), 2000);

        let q = corpus.vector(123);
        let hits = index.query(q, 5).unwrap();
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].label, 123);
        assert_eq!(index.query(q, 5).unwrap(), hits);

        let bytes = index.serialize().unwrap();
        let restored = UsearchIndex::deserialize(&bytes, &params(8, 2000)).unwrap();
        assert_eq!(restored.len(), 2000);
        assert_eq!(restored.query(q, 1).unwrap()[0].label, 123);
    }
}

//! Process-isolated workers.
//!
//! The coordinator writes the canonical index to a snapshot file once, splits
//! the query sample into contiguous batches and launches one worker process
//! per batch. Each worker restores a private index from the snapshot, runs its
//! batch sequentially and answers with one JSON message on stdout. The
//! snapshot is the only shared resource and nobody writes to it after
//! creation.

use crate::adapters::{IndexBackend, IndexHandle, IndexParams, Neighbor};
use crate::corpus::Query;
use crate::metrics::LatencyRecorder;
use crate::{BenchError, BenchResult};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Split `queries` into `workers` contiguous batches of `len / workers`
/// queries; the last batch also takes the remainder.
pub fn partition(queries: &[Query], workers: usize) -> Vec<&[Query]> {
    if workers == 0 {
        return Vec::new();
    }
    let base = queries.len() / workers;
    (0..workers)
        .map(|i| {
            let start = i * base;
            let end = if i + 1 == workers {
                queries.len()
            } else {
                start + base
            };
            &queries[start..end]
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────────
// Snapshot
// ────────────────────────────────────────────────────────────────────────────────

/// Serialized copy of the canonical index on disk.
///
/// Lives in its own temporary directory, removed when the value is dropped.
pub struct IndexSnapshot {
    dir: TempDir,
    path: PathBuf,
    backend: IndexBackend,
    params: IndexParams,
    size_bytes: usize,
}

impl IndexSnapshot {
    /// Write `index` to a fresh directory under `root`, or under the system
    /// temp directory when `root` is `None`.
    pub fn write(index: &IndexHandle, root: Option<&Path>) -> BenchResult<Self> {
        let bytes = index.serialize()?;
        let mut builder = tempfile::Builder::new();
        builder.prefix("ann-sweep-");
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        let path = dir.path().join(format!("index.{}", index.backend()));
        fs::write(&path, &bytes)?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "wrote index snapshot");
        Ok(Self {
            dir,
            path,
            backend: index.backend(),
            params: *index.params(),
            size_bytes: bytes.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Restore the snapshot in-process and compare it with the canonical index.
    pub fn verify(&self, canonical: &IndexHandle, query: &Query, k: usize) -> BenchResult<()> {
        let bytes = fs::read(&self.path)?;
        let restored = self
            .backend
            .deserialize(&bytes, self.params)
            .map_err(|e| BenchError::Benchmark(format!("snapshot round-trip failed: {}", e)))?;
        if restored.len() != canonical.len() {
            return Err(BenchError::Benchmark(format!(
                "snapshot holds {} vectors, canonical index {}",
                restored.len(),
                canonical.len()
            )));
        }
        if restored.query(&query.vector, k)? != canonical.query(&query.vector, k)? {
            return Err(BenchError::Benchmark(
                "snapshot answers a sampled query differently from the canonical index".into(),
            ));
        }
        Ok(())
    }
}

impl Drop for IndexSnapshot {
    fn drop(&mut self) {
        tracing::debug!(dir = %self.dir.path().display(), "removing index snapshot");
    }
}

// ────────────────────────────────────────────────────────────────────────────────
// Worker protocol
// ────────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest<'a> {
    pub worker_id: usize,
    pub backend: IndexBackend,
    pub snapshot_path: PathBuf,
    pub params: IndexParams,
    pub k: usize,
    pub queries: Cow<'a, [Query]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub worker_id: usize,
    pub results: Vec<Vec<Neighbor>>,
    pub latencies_ns: Vec<u64>,
}

/// Worker side: read one request from `input`, answer on `output`.
pub fn serve_worker<R: Read, W: Write>(mut input: R, mut output: W) -> BenchResult<()> {
    let mut raw = Vec::new();
    input.read_to_end(&mut raw)?;
    let request: WorkerRequest = serde_json::from_slice(&raw)?;

    let bytes = fs::read(&request.snapshot_path)?;
    let index = request.backend.deserialize(&bytes, request.params)?;
    tracing::debug!(
        worker = request.worker_id,
        queries = request.queries.len(),
        "worker index restored"
    );

    let mut results = Vec::with_capacity(request.queries.len());
    let mut latencies_ns = Vec::with_capacity(request.queries.len());
    for query in request.queries.iter() {
        let start = Instant::now();
        let hits = index.query(&query.vector, request.k)?;
        latencies_ns.push(start.elapsed().as_nanos() as u64);
        results.push(hits);
    }

    let response = WorkerResponse {
        worker_id: request.worker_id,
        results,
        latencies_ns,
    };
    serde_json::to_writer(&mut output, &response)?;
    output.flush()?;
    Ok(())
}

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerLauncher {
    /// Run `program worker` for every worker.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["worker".to_string()],
        }
    }

    /// Workers are copies of the running executable.
    pub fn current_exe() -> BenchResult<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Start one worker, hand it `payload` and wait for its response.
    fn launch(&self, worker_id: usize, payload: &[u8]) -> BenchResult<WorkerResponse> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                BenchError::Benchmark(format!(
                    "failed to start worker {} ({}): {}",
                    worker_id,
                    self.program.display(),
                    e
                ))
            })?;

        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(payload),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker stdin unavailable",
            )),
        };
        if let Err(e) = written {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BenchError::Benchmark(format!(
                "failed to send batch to worker {}: {}",
                worker_id, e
            )));
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(BenchError::Benchmark(format!(
                "worker {} exited with {}",
                worker_id, output.status
            )));
        }
        let response: WorkerResponse = serde_json::from_slice(&output.stdout).map_err(|e| {
            BenchError::Benchmark(format!(
                "worker {} sent an unreadable response: {}",
                worker_id, e
            ))
        })?;
        if response.worker_id != worker_id {
            return Err(BenchError::Benchmark(format!(
                "expected response from worker {}, got {}",
                worker_id, response.worker_id
            )));
        }
        Ok(response)
    }
}

/// What one isolated pass produced.
pub struct IsolatedOutcome {
    /// Launch of the first worker to exit of the last.
    pub elapsed: Duration,
    pub completed: usize,
    pub latency: LatencyRecorder,
    /// Per-worker results in worker order.
    pub results: Vec<Vec<Vec<Neighbor>>>,
}

impl IsolatedOutcome {
    /// Check the labels of the first answer of every non-empty worker batch
    /// against the canonical index.
    pub fn verify_against(
        &self,
        canonical: &IndexHandle,
        queries: &[Query],
        k: usize,
    ) -> BenchResult<()> {
        let batches = partition(queries, self.results.len());
        for (worker_id, (answers, batch)) in self.results.iter().zip(&batches).enumerate() {
            let (Some(answer), Some(query)) = (answers.first(), batch.first()) else {
                continue;
            };
            let expected = canonical.query(&query.vector, k)?;
            if !answer.iter().map(|n| n.label).eq(expected.iter().map(|n| n.label)) {
                return Err(BenchError::Benchmark(format!(
                    "worker {} answered query {} differently from the canonical index",
                    worker_id, query.label
                )));
            }
        }
        Ok(())
    }
}

/// Run `queries` across `workers` processes restored from `snapshot`.
pub fn run_isolated(
    snapshot: &IndexSnapshot,
    launcher: &WorkerLauncher,
    queries: &[Query],
    workers: usize,
    k: usize,
) -> BenchResult<IsolatedOutcome> {
    let batches = partition(queries, workers);
    let payloads = batches
        .iter()
        .enumerate()
        .map(|(worker_id, batch)| {
            serde_json::to_vec(&WorkerRequest {
                worker_id,
                backend: snapshot.backend,
                snapshot_path: snapshot.path.clone(),
                params: snapshot.params,
                k,
                queries: Cow::Borrowed(batch),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let start = Instant::now();
    let responses = thread::scope(|scope| {
        let handles: Vec<_> = payloads
            .iter()
            .enumerate()
            .map(|(worker_id, payload)| {
                scope.spawn(move || launcher.launch(worker_id, payload))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().map_err(|_| {
                    BenchError::Benchmark("worker coordinator thread panicked".into())
                })?
            })
            .collect::<BenchResult<Vec<_>>>()
    })?;
    let elapsed = start.elapsed();

    let mut latency = LatencyRecorder::new();
    let mut results = Vec::with_capacity(responses.len());
    for (response, batch) in responses.into_iter().zip(&batches) {
        if response.results.len() != batch.len() {
            return Err(BenchError::Benchmark(format!(
                "worker {} answered {} of {} queries",
                response.worker_id,
                response.results.len(),
                batch.len()
            )));
        }
        for ns in &response.latencies_ns {
            latency.record_ns(*ns);
        }
        results.push(response.results);
    }
    let completed = results.iter().map(Vec::len).sum();

    Ok(IsolatedOutcome {
        elapsed,
        completed,
        latency,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Metric;
    use crate::corpus::DataGen;
    use std::io::Cursor;

    fn queries(n: usize) -> Vec<Query> {
        (0..n as u64)
            .map(|label| Query {
                label,
                vector: vec![label as f32],
            })
            .collect()
    }

    fn fixture() -> (IndexHandle, Vec<Query>) {
        let mut gen = DataGen::new(21);
        let corpus = gen.corpus(400, 6).unwrap();
        let sample = gen.sample_queries(&corpus, 12).unwrap();
        let params = IndexParams {
            metric: Metric::Cosine,
            dim: 6,
            connectivity: 16,
            ef_construction: 200,
            ef_search: 50,
            max_capacity: 400,
        };
        let index = IndexBackend::Flat.build(&corpus, params).unwrap();
        (index, sample.as_slice().to_vec())
    }

    #[test]
    fn test_partition_preserves_order_and_composition() {
        for m in [1usize, 2, 7, 50, 101] {
            let qs = queries(m);
            for workers in 1..=m {
                let batches = partition(&qs, workers);
                assert_eq!(batches.len(), workers);
                let rebuilt: Vec<Query> = batches.iter().flat_map(|b| b.iter().cloned()).collect();
                assert_eq!(rebuilt, qs);
                let base = m / workers;
                for batch in &batches[..workers - 1] {
                    assert_eq!(batch.len(), base);
                }
                assert_eq!(batches[workers - 1].len(), base + m % workers);
            }
        }
    }

    #[test]
    fn test_partition_remainder_goes_to_last_batch() {
        let qs = queries(10);
        let sizes: Vec<usize> = partition(&qs, 3).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 3, 4]);
    }

    #[test]
    fn test_snapshot_verifies_and_is_removed_on_drop() {
        let (index, qs) = fixture();
        let snapshot = IndexSnapshot::write(&index, None).unwrap();
        let path = snapshot.path().to_path_buf();
        assert!(path.exists());
        assert!(snapshot.size_bytes() > 0);
        snapshot.verify(&index, &qs[0], 5).unwrap();
        drop(snapshot);
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_snapshot_fails_verification() {
        let (index, qs) = fixture();
        let snapshot = IndexSnapshot::write(&index, None).unwrap();
        fs::write(snapshot.path(), b"garbage").unwrap();
        assert!(matches!(
            snapshot.verify(&index, &qs[0], 5),
            Err(BenchError::Benchmark(_))
        ));
    }

    #[test]
    fn test_serve_worker_answers_batch_like_canonical_index() {
        let (index, qs) = fixture();
        let snapshot = IndexSnapshot::write(&index, None).unwrap();
        let request = WorkerRequest {
            worker_id: 3,
            backend: IndexBackend::Flat,
            snapshot_path: snapshot.path().to_path_buf(),
            params: *index.params(),
            k: 4,
            queries: Cow::Borrowed(&qs[2..6]),
        };
        let input = serde_json::to_vec(&request).unwrap();
        let mut output = Vec::new();
        serve_worker(Cursor::new(input), &mut output).unwrap();

        let response: WorkerResponse = serde_json::from_slice(&output).unwrap();
        assert_eq!(response.worker_id, 3);
        assert_eq!(response.results.len(), 4);
        assert_eq!(response.latencies_ns.len(), 4);
        for (hits, q) in response.results.iter().zip(&qs[2..6]) {
            assert_eq!(hits, &index.query(&q.vector, 4).unwrap());
        }
    }

    #[test]
    fn test_serve_worker_rejects_missing_snapshot() {
        let (index, qs) = fixture();
        let request = WorkerRequest {
            worker_id: 0,
            backend: IndexBackend::Flat,
            snapshot_path: PathBuf::from("/nonexistent/ann-sweep/index.flat"),
            params: *index.params(),
            k: 4,
            queries: Cow::Borrowed(&qs[..1]),
        };
        let input = serde_json::to_vec(&request).unwrap();
        assert!(serve_worker(Cursor::new(input), Vec::new()).is_err());
    }

    #[test]
    fn test_snapshot_written_under_given_root() {
        let (index, _) = fixture();
        let root = tempfile::tempdir().unwrap();
        let snapshot = IndexSnapshot::write(&index, Some(root.path())).unwrap();
        assert!(snapshot.path().starts_with(root.path()));
        drop(snapshot);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    fn outcome_from(
        index: &IndexHandle,
        qs: &[Query],
        workers: usize,
        k: usize,
    ) -> IsolatedOutcome {
        let results = partition(qs, workers)
            .iter()
            .map(|batch| {
                batch
                    .iter()
                    .map(|q| index.query(&q.vector, k).unwrap())
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        IsolatedOutcome {
            elapsed: Duration::from_millis(1),
            completed: qs.len(),
            latency: LatencyRecorder::new(),
            results,
        }
    }

    #[test]
    fn test_worker_results_checked_against_canonical_index() {
        let (index, qs) = fixture();
        let outcome = outcome_from(&index, &qs, 3, 4);
        outcome.verify_against(&index, &qs, 4).unwrap();

        let mut tampered = outcome_from(&index, &qs, 3, 4);
        tampered.results[1][0].reverse();
        assert!(matches!(
            tampered.verify_against(&index, &qs, 4),
            Err(BenchError::Benchmark(msg)) if msg.contains("worker 1")
        ));
    }

    #[test]
    fn test_unstartable_worker_is_fatal() {
        let (index, qs) = fixture();
        let snapshot = IndexSnapshot::write(&index, None).unwrap();
        let launcher = WorkerLauncher::new("/nonexistent/ann-sweep-worker");
        let err = run_isolated(&snapshot, &launcher, &qs, 2, 3).err();
        assert!(matches!(err, Some(BenchError::Benchmark(msg)) if msg.contains("failed to start")));
    }
}

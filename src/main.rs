//! ANN concurrency sweep runner
//!
//! Usage:
//!   ann-sweep                                   # default sweep, synthetic 31173 x 768 corpus
//!   ann-sweep --corpus-size 5000 --dim 128      # smaller synthetic corpus
//!   ann-sweep --sweep seq,pooled:4,isolated:4   # custom sweep
//!   ann-sweep --config sweep.toml --export out  # file config, CSV + JSON export
//!
//! The hidden `worker` subcommand is what isolated workers run; it reads one
//! request on stdin and writes one response on stdout.

use ann_sweep::adapters::IndexBackend;
use ann_sweep::config::{ConcurrencyConfig, Metric, RunConfig};
use ann_sweep::{isolated, report, BenchResult, InPhase, Phase, RunFailure, WorkerLauncher};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ann-sweep", about = "ANN search concurrency sweep benchmark")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// TOML run configuration; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of synthetic corpus vectors.
    #[arg(long)]
    corpus_size: Option<usize>,

    /// Vector dimension.
    #[arg(long)]
    dim: Option<usize>,

    /// Number of queries per configuration.
    #[arg(long)]
    queries: Option<usize>,

    /// Neighbors returned per query.
    #[arg(short, long)]
    k: Option<usize>,

    /// Distance metric (cosine, l2, ip).
    #[arg(long)]
    metric: Option<Metric>,

    /// Index backend (flat, usearch).
    #[arg(long)]
    backend: Option<IndexBackend>,

    /// Search-time candidate list size.
    #[arg(long)]
    ef_search: Option<usize>,

    /// Construction-time candidate list size.
    #[arg(long)]
    ef_construction: Option<usize>,

    /// Graph degree for graph-based backends.
    #[arg(long)]
    connectivity: Option<usize>,

    /// Seed for corpus generation and query sampling.
    #[arg(long)]
    seed: Option<u64>,

    /// JSON embedding file to use instead of a synthetic corpus.
    #[arg(long)]
    embeddings: Option<PathBuf>,

    /// Sweep entries (comma-separated: sequential, pooled:<k>, isolated:<p>).
    #[arg(long, value_delimiter = ',')]
    sweep: Vec<ConcurrencyConfig>,

    /// Cap on isolated workers; defaults to the detected CPU count.
    #[arg(long)]
    max_parallelism: Option<usize>,

    /// Export directory for CSV + JSON results.
    #[arg(long)]
    export: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve one isolated-worker request on stdin/stdout.
    #[command(hide = true)]
    Worker,
}

impl Cli {
    fn run_config(&self) -> BenchResult<RunConfig> {
        let mut cfg = match &self.config {
            Some(path) => RunConfig::load_toml(path)?,
            None => RunConfig::default(),
        };
        if let Some(v) = self.corpus_size {
            cfg.corpus_size = v;
        }
        if let Some(v) = self.dim {
            cfg.dim = v;
        }
        if let Some(v) = self.queries {
            cfg.query_count = v;
        }
        if let Some(v) = self.k {
            cfg.k = v;
        }
        if let Some(v) = self.metric {
            cfg.metric = v;
        }
        if let Some(v) = self.backend {
            cfg.backend = v;
        }
        if let Some(v) = self.ef_search {
            cfg.ef_search = v;
        }
        if let Some(v) = self.ef_construction {
            cfg.ef_construction = v;
        }
        if let Some(v) = self.connectivity {
            cfg.connectivity = v;
        }
        if let Some(v) = self.seed {
            cfg.seed = v;
        }
        if let Some(v) = &self.embeddings {
            cfg.embeddings = Some(v.clone());
        }
        if !self.sweep.is_empty() {
            cfg.sweep = self.sweep.clone();
        }
        if let Some(v) = self.max_parallelism {
            cfg.max_parallelism = Some(v);
        }
        Ok(cfg)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let outcome = match &cli.command {
        Some(Command::Worker) => {
            isolated::serve_worker(std::io::stdin().lock(), std::io::stdout().lock())
                .in_phase(Phase::Sweep)
        }
        None => run_sweep(&cli),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            eprintln!(
                "{} {}",
                format!("FATAL [{}]:", failure.phase).red().bold(),
                failure.source
            );
            ExitCode::FAILURE
        }
    }
}

fn run_sweep(cli: &Cli) -> Result<(), RunFailure> {
    let config = cli.run_config().in_phase(Phase::Config)?;
    let launcher = WorkerLauncher::current_exe().in_phase(Phase::Config)?;

    let run = ann_sweep::run(&config, &launcher)?;
    report::print_report(&run);

    if let Some(dir) = &cli.export {
        let exported: BenchResult<()> = (|| {
            std::fs::create_dir_all(dir)?;
            report::export_csv(&run, &dir.join("ann_sweep.csv"))?;
            report::export_json(&run, &dir.join("ann_sweep.json"))?;
            Ok(())
        })();
        exported.in_phase(Phase::Report)?;
    }
    Ok(())
}

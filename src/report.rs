//! Render sweep results as a table plus summary, and export them as CSV and JSON.

use crate::adapters::IndexBackend;
use crate::config::ExecutionMode;
use crate::metrics::{MetricRow, SweepRow};
use crate::RunReport;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use std::fmt::Write as _;
use std::path::Path;

/// Pooled speedup below this fraction of the isolated speedup adds the
/// pooled/isolated comparison to the shared-context note.
const LOW_POOLED_SPEEDUP_RATIO: f64 = 0.75;

// ────────────────────────────────────────────────────────────────────────────────
// Terminal output
// ────────────────────────────────────────────────────────────────────────────────

/// Result table, one row per sweep entry in sweep order.
pub fn render_table(rows: &[SweepRow]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS);

    table.set_header(vec![
        "Mode",
        "Workers",
        "Duration (ms)",
        "Avg latency (ms)",
        "QPS",
        "Speedup",
        "p50 (μs)",
        "p99 (μs)",
    ]);

    let best_qps = best_row(rows).map(|r| r.queries_per_second);

    for row in rows {
        match row {
            SweepRow::Measured(r) => {
                let is_best = best_qps == Some(r.queries_per_second);
                let mode = if is_best {
                    Cell::new(format!("★ {}", r.config.mode)).fg(Color::Green)
                } else {
                    Cell::new(r.config.mode.to_string())
                };
                let qps = Cell::new(format_throughput(r.queries_per_second));
                table.add_row(vec![
                    mode,
                    Cell::new(r.config.workers),
                    Cell::new(format!("{:.2}", ms(r.duration))),
                    Cell::new(format!("{:.3}", ms(r.latency_per_query))),
                    if is_best { qps.fg(Color::Green) } else { qps },
                    Cell::new(format!("{:.2}x", r.speedup_vs_baseline)),
                    Cell::new(format!("{:.1}", r.query_latency.p50_us)),
                    Cell::new(format!("{:.1}", r.query_latency.p99_us)),
                ]);
            }
            SweepRow::Skipped(r) => {
                table.add_row(vec![
                    Cell::new(r.config.mode.to_string()).fg(Color::DarkGrey),
                    Cell::new(r.config.workers).fg(Color::DarkGrey),
                    Cell::new(format!("skipped: {}", r.reason)).fg(Color::DarkGrey),
                    Cell::new("-"),
                    Cell::new("-"),
                    Cell::new("-"),
                    Cell::new("-"),
                    Cell::new("-"),
                ]);
            }
        }
    }
    table
}

/// Summary block that follows the table.
pub fn render_summary(report: &RunReport) -> String {
    let mut out = String::new();
    let rows = &report.rows;

    let _ = writeln!(out, "Index build: {:.2} ms", ms(report.build_time));
    if let Some(base) = rows
        .iter()
        .filter_map(SweepRow::measured)
        .find(|r| r.config.mode == ExecutionMode::Sequential)
    {
        let _ = writeln!(out, "Sequential baseline: {:.1} QPS", base.queries_per_second);
    }
    if let Some(best) = best_row(rows) {
        let _ = writeln!(
            out,
            "Best throughput: {:.1} QPS ({}), {:.2}x over baseline",
            best.queries_per_second, best.config, best.speedup_vs_baseline
        );
    }
    if let Some(fastest) = rows
        .iter()
        .filter_map(SweepRow::measured)
        .min_by(|a, b| a.latency_per_query.cmp(&b.latency_per_query))
    {
        let _ = writeln!(
            out,
            "Best latency: {:.3} ms per query ({})",
            ms(fastest.latency_per_query),
            fastest.config
        );
    }
    let skipped = rows
        .iter()
        .filter(|r| matches!(r, SweepRow::Skipped(_)))
        .count();
    if skipped > 0 {
        let _ = writeln!(out, "Skipped configurations: {}", skipped);
    }
    if let Some(note) = shared_context_note(rows) {
        let _ = writeln!(out, "\nNote: {}", note);
    }
    out
}

/// Caveat printed whenever a pooled configuration was measured.
///
/// When isolated rows exist and pooled scales much worse, the comparison is
/// stated first.
pub fn shared_context_note(rows: &[SweepRow]) -> Option<String> {
    let best_speedup = |mode: ExecutionMode| {
        rows.iter()
            .filter_map(SweepRow::measured)
            .filter(|r| r.config.mode == mode)
            .map(|r| r.speedup_vs_baseline)
            .reduce(f64::max)
    };
    let pooled = best_speedup(ExecutionMode::Pooled)?;
    let caveat = "Pooled workers share one execution context, so searches that are \
                  serialised inside it cannot run in parallel and pooled speedup may be \
                  small or absent. That comes from the scheduling constraint, not from \
                  measurement error.";
    match best_speedup(ExecutionMode::Isolated) {
        Some(isolated) if pooled < isolated * LOW_POOLED_SPEEDUP_RATIO => Some(format!(
            "pooled workers peak at {:.2}x while isolated workers reach {:.2}x. {}",
            pooled, isolated, caveat
        )),
        _ => Some(caveat.to_string()),
    }
}

/// Caveat for backends that are not an ANN library.
pub fn backend_note(backend: IndexBackend) -> Option<&'static str> {
    match backend {
        IndexBackend::Flat => Some(
            "flat is an exact brute-force index; build with --features usearch-index \
             and pass --backend usearch to measure an HNSW library",
        ),
        IndexBackend::Usearch => None,
    }
}

/// Table and summary as plain text.
pub fn render(report: &RunReport) -> String {
    format!("{}\n\n{}", render_table(&report.rows), render_summary(report))
}

/// Print the full report to stdout.
pub fn print_report(report: &RunReport) {
    println!(
        "\n{}",
        "╔══════════════════════════════════════════════════════════════╗"
            .bold()
            .blue()
    );
    println!(
        "{}",
        "║              ANN Concurrency Sweep Report                    ║"
            .bold()
            .blue()
    );
    println!(
        "{}",
        "╚══════════════════════════════════════════════════════════════╝"
            .bold()
            .blue()
    );

    println!(
        "  OS: {}  Arch: {}  CPUs: {}  Time: {}",
        report.system_info.os,
        report.system_info.arch,
        report.system_info.cpus,
        report.system_info.timestamp
    );
    println!(
        "  Corpus: {} x {}  Queries: {}  k: {}  Backend: {}  Metric: {}  ef_search: {}",
        report.corpus_size,
        report.dim,
        report.query_count,
        report.params.k,
        report.params.backend,
        report.params.metric,
        report.params.ef_search
    );
    if let Some(note) = backend_note(report.params.backend) {
        println!("  {}", note.dimmed());
    }

    println!("\n{}", render_table(&report.rows));
    println!("\n{}", "── Summary ──".bold().yellow());
    print!("{}", render_summary(report));
}

// ────────────────────────────────────────────────────────────────────────────────
// CSV export
// ────────────────────────────────────────────────────────────────────────────────

pub fn export_csv(report: &RunReport, path: &Path) -> std::io::Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;

    wtr.write_record([
        "mode",
        "workers",
        "status",
        "queries",
        "duration_ms",
        "latency_per_query_ms",
        "qps",
        "speedup",
        "p50_us",
        "p99_us",
        "build_ms",
        "reason",
    ])?;

    let build_ms = format!("{:.3}", ms(report.build_time));
    for row in &report.rows {
        let record: Vec<String> = match row {
            SweepRow::Measured(r) => vec![
                r.config.mode.to_string(),
                r.config.workers.to_string(),
                "measured".to_string(),
                r.query_count.to_string(),
                format!("{:.6}", ms(r.duration)),
                format!("{:.6}", ms(r.latency_per_query)),
                format!("{:.2}", r.queries_per_second),
                format!("{:.4}", r.speedup_vs_baseline),
                format!("{:.2}", r.query_latency.p50_us),
                format!("{:.2}", r.query_latency.p99_us),
                build_ms.clone(),
                String::new(),
            ],
            SweepRow::Skipped(r) => {
                let mut record = vec![
                    r.config.mode.to_string(),
                    r.config.workers.to_string(),
                    "skipped".to_string(),
                ];
                record.extend(std::iter::repeat(String::new()).take(7));
                record.push(build_ms.clone());
                record.push(r.reason.clone());
                record
            }
        };
        wtr.write_record(&record)?;
    }

    wtr.flush()?;
    println!("  CSV exported to {}", path.display());
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────────
// JSON export
// ────────────────────────────────────────────────────────────────────────────────

pub fn export_json(report: &RunReport, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    std::fs::write(path, json)?;
    println!("  JSON exported to {}", path.display());
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────────
// Formatting helpers
// ────────────────────────────────────────────────────────────────────────────────

fn best_row(rows: &[SweepRow]) -> Option<&MetricRow> {
    rows.iter()
        .filter_map(SweepRow::measured)
        .max_by(|a, b| a.queries_per_second.total_cmp(&b.queries_per_second))
}

fn ms(d: std::time::Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

fn format_throughput(t: f64) -> String {
    if t >= 1_000_000.0 {
        format!("{:.2}M", t / 1_000_000.0)
    } else if t >= 1_000.0 {
        format!("{:.1}K", t / 1_000.0)
    } else {
        format!("{:.1}", t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConcurrencyConfig, RunConfig};
    use crate::metrics::{LatencySummary, SkippedRow};
    use crate::SystemInfo;
    use std::time::Duration;

    fn measured(config: ConcurrencyConfig, millis: u64, speedup: f64) -> SweepRow {
        let duration = Duration::from_millis(millis);
        SweepRow::Measured(MetricRow {
            config,
            query_count: 100,
            duration,
            latency_per_query: duration.div_f64(100.0),
            queries_per_second: 100.0 / duration.as_secs_f64(),
            speedup_vs_baseline: speedup,
            query_latency: LatencySummary::default(),
        })
    }

    fn report(rows: Vec<SweepRow>) -> RunReport {
        RunReport {
            system_info: SystemInfo::collect(),
            params: RunConfig::default(),
            corpus_size: 1000,
            dim: 8,
            query_count: 100,
            build_time: Duration::from_millis(42),
            rows,
        }
    }

    fn sample_rows() -> Vec<SweepRow> {
        vec![
            measured(ConcurrencyConfig::sequential(), 200, 1.0),
            measured(ConcurrencyConfig::pooled(5), 180, 200.0 / 180.0),
            measured(ConcurrencyConfig::isolated(2), 100, 2.0),
            SweepRow::Skipped(SkippedRow {
                config: ConcurrencyConfig::isolated(8),
                reason: "8 workers exceed available parallelism 2".into(),
            }),
        ]
    }

    #[test]
    fn test_render_lists_every_row_and_summary() {
        let text = render(&report(sample_rows()));
        assert!(text.contains("sequential"));
        assert!(text.contains("pooled"));
        assert!(text.contains("skipped: 8 workers exceed available parallelism 2"));
        assert!(text.contains("Best throughput: 1000.0 QPS (isolated:2), 2.00x over baseline"));
        assert!(text.contains("Sequential baseline: 500.0 QPS"));
        assert!(text.contains("Index build: 42.00 ms"));
        assert!(text.contains("Skipped configurations: 1"));
    }

    #[test]
    fn test_note_when_pooled_lags_isolated() {
        let note = shared_context_note(&sample_rows()).unwrap();
        assert!(
            note.starts_with("pooled workers peak at 1.11x while isolated workers reach 2.00x")
        );
        assert!(note.contains("share one execution context"));
    }

    #[test]
    fn test_caveat_without_comparison_when_pooled_keeps_up() {
        let rows = vec![
            measured(ConcurrencyConfig::sequential(), 200, 1.0),
            measured(ConcurrencyConfig::pooled(5), 110, 1.9),
            measured(ConcurrencyConfig::isolated(2), 100, 2.0),
        ];
        let note = shared_context_note(&rows).unwrap();
        assert!(note.contains("execution context"));
        assert!(!note.contains("peak at"));
    }

    #[test]
    fn test_caveat_when_isolated_rows_are_all_skipped() {
        let rows = vec![
            measured(ConcurrencyConfig::sequential(), 200, 1.0),
            measured(ConcurrencyConfig::pooled(5), 210, 0.95),
            SweepRow::Skipped(SkippedRow {
                config: ConcurrencyConfig::isolated(2),
                reason: "2 workers exceed available parallelism 1".into(),
            }),
        ];
        let text = render(&report(rows));
        assert!(text.contains("Note: Pooled workers share one execution context"));
        assert!(!text.contains("peak at"));
    }

    #[test]
    fn test_no_note_without_pooled_rows() {
        let rows = vec![
            measured(ConcurrencyConfig::sequential(), 200, 1.0),
            measured(ConcurrencyConfig::isolated(2), 100, 2.0),
        ];
        assert!(shared_context_note(&rows).is_none());
    }

    #[test]
    fn test_backend_note_only_for_flat() {
        assert!(backend_note(IndexBackend::Flat)
            .unwrap()
            .contains("--features usearch-index"));
        assert!(backend_note(IndexBackend::Usearch).is_none());
    }

    #[test]
    fn test_export_csv_includes_skipped_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.csv");
        export_csv(&report(sample_rows()), &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("mode,workers,status"));
        assert!(lines[1].starts_with("sequential,1,measured,100,"));
        assert!(lines[4].starts_with("isolated,8,skipped,"));
        assert!(lines[4].ends_with("8 workers exceed available parallelism 2"));
    }

    #[test]
    fn test_export_json_carries_params_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.json");
        export_json(&report(sample_rows()), &path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["corpus_size"], 1000);
        assert_eq!(value["params"]["k"], 10);
        assert_eq!(value["rows"].as_array().unwrap().len(), 4);
        assert_eq!(value["rows"][0]["status"], "measured");
        assert_eq!(value["rows"][3]["status"], "skipped");
        assert!((value["build_time"].as_f64().unwrap() - 42.0).abs() < 1e-6);
    }
}

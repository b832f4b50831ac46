use seedsift_core::config::SiftConfig;
use seedsift_core::orchestrator::Orchestrator;
use seedsift_core::report::RunReport;
use seedsift_core::seed_format;

use clap::{Parser, Subcommand};
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Curate the configured libraries' corpora.
    Run {
        #[clap(short, long, value_parser)]
        config: Option<PathBuf>,
        /// Only curate these libraries. May be repeated.
        #[clap(short, long = "library")]
        libraries: Vec<String>,
        #[clap(long)]
        timeout_ms: Option<u64>,
        #[clap(long)]
        budget_secs: Option<u64>,
        #[clap(long)]
        concurrency: Option<usize>,
        #[clap(long)]
        corpus_dir: Option<PathBuf>,
        /// Also write the final report as JSON.
        #[clap(long, value_parser)]
        report_json: Option<PathBuf>,
    },
    /// Print the annotation header of a seed file.
    Inspect { file: PathBuf },
}

const DEFAULT_CONFIG: &str = "seedsift.toml";

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            libraries,
            timeout_ms,
            budget_secs,
            concurrency,
            corpus_dir,
            report_json,
        } => {
            let config_path = config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
            log::info!("Loading configuration from {config_path:?}");
            let mut config = SiftConfig::load_from_file(&config_path)?;

            if let Some(ms) = timeout_ms {
                config.engine.candidate_timeout_ms = ms;
            }
            if let Some(secs) = budget_secs {
                config.engine.run_budget_secs = Some(secs);
            }
            if let Some(n) = concurrency {
                config.engine.concurrency = n;
            }
            if let Some(dir) = corpus_dir {
                config.engine.corpus_dir = dir;
            }
            config.restrict_to(&libraries)?;
            log::debug!("Effective configuration: {config:#?}");

            let base_dir = config_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let orchestrator = Orchestrator::from_config(&config, base_dir)?;
            let report = orchestrator.run();

            println!("{}", render_report(&report));
            for library in &report.libraries {
                for warning in &library.warnings {
                    println!("warning [{}]: {}", library.library, warning);
                }
                for finding in &library.findings {
                    println!(
                        "finding [{}] candidate {} (severity {}): {}",
                        library.library, finding.candidate_id, finding.severity, finding.description
                    );
                }
            }
            if let Some(path) = report_json {
                let json = serde_json::to_string_pretty(&report)?;
                std::fs::write(&path, json)
                    .map_err(|e| anyhow::anyhow!("Failed to write report to {:?}: {}", path, e))?;
                log::info!("Report written to {path:?}");
            }
        }
        Commands::Inspect { file } => {
            let text = std::fs::read_to_string(&file)
                .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", file, e))?;
            let description = describe_seed(&text)
                .map_err(|e| anyhow::anyhow!("{:?} is not an annotated seed: {}", file, e))?;
            print!("{description}");
        }
    }
    Ok(())
}

/// Human-readable summary of an annotated seed's header.
fn describe_seed(text: &str) -> Result<String, seed_format::SeedFormatError> {
    let seed = seed_format::parse(text)?;
    let density = if seed.quality.density_known {
        format!("{:.6}", seed.quality.density)
    } else {
        "unknown".to_string()
    };
    let lines = [
        ("id", seed.id.to_string()),
        ("prompt", seed.prompt.clone().unwrap_or_else(|| "-".to_string())),
        ("combination", format!("[{}]", seed.combination.join(", "))),
        ("score", format!("{:.4}", seed.score)),
        ("branches", seed.nr_unique_branch().to_string()),
        ("density", density),
        ("calls", seed.quality.library_calls.join(" -> ")),
        ("critical", seed.quality.critical_calls.join(" -> ")),
        ("visited", seed.quality.visited.to_string()),
        ("body", format!("{} lines", seed.body.lines().count())),
    ];
    Ok(lines
        .iter()
        .map(|(key, value)| format!("{:<14}{}\n", format!("{key}:"), value))
        .collect())
}

fn render_report(report: &RunReport) -> String {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "library", "processed", "admitted", "rejected", "replaced", "compile", "crash",
            "timeout", "non-zero", "infra", "lifecycle", "corpus", "sites", "density", "stop",
        ]);
    for lib in &report.libraries {
        let density = lib
            .aggregate_density
            .map_or_else(|| "n/a".to_string(), |d| format!("{d:.4}"));
        let counts = [
            lib.processed,
            lib.admitted,
            lib.rejected,
            lib.replaced,
            lib.compile_errors,
            lib.crashes,
            lib.timeouts,
            lib.non_zero,
            lib.infra_errors,
            lib.lifecycle_flags,
            lib.corpus_size as u64,
            lib.covered_sites as u64,
        ];
        let mut row = vec![Cell::new(&lib.library)];
        row.extend(
            counts
                .iter()
                .map(|n| Cell::new(n).set_alignment(CellAlignment::Right)),
        );
        row.push(Cell::new(density).set_alignment(CellAlignment::Right));
        row.push(Cell::new(lib.stop_reason.as_str()));
        table.add_row(row);
    }
    format!(
        "Curation finished in {:.2}s\n{}",
        report.elapsed_ms as f64 / 1000.0,
        table
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use seedsift_core::report::{LibraryReport, StopReason};
    use seedsift_core::scorer::QualityRecord;

    #[test]
    fn run_flags_parse_with_repeated_libraries() {
        let cli = Cli::try_parse_from([
            "seedsift",
            "run",
            "-l",
            "zlib",
            "--library",
            "cjson",
            "--budget-secs",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                libraries,
                budget_secs,
                config,
                ..
            } => {
                assert_eq!(libraries, vec!["zlib", "cjson"]);
                assert_eq!(budget_secs, Some(5));
                assert!(config.is_none());
            }
            other => panic!("Expected Run, got {other:?}"),
        }
        assert!(Cli::try_parse_from(["seedsift", "inspect"]).is_err());
    }

    #[test]
    fn report_table_lists_every_library() {
        let mut zlib = LibraryReport::new("zlib");
        zlib.processed = 12;
        zlib.admitted = 3;
        zlib.aggregate_density = Some(0.25);
        zlib.stop_reason = StopReason::Budget;
        let mut cjson = LibraryReport::new("cjson");
        cjson.crashes = 7;
        let report = RunReport {
            elapsed_ms: 1500,
            libraries: vec![zlib, cjson],
        };

        let table = render_report(&report);
        assert!(table.starts_with("Curation finished in 1.50s"));
        for needle in ["zlib", "cjson", "12", "0.2500", "budget", "n/a", "exhausted"] {
            assert!(table.contains(needle), "missing {needle:?} in\n{table}");
        }
    }

    #[test]
    fn describe_seed_prints_header_fields() {
        let quality = QualityRecord {
            unique_branches: [("inflate.c:10".to_string(), 1), ("inflate.c:42".to_string(), 3)]
                .into_iter()
                .collect(),
            library_calls: vec!["inflateInit_".into(), "inflateEnd".into()],
            critical_calls: vec!["inflateInit_".into(), "inflateEnd".into()],
            visited: 2,
            ..QualityRecord::default()
        };
        let text = seed_format::render(
            9,
            Some("Combine inflateInit_, inflateEnd"),
            &["inflateInit_".to_string(), "inflateEnd".to_string()],
            1.5,
            &quality,
            "int main() {\n  return 0;\n}\n",
        )
        .unwrap();

        let description = describe_seed(&text).unwrap();
        assert!(description.contains("id:           9\n"), "{description}");
        assert!(description.contains("combination:  [inflateInit_, inflateEnd]"));
        assert!(description.contains("branches:     2"));
        assert!(description.contains("density:      unknown"));
        assert!(description.contains("calls:        inflateInit_ -> inflateEnd"));
        assert!(description.contains("visited:      2"));
        assert!(description.contains("body:         3 lines"));

        assert!(describe_seed("int main() { return 0; }").is_err());
    }
}

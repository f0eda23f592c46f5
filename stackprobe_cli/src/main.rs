use stackprobe_core::config::StackprobeConfig;
use stackprobe_core::matrix::Orchestrator;
use stackprobe_core::report::aggregate;
use stackprobe_core::search::Boundary;

use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Override the worker pool size from the config.
    #[clap(short, long)]
    workers: Option<usize>,
    /// Override the per-execution timeout in milliseconds.
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// Override the upper end of the searched magnitude range.
    #[clap(long)]
    max_magnitude: Option<u32>,
    /// Where to write the JSON report.
    #[clap(short, long, default_value = "report.json")]
    report: PathBuf,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let mut config = match cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            StackprobeConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("stackprobe.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}",
                );
                StackprobeConfig::load_from_file(&default_config_path)?
            } else {
                anyhow::bail!(
                    "no config file specified and default 'stackprobe.toml' not found; \
                     a config with [[compilers]] and [[seeds]] is required"
                );
            }
        }
    };

    if let Some(workers) = cli.workers {
        config.matrix.get_or_insert_with(Default::default).workers = workers;
    }
    if let Some(max_magnitude) = cli.max_magnitude {
        config
            .matrix
            .get_or_insert_with(Default::default)
            .max_magnitude = max_magnitude;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config
            .sandbox
            .get_or_insert_with(Default::default)
            .timeout_ms = timeout_ms;
    }

    let variants = config.seed_variants();
    let build_configs = config.build_configs();
    println!(
        "Probing {} seed variant(s) across {} build configuration(s)...",
        variants.len(),
        build_configs.len()
    );

    let start_time = Instant::now();
    let orchestrator = Orchestrator::new(config.matrix_settings(), config.sandbox_config());
    let findings = orchestrator.run(&variants, &build_configs)?;
    let report = aggregate(findings);
    let elapsed = start_time.elapsed();

    for finding in &report.findings {
        println!(
            "  {} [{} / {}] -> {:?} (detection: {}, bypass: {})",
            finding.variant_id,
            finding.pattern,
            finding.protection,
            finding.verdict,
            describe_boundary(&finding.detection),
            describe_boundary(&finding.bypass),
        );
        if let Some(anomaly) = &finding.anomaly {
            eprintln!(
                "    anomaly: severity inverted between magnitudes {} and {}",
                anomaly.lower.magnitude, anomaly.upper.magnitude
            );
        }
    }

    if report.signatures.is_empty() {
        println!("\nNo bypass signatures found.");
    } else {
        println!("\n!!! {} BYPASS SIGNATURE(S) !!!", report.signatures.len());
        for sig in &report.signatures {
            println!(
                "  {} evades {} on {} (allocation strategy: {}, reference: {})",
                sig.implicated, sig.protection, sig.arch, sig.allocation_strategy, sig.reference_variant
            );
        }
    }

    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(&cli.report, json)
        .map_err(|e| anyhow::anyhow!("Failed to write report to {:?}: {}", cli.report, e))?;
    println!(
        "\nMatrix finished in {elapsed:.2?}. Report written to {:?}.",
        cli.report
    );

    Ok(())
}

fn describe_boundary(boundary: &Boundary) -> String {
    match boundary {
        Boundary::At(magnitude) => magnitude.to_string(),
        Boundary::Undetermined(reason) => format!("undetermined ({reason:?})"),
    }
}

//! pgl-extractor - main entry point

use anyhow::{Context, Result};
use clap::Parser;
use pgl_common::logging::{init_logging, LogConfig, LogLevel};
use pgl_extractor::model::TableRef;
use pgl_extractor::{ExitStatus, LiveConnector, Orchestrator, RunConfig, RunReport, TypeDictionary};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Extract SQL Server tables to Parquet and upload them to each tenant's storage
#[derive(Parser, Debug)]
#[command(name = "pgl-extractor", version, about, long_about = None)]
struct Cli {
    /// Run configuration (TOML)
    #[arg(short, long, env = "PGL_CONFIG", default_value = "config/pgl.toml")]
    config: PathBuf,

    /// Type dictionary (JSON); overrides run.dictionary_path
    #[arg(short, long)]
    dictionary: Option<PathBuf>,

    /// Only run these tenants (repeatable)
    #[arg(long = "tenant", value_name = "NAME")]
    tenants: Vec<String>,

    /// Only run these tables, as `schema.table` (repeatable)
    #[arg(long = "table", value_name = "TABLE")]
    tables: Vec<TableRef>,

    /// Write the JSON run report here; overrides run.report_path
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let defaults = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .log_file_prefix("pgl-extractor")
        .build();
    let log_config = defaults.merge_env().unwrap_or_else(|e| {
        eprintln!("Ignoring invalid LOG_* setting: {}", e);
        LogConfig::default()
    });
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging disabled: {}", e);
            None
        },
    };

    match run(cli).await {
        Ok(status) => status.into(),
        Err(e) => {
            error!(error = %e, "Run failed");
            eprintln!("Error: {:#}", e);
            ExitStatus::Fatal.into()
        },
    }
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let mut config = RunConfig::load(&cli.config).context("Failed to load configuration")?;
    config
        .select_tenants(&cli.tenants)
        .context("Invalid --tenant filter")?;

    let dictionary_path = cli.dictionary.unwrap_or_else(|| config.run.dictionary_path.clone());
    let dictionary = TypeDictionary::from_path(&dictionary_path)
        .with_context(|| format!("Failed to load type dictionary {}", dictionary_path.display()))?;
    info!(
        "Loaded {} type mappings from {}",
        dictionary.len(),
        dictionary_path.display()
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let orchestrator = Orchestrator::new(config.run.clone(), Arc::new(dictionary), Arc::new(LiveConnector))
        .with_cancellation(cancel)
        .with_table_filter(cli.tables);

    let report = orchestrator.run(&config.tenants).await;
    report.log_summary();

    if let Some(path) = cli.report.or_else(|| config.run.report_path.clone()) {
        write_report(&report, &path)?;
        info!("Run report written to {}", path.display());
    }

    print_summary(&report);
    Ok(report.exit_status())
}

fn write_report(report: &RunReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!();
    println!("{:<24} {:<10} {:>7} {:>12}", "TENANT", "STATUS", "TABLES", "ROWS");
    for tenant in &report.tenants {
        let rows: u64 = tenant.tables.iter().map(|t| t.rows_written).sum();
        println!(
            "{:<24} {:<10} {:>7} {:>12}",
            tenant.tenant,
            format!("{:?}", tenant.status).to_lowercase(),
            format!(
                "{}/{}",
                tenant.tables.iter().filter(|t| t.is_completed()).count(),
                tenant.tables.len()
            ),
            rows
        );
    }

    let retry = report.failed_subset();
    if !retry.is_empty() {
        println!();
        println!("To retry:");
        for failed in retry {
            if failed.tables.is_empty() {
                println!("  --tenant {}", failed.tenant);
            } else {
                let tables: Vec<String> = failed.tables.iter().map(|t| format!("--table {}", t)).collect();
                println!("  --tenant {} {}", failed.tenant, tables.join(" "));
            }
        }
    }
}

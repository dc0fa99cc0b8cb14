use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;

use qcflow_audit::{AuditReport, audit};
use qcflow_observability::LogFormat;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

/// Check that every write goes through the publish use case.
#[derive(Parser, Debug)]
#[command(name = "qcflow-audit")]
#[command(about = "Static conformance check for the qcflow event write protocol")]
struct Args {
    /// Workspace root to scan
    #[arg(default_value = ".")]
    root: PathBuf,

    /// Config file (default: <root>/qcflow-audit.toml when present)
    #[arg(long, env = "QCFLOW_AUDIT_CONFIG")]
    config: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,
}

fn render(report: &AuditReport, format: Format) -> anyhow::Result<String> {
    Ok(match format {
        Format::Text => report.to_text(),
        Format::Json => report.to_json().context("failed to serialize report")?,
    })
}

fn run(args: &Args) -> anyhow::Result<bool> {
    let report = audit(&args.root, args.config.as_deref())
        .with_context(|| format!("audit of {} failed", args.root.display()))?;
    info!(
        files = report.files_scanned,
        violations = report.violations.len(),
        "audit finished"
    );
    print!("{}", render(&report, args.format)?);
    Ok(report.is_clean())
}

fn main() -> ExitCode {
    qcflow_observability::init_with(LogFormat::Compact);
    let args = Args::parse();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

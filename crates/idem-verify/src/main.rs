use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use idem_verify::{Report, VerifyOptions, verify};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "idem-verify",
    version,
    about = "Check that every registered mutation is served through a route gate"
)]
struct Cli {
    /// Mutation manifest (JSON)
    #[arg(long, env = "IDEM_MANIFEST")]
    manifest: PathBuf,

    /// Source tree to scan
    #[arg(long, env = "IDEM_SOURCE_ROOT", default_value = ".")]
    root: PathBuf,

    /// File extensions to scan (comma-separated)
    #[arg(long = "ext", value_delimiter = ',', default_values = ["rs", "ts", "tsx", "js", "py"])]
    extensions: Vec<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    setup_logging();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(report) if report.is_clean() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(err) => {
            eprintln!("idem-verify: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli) -> Result<Report> {
    let options = VerifyOptions {
        manifest: cli.manifest.clone(),
        root: cli.root.clone(),
        extensions: cli.extensions.clone(),
    };
    let report = verify(&options)
        .with_context(|| format!("verify {}", cli.root.display()))?;
    match cli.format {
        Format::Text => {
            for violation in &report.violations {
                println!("{violation}");
            }
            eprintln!(
                "{} registered operation(s), {} gated call site(s), {} violation(s)",
                report.registered,
                report.call_sites,
                report.violations.len()
            );
        }
        Format::Json => {
            let text = serde_json::to_string_pretty(&report.to_json()).context("encode report")?;
            println!("{text}");
        }
    }
    Ok(report)
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

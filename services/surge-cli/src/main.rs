use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use surge_core::{metrics, Config, ConfigError, Profile, ReportFormat};
use surge_engine::{EngineError, LoadRun};

mod telemetry;

use telemetry::init_logging;

/// Every threshold passed.
const EXIT_PASSED: u8 = 0;
/// At least one threshold failed, or the run could not finish.
const EXIT_FAILED: u8 = 1;
/// The configuration could not be loaded or is invalid.
const EXIT_CONFIG: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "surge")]
#[command(about = "Virtual-user HTTP load generator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a load test and print the summary
    Run {
        /// Built-in profile to run (load, spike, stress)
        #[arg(long, conflicts_with = "config")]
        profile: Option<Profile>,

        /// TOML config file (defaults to ./surge.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Base URL of the system under test
        #[arg(long)]
        base_url: Option<String>,

        /// Write the full report to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Report format (markdown or json)
        #[arg(long)]
        format: Option<ReportFormat>,

        /// Write the Prometheus text exposition to this file
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },

    /// Parse and validate a config file without sending any traffic
    Validate {
        /// TOML config file
        #[arg(long)]
        config: PathBuf,
    },

    /// Write a TOML template for a built-in profile
    GenerateConfig {
        /// Profile to start from
        #[arg(long, default_value = "load")]
        profile: Profile,

        /// Output file (prints to stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            profile,
            config,
            base_url,
            report,
            format,
            metrics_out,
        } => {
            let mut config = match resolve_config(profile, config.as_deref()) {
                Ok(config) => config,
                Err(e) => return config_failure(&e),
            };
            if let Some(base_url) = base_url {
                config.run.base_url = base_url;
            }
            if report.is_some() {
                config.report.path = report;
            }
            if let Some(format) = format {
                config.report.format = format;
            }
            if metrics_out.is_some() {
                config.report.metrics_path = metrics_out;
            }

            if let Err(e) = init_logging(&config.logging) {
                eprintln!("⚠️  Logging disabled: {e}");
            }

            match run(config).await {
                Ok(code) => code,
                Err(e) if is_config_error(&e) => config_failure(&e),
                Err(e) => {
                    eprintln!("❌ Run failed: {e:#}");
                    ExitCode::from(EXIT_FAILED)
                }
            }
        }

        Commands::Validate { config } => match validate(&config) {
            Ok(config) => {
                println!(
                    "✅ {} is valid: {} stages over {:?}, {} steps, {} thresholds",
                    config_label(&config),
                    config.stages.len(),
                    config.schedule().map(|s| s.total_duration()).unwrap_or_default(),
                    config.steps.len(),
                    config.thresholds.values().map(Vec::len).sum::<usize>()
                );
                ExitCode::from(EXIT_PASSED)
            }
            Err(e) => config_failure(&e),
        },

        Commands::GenerateConfig { profile, output } => {
            match generate_config(profile, output.as_deref()) {
                Ok(()) => ExitCode::from(EXIT_PASSED),
                Err(e) => {
                    eprintln!("❌ {e:#}");
                    ExitCode::from(EXIT_FAILED)
                }
            }
        }
    }
}

/// A built-in profile when named, otherwise the config file lookup.
fn resolve_config(profile: Option<Profile>, path: Option<&Path>) -> Result<Config, ConfigError> {
    match profile {
        Some(profile) => {
            let mut config = profile.config();
            config.apply_env_overrides();
            Ok(config)
        }
        None => Config::load(path),
    }
}

fn validate(path: &Path) -> Result<Config, ConfigError> {
    let mut config = Config::from_file(path)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

async fn run(config: Config) -> anyhow::Result<ExitCode> {
    let report_config = config.report.clone();
    let load_run = LoadRun::new(config)?;

    let cancel = load_run.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, stopping virtual users");
            cancel.cancel();
        }
    });

    let report = load_run.run().await?;
    println!("{}", report.console_summary());

    if let Some(path) = &report_config.path {
        report
            .write(path, report_config.format)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        println!("📄 Report written to {}", path.display());
    }

    if let Some(path) = &report_config.metrics_path {
        let exposition = metrics::export_prometheus()?;
        std::fs::write(path, exposition)
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
        println!("📈 Metrics written to {}", path.display());
    }

    Ok(if report.passed() {
        ExitCode::from(EXIT_PASSED)
    } else {
        ExitCode::from(EXIT_FAILED)
    })
}

fn generate_config(profile: Profile, output: Option<&Path>) -> anyhow::Result<()> {
    let toml = profile.config().to_toml()?;
    match output {
        Some(path) => {
            std::fs::write(path, toml)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("✅ Wrote {profile} profile to {}", path.display());
        }
        None => print!("{toml}"),
    }
    Ok(())
}

fn is_config_error(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<EngineError>(),
        Some(EngineError::Config(_) | EngineError::Definition(_))
    ) || e.downcast_ref::<ConfigError>().is_some()
}

fn config_failure(e: &dyn std::fmt::Display) -> ExitCode {
    eprintln!("❌ Invalid configuration: {e}");
    ExitCode::from(EXIT_CONFIG)
}

fn config_label(config: &Config) -> String {
    format!("`{}` ({})", config.run.name, config.run.base_url)
}

//! StratForge - main entry point
//!
//! This binary provides two subcommands:
//! - run: Back-test every discovered plugin against its configured data
//! - validate: Parse and validate a plugin manifest

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "stratforge")]
#[command(about = "Plugin-driven deterministic backtesting engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run backtests for discovered plugins
    Run {
        /// Directory containing one subdirectory per plugin, each with
        /// a manifest.json
        #[arg(short, long, default_value = "plugins")]
        plugins: String,

        /// Directory containing {SYMBOL}_{timeframe}.csv bar data
        #[arg(short, long, default_value = "data")]
        data: String,

        /// Only run the named plugin
        #[arg(long)]
        plugin: Option<String>,

        /// Also run the configured Monte Carlo batch per plugin
        #[arg(long)]
        monte_carlo: bool,
    },

    /// Validate a plugin manifest
    Validate {
        /// Path to the manifest.json to check
        #[arg(short, long)]
        manifest: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Validate { .. } => "validate",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run {
            plugins,
            data,
            plugin,
            monte_carlo,
        } => commands::backtest::run(plugins, data, plugin, monte_carlo),

        Commands::Validate { manifest } => commands::validate::run(manifest),
    }
}

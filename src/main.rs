//! Nitrate - cache maintenance CLI
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use nitrate::cli::{Cli, Commands};
use nitrate::config::ConfigManager;
use nitrate::error::NitrateResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the log filter
const LOG_ENV: &str = "NITRATE_LOG";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> NitrateResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };
    let config = config_manager.load().await?;

    // Initialize logging: 0 = warn, 1 = info, 2+ = debug; NITRATE_LOG wins
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| match cli.verbose {
        0 => EnvFilter::new("nitrate=warn"),
        1 => EnvFilter::new("nitrate=info"),
        _ => EnvFilter::new("nitrate=debug"),
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.general.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }
    debug!("Config: {}", config_manager.path().display());

    // Dispatch to command
    match cli.command {
        Commands::Config(args) => {
            nitrate::cli::commands::config(args, &config_manager, &config).await
        }
        Commands::Cache(args) => nitrate::cli::commands::cache(args, &config),
    }
}

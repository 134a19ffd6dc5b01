//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Nitrate - object cache for the Nitrate test case management API
///
/// Inspects and maintains the persistent cache file shared by Nitrate
/// clients on this machine.
#[derive(Parser, Debug)]
#[command(name = "nitrate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "NITRATE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show or edit configuration
    Config(ConfigArgs),

    /// Inspect and maintain the persistent cache file
    Cache(CacheArgs),
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., cache.level, expiration.classes.TestRun)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Output format for cache show
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one class per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Print the cache file path
    Path,

    /// Summarize the cache file contents
    Show {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Drop expired entries from the cache file
    Sweep {
        /// Report what would be removed without rewriting the file
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete the cache file
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cache_show() {
        let cli = Cli::parse_from(["nitrate", "cache", "show", "--format", "json"]);
        match cli.command {
            Commands::Cache(CacheArgs {
                action: CacheAction::Show { format },
            }) => assert!(matches!(format, OutputFormat::Json)),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn parse_global_flags() {
        let cli = Cli::parse_from(["nitrate", "-vv", "cache", "clear", "--yes", "-c", "/tmp/n.toml"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/n.toml")));
        assert!(matches!(
            cli.command,
            Commands::Cache(CacheArgs {
                action: CacheAction::Clear { yes: true }
            })
        ));
    }

    #[test]
    fn config_action_is_optional() {
        let cli = Cli::parse_from(["nitrate", "config"]);
        assert!(matches!(cli.command, Commands::Config(ConfigArgs { action: None })));
    }
}

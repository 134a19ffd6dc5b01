//! Config command - show or edit configuration

use crate::cache::Expiration;
use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::entity::EntityClass;
use crate::error::{NitrateError, NitrateResult};
use console::style;
use std::path::PathBuf;

/// Execute the config command
pub async fn execute(args: ConfigArgs, manager: &ConfigManager, config: &Config) -> NitrateResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config),
        Some(ConfigAction::Path) => show_path(manager),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => set_value(manager, &key, &value).await?,
    }

    Ok(())
}

fn show_config(config: &Config) {
    let toml =
        toml::to_string_pretty(config).unwrap_or_else(|_| "Error serializing config".to_string());
    println!("{}", toml);
}

fn show_path(manager: &ConfigManager) {
    println!("{}", manager.path().display());
}

async fn init_config(manager: &ConfigManager, force: bool) -> NitrateResult<()> {
    let path = manager.path();

    if path.exists() && !force {
        println!(
            "{} Config already exists at {}",
            style("!").yellow(),
            path.display()
        );
        println!("  Use --force to overwrite");
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    println!(
        "{} Configuration initialized at {}",
        style("✓").green(),
        path.display()
    );

    Ok(())
}

/// Change one key in the file; environment overrides are not written back
async fn set_value(manager: &ConfigManager, key: &str, value: &str) -> NitrateResult<()> {
    let mut config = manager.load_saved().await?;
    apply_value(&mut config, key, value)?;
    config
        .validate()
        .map_err(|reason| NitrateError::ConfigInvalid {
            path: manager.path().to_path_buf(),
            reason,
        })?;

    manager.save(&config).await?;
    println!("{} Set {} = {}", style("✓").green(), key, value);

    Ok(())
}

/// Apply one dot-separated key to `config`
fn apply_value(config: &mut Config, key: &str, value: &str) -> NitrateResult<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["general", "log_format"] => config.general.log_format = value.to_string(),
        ["cache", "level"] => config.cache.level = value.parse()?,
        ["cache", "file"] => {
            config.cache.file = (!value.is_empty()).then(|| PathBuf::from(value));
        }
        ["batch", "max_calls"] => config.batch.max_calls = parse_number(value)?,
        ["rpc", "timeout_secs"] => config.rpc.timeout_secs = parse_number(value)?,
        ["expiration", "default"] => config.expiration.default = parse_expiration(value)?,
        ["expiration", "immutable"] => config.expiration.immutable = parse_expiration(value)?,
        ["expiration", "classes", class] => {
            if EntityClass::from_name(class).is_none() {
                return Err(NitrateError::usage(format!("Unknown entity class: {}", class)));
            }
            config
                .expiration
                .classes
                .insert((*class).to_string(), parse_expiration(value)?);
        }
        _ => {
            eprintln!("Valid keys:");
            print_valid_keys();
            return Err(NitrateError::usage(format!("Unknown config key: {}", key)));
        }
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(value: &str) -> NitrateResult<T> {
    value
        .parse()
        .map_err(|_| NitrateError::usage(format!("Invalid number: {}", value)))
}

fn parse_expiration(value: &str) -> NitrateResult<Expiration> {
    value.parse()
}

fn print_valid_keys() {
    let keys = [
        "general.log_format",
        "cache.level",
        "cache.file",
        "batch.max_calls",
        "rpc.timeout_secs",
        "expiration.default",
        "expiration.immutable",
        "expiration.classes.<Class>",
    ];

    for key in keys {
        eprintln!("  {}", key);
    }
}

//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use quizduel_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "server_url": config.server_url,
                    "api_url": config.api_url,
                    "data_dir": config.data_dir,
                    "credentials_file": config.credentials_path(),
                    "connect_timeout_secs": config.connect_timeout_secs,
                    "max_retries": config.max_retries,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.server_url);
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  server_url:           {}", config.server_url);
            println!(
                "  api_url:              {}",
                config.api_url.as_deref().unwrap_or("(not set)")
            );
            println!("  data_dir:             {}", config.data_dir.display());
            println!(
                "  credentials_file:     {}",
                config.credentials_path().display()
            );
            println!("  connect_timeout_secs: {}", config.connect_timeout_secs);
            println!("  max_retries:          {}", config.max_retries);
            println!(
                "  log_file:             {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "server_url" => {
            if value.is_empty() {
                bail!("server_url cannot be empty");
            }
            config.server_url = value.to_string();
        }
        "api_url" => {
            config.api_url = optional(value);
        }
        "data_dir" => {
            config.data_dir = value.into();
        }
        "credentials_file" => {
            config.credentials_file = optional(value).map(PathBuf::from);
        }
        "connect_timeout_secs" => {
            config.connect_timeout_secs = value
                .parse()
                .context("Invalid value for connect_timeout_secs. Use a whole number of seconds.")?;
        }
        "max_retries" => {
            config.max_retries = value
                .parse()
                .context("Invalid value for max_retries. Use a non-negative number.")?;
        }
        "log_file" => {
            config.log_file = optional(value).map(PathBuf::from);
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: server_url, api_url, data_dir, credentials_file, \
                 connect_timeout_secs, max_retries, log_file",
                key
            );
        }
    }
    Ok(())
}

/// Empty or "none" clears an optional setting
fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

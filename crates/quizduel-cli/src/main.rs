//! QuizDuel CLI
//!
//! Command-line client for live quiz duels and the quick match queue.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use quizduel_core::{Config, DuelId, UserId};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "quizduel")]
#[command(about = "QuizDuel - Live two-player quiz duels")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use a specific config file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a duel and play it
    #[command(alias = "play")]
    Duel {
        /// Duel ID
        duel_id: DuelId,
        /// Signal ready as soon as the room is joined
        #[arg(long)]
        ready: bool,
    },
    /// Queue for a quick match on a course
    Queue {
        /// Course ID
        course_id: i64,
        /// Signal ready as soon as the matched room is joined
        #[arg(long)]
        ready: bool,
    },
    /// Store credentials for the duel server
    Login {
        /// Numeric user ID
        #[arg(long)]
        user_id: UserId,
        /// Auth token
        #[arg(long)]
        token: String,
    },
    /// Remove stored credentials
    Logout,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show connection settings and credential status
    Status,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (server_url, api_url, max_retries, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands work on the file directly, even when it is invalid
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), cli.config.as_ref(), &output);
    }

    let config =
        Config::load_with_cli_override(cli.config.as_ref()).context("Failed to load configuration")?;
    init_logging(&config);

    match cli.command {
        Commands::Duel { duel_id, ready } => {
            commands::duel::run(&config, duel_id, ready, &output).await
        }
        Commands::Queue { course_id, ready } => {
            commands::queue::run(&config, course_id, ready, &output).await
        }
        Commands::Login { user_id, token } => {
            commands::login::login(&config, user_id, token, &output).await
        }
        Commands::Logout => commands::login::logout(&config, &output).await,
        Commands::Status => commands::status::show(&config, &output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Initialize logging when QUIZDUEL_LOG is set
///
/// Logs go to `log_file` when configured, otherwise to stderr so stdout
/// stays free for the duel display.
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("QUIZDUEL_LOG") else {
        return;
    };

    let env_filter = EnvFilter::new(format!(
        "quizduel_core={},quizduel={}",
        log_level, log_level
    ));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Ignore the error if a subscriber is already installed
    let Some(log_path) = &config.log_file else {
        let _ = subscriber.with_writer(std::io::stderr).try_init();
        return;
    };

    if let Some(parent) = log_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("Warning: Could not create log directory {:?}: {}", parent, e);
            return;
        }
    }

    let log_file = match File::create(log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not create log file {:?}: {}", log_path, e);
            return;
        }
    };

    let _ = subscriber
        .with_ansi(false)
        .with_writer(log_file)
        .try_init();

    info!("Logging initialized to {:?}", log_path);
}

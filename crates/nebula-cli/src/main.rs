//! Nebula plugin runtime - operator command line.
//!
//! Loads the layered configuration, sets up logging and drives a
//! [`nebula_plugins::PluginManager`] for one command.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod commands;
mod config_bridge;
mod theme;

use commands::OutputFormat;
use commands::plugins::InvokeArgs;
use theme::Theme;

/// Nebula plugin runtime manager
#[derive(Parser)]
#[command(name = "nebula-plugins")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file layered over the system file
    #[arg(short, long, global = true, env = "NEBULA_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format: pretty (default) or json
    #[arg(long, global = true, default_value = "pretty")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the manager and supervise plugins until Ctrl-C
    Run,

    /// Validate plugin manifests without starting anything
    Scan {
        /// Directory to scan (defaults to plugins.scan_path)
        dir: Option<PathBuf>,
    },

    /// List loaded plugins and their state
    List,

    /// Probe a plugin's health
    Health {
        /// Plugin name
        name: String,
    },

    /// Call a plugin method
    Invoke {
        /// Plugin name
        name: String,
        /// Method, e.g. `sync_users`
        method: String,
        /// JSON object passed as the payload
        #[arg(long)]
        payload: Option<String>,
        /// Report intended writes without performing them
        #[arg(long)]
        dry_run: bool,
        /// Item limit handed to the plugin
        #[arg(long)]
        limit: Option<u64>,
        /// Call timeout in seconds
        #[arg(long)]
        timeout: Option<f64>,
    },

    /// Show the tail of a plugin's log
    Logs {
        /// Plugin name
        name: String,
        /// Number of lines
        #[arg(long)]
        tail: Option<usize>,
    },

    /// Show process and resource usage of a plugin
    Stats {
        /// Plugin name
        name: String,
    },

    /// View configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the resolved configuration and where each value came from
    Show,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", Theme::error(&format!("{e:#}")));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let resolved = nebula_config::Config::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    let mut log_config = config_bridge::to_log_config(&resolved.config);
    if cli.verbose {
        "debug".clone_into(&mut log_config.level);
    }
    if let Err(e) = nebula_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let format = match cli.format.as_str() {
        "json" => OutputFormat::Json,
        _ => OutputFormat::Pretty,
    };

    let manager_config = || config_bridge::to_manager_config(&resolved.config);
    match cli.command {
        Commands::Run => commands::plugins::run(manager_config()?).await,
        Commands::Scan { dir } => {
            commands::plugins::scan(&manager_config()?, dir.as_deref(), format)
        },
        Commands::List => commands::plugins::list(manager_config()?, format).await,
        Commands::Health { name } => {
            commands::plugins::health(manager_config()?, name, format).await
        },
        Commands::Invoke {
            name,
            method,
            payload,
            dry_run,
            limit,
            timeout,
        } => {
            commands::plugins::invoke(manager_config()?, InvokeArgs {
                name,
                method,
                payload,
                dry_run,
                limit,
                timeout,
            })
            .await
        },
        Commands::Logs { name, tail } => {
            commands::plugins::logs(manager_config()?, name, tail).await
        },
        Commands::Stats { name } => {
            commands::plugins::stats(manager_config()?, name, format).await
        },
        Commands::Config {
            command: ConfigCommands::Show,
        } => commands::config::show(&resolved, format),
    }
}

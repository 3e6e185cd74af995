//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use gamehud_core::{config, logging};

mod commands;

#[derive(Parser)]
#[command(name = "gamehud")]
#[command(version)]
#[command(about = "On-device performance telemetry for games")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Mirror logs to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Start sampling and print every snapshot
    Run {
        /// Override the sampling interval from config
        #[arg(long, value_name = "MS")]
        interval_ms: Option<u64>,

        /// Stop after this many snapshots
        #[arg(long, value_name = "N")]
        ticks: Option<u64>,

        /// Print one JSON object per snapshot
        #[arg(long)]
        json: bool,
    },
    /// Check whether the privileged shell can be opened
    Probe,
    /// List compositor layers and show which one would be tracked
    Layers,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
    /// Generate a fresh config from Rust defaults
    Generate,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = match logging::init(cli.verbose) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("Logging disabled: {err:#}");
            None
        }
    };

    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

fn load_config() -> Result<config::Config> {
    config::Config::load().context("load config")
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            interval_ms,
            ticks,
            json,
        } => {
            let options = commands::run::RunOptions {
                interval_ms,
                ticks,
                json,
            };
            commands::run::run(load_config()?, options).await
        }
        Commands::Probe => commands::probe::run(&load_config()?).await,
        Commands::Layers => commands::layers::run(&load_config()?).await,

        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
            ConfigCommands::Generate => commands::config::generate(),
        },
    }
}

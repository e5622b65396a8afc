//! cipherscope - network inspector that pairs wire traffic with in-page plaintext

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod config;

use cli::{cmd_info, cmd_watch, WatchArgs};
use config::{default_config_path, load_config};

/// Inspect a page's network traffic next to its plaintext and decrypted bodies
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug mode
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to a page and watch its traffic
    Watch(WatchArgs),
    /// Show version and resolved configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.debug)?;
    info!("Starting cipherscope v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Watch(args) => cmd_watch(args, config).await,
        Commands::Info => {
            let path = match cli.config {
                Some(path) => path,
                None => default_config_path()?,
            };
            cmd_info(&config, &path).await
        }
    }
}

fn init_logging(level: &str, debug: bool) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        level.parse().context("Invalid log level")?
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

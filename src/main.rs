//! NovaPM - process supervision daemon
//!
//! Supervises long-running child programs, restarts them on failure,
//! samples per-process metrics, aggregates log streams, runs periodic
//! health probes, and (in multi-host mode) coordinates a fleet of daemons
//! through a central controller.

use anyhow::Result;
use clap::Parser;
use tracing::error;

mod cmd;

#[derive(Parser)]
#[command(name = "novapm")]
#[command(about = "Process supervision daemon with fleet orchestration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("novapm={}", log_level).into()),
        )
        .init();

    match cli.command {
        Some(cmd::Commands::Controller) => {
            cmd::controller::run(cli.config.as_deref()).await?;
        }
        Some(cmd::Commands::Diagnostics) => {
            cmd::diagnostics::run(cli.config.as_deref()).await?;
        }
        Some(cmd::Commands::Daemon) | None => {
            if let Err(e) = cmd::root::run(cli.config.as_deref()).await {
                error!("Daemon error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

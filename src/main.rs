use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::info;

use plugin_host::{commands, config, logging};

#[derive(Parser, Debug)]
#[command(name = "plugin-host")]
#[command(about = "Supervise out-of-process plugins and broker their services", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Supervise all enabled plugins until interrupted (default)
    Run,
    /// Validate configuration and launch each plugin once
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load_from_path(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => config::load_from_env_or_file().context("failed to load configuration")?,
    };

    let _guard = logging::init(&config.logging, args.debug)?;
    match &args.config {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("Configuration loaded from default locations"),
    }

    match args.command.unwrap_or(Command::Run) {
        Command::Check => commands::run_config_check(config).await?,
        Command::Run => {
            info!("Starting plugin host");
            info!("Loaded {} plugin configurations", config.plugins.len());
            commands::run_plugins(config, shutdown_signal()).await?;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

//! Sorter daemon
//!
//! Listens for robot telemetry, keeps the colour inventory, and takes operator
//! commands on stdin. Logs go to stderr; report events are printed to stdout
//! as one JSON object per line.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use sortd::{output_event, run_console, SorterConfig, SorterService, Started};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config/default_config.yaml";

#[derive(Parser)]
#[command(name = "sortd")]
#[command(about = "Colour sorter daemon - robot telemetry, inventory and sort sequencing")]
#[command(version)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    /// Explicit path if one was given, otherwise `SORTD_CONFIG_PATH`
    fn config_path(&self) -> Option<PathBuf> {
        self.config
            .clone()
            .or_else(|| std::env::var_os("SORTD_CONFIG_PATH").map(PathBuf::from))
    }
}

fn load_config(args: &Args) -> Result<SorterConfig> {
    if let Some(path) = args.config_path() {
        info!("Using config: {}", path.display());
        return SorterConfig::load_from_path(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()));
    }

    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        info!("Using config: {}", default_path.display());
        SorterConfig::load_from_path(default_path).context("Failed to load default configuration")
    } else {
        warn!("{} not found, using built-in defaults", DEFAULT_CONFIG_PATH);
        Ok(SorterConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    info!("Colour sorter daemon");
    info!("{}", "=".repeat(50));

    let config = load_config(&args)?;
    info!(
        "Robot {}:{}, telemetry port {}, {} sequence steps",
        config.robot.host,
        config.robot.command_port,
        config.telemetry.port,
        config.sequence.steps.len()
    );

    let Started { service, mut reports } = SorterService::from_config(config).await.map_err(|e| {
        error!("Startup failed: {:#}", e);
        error!("Make sure the inventory file location is writable");
        e
    })?;

    if service.telemetry_addr().await.is_none() {
        warn!("Telemetry listener is down; free the port and use @listen to retry");
    }

    // Print report events until the service goes away
    let printer = tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(event) => output_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} report events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let console_result = run_console(&service).await;

    info!("Performing graceful shutdown");
    service.shutdown().await;
    drop(service);
    printer.abort();

    console_result.context("Console failed")?;
    info!("Shutdown complete");
    Ok(())
}

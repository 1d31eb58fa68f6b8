//! fleetd: the Fleetgrid daemon.
//!
//! # Usage
//!
//! ```text
//! fleetd --config /etc/fleetd/fleetd.toml
//! fleetd --listen 0.0.0.0:8080 --data-dir /var/lib/fleetd --catalog-dir ./apps
//! fleetd hash-token <TOKEN>
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleetd::{ControlPlane, FleetdConfig, LogFormat};

const DEFAULT_FILTER: &str = "info,fleetd=debug,fleetgrid=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleetgrid control plane daemon")]
struct Cli {
    /// Path to fleetd.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file).
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Data directory for persistent state.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory of app manifests.
    #[arg(long)]
    catalog_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (default).
    Run,
    /// Print the digest of an agent token for a `[[server]]` entry.
    HashToken { token: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Command::HashToken { token }) = &cli.command {
        println!("{}", fleetgrid_channel::hash_token(token));
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => FleetdConfig::from_file(path)?,
        None => FleetdConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(catalog_dir) = cli.catalog_dir {
        config.catalog_dir = catalog_dir;
    }

    init_tracing(config.log_format);
    info!(listen = %config.listen, data_dir = ?config.data_dir, "fleetd starting");

    let plane = ControlPlane::open(config)?;
    plane.run(shutdown_signal()).await?;

    info!("fleetd stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

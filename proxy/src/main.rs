//! pg-ssh-proxy
//!
//! Listens for PostgreSQL clients and forwards each one through an SSH tunnel
//! to the backend registered for the database it asks for.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use pg_ssh_proxy::source::HostFs;
use pg_ssh_proxy::{run_server, Registry, ServerState, TunnelDialer};

/// pg-ssh-proxy - route PostgreSQL connections through SSH jump hosts
#[derive(Parser, Debug)]
#[command(name = "pg-ssh-proxy", version, about)]
struct Cli {
    /// Listen address
    #[arg(short, long, default_value = "[::1]:5432")]
    listen: String,

    /// Path to the connections file (defaults to <config dir>/pg-ssh-proxy.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pg-ssh-proxy.toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let registry = Registry::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Starting pg-ssh-proxy");
    info!("  Config: {}", config_path.display());
    if registry.is_empty() {
        warn!("  No connections configured; every client will be refused");
    } else {
        info!("  Connections: {}", registry.names().join(", "));
    }

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;

    let server = Arc::new(ServerState {
        registry,
        dialer: TunnelDialer::new(Arc::new(HostFs)),
    });

    run_server(listener, server, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
}

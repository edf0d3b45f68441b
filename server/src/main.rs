//! redoubtd
//!
//! Serves harvest rounds for the policies and backends named in a YAML
//! configuration file.

use anyhow::Context;
use clap::Parser;
use redoubt_server::http::{self, AppState};
use redoubt_server::{Config, Harvester, Registry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "redoubtd", version, about = "Policy-driven provisioning server")]
struct Args {
    /// Path to the YAML configuration
    #[arg(short, long, env = "REDOUBT_CONFIG", default_value = "/etc/redoubt/redoubt.yaml")]
    config: PathBuf,

    /// Overrides `listen` from the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let harvester = Harvester::from_config(&config, &Registry::standard())
        .context("building policies")?;

    let state = Arc::new(AppState {
        harvester: Arc::new(harvester),
        request_timeout: config.request_timeout(),
    });

    let addr = args.listen.unwrap_or(config.listen);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, version = env!("CARGO_PKG_VERSION"), "redoubtd listening");

    http::serve(listener, state, shutdown_signal()).await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received CTRL+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

//! webrelay binary entry point.
//!
//! Usage:
//! ```bash
//! webrelay --config relay.toml
//! webrelay --help
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use webrelay::config::{Config, NetworkConfig, NetworkMode, StorageBackend, StorageConfig};
use webrelay::http::{self, health};
use webrelay::network::{IrohNetwork, MemoryNetwork, Network};
use webrelay::server::WebRelay;
use webrelay::storage::{MemoryStore, MessageStore, SqliteStore};

/// How often idle rate limiter entries are evicted.
const LIMITER_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Offline message relay for P2P pub/sub networks.
#[derive(Parser, Debug)]
#[command(name = "webrelay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "relay.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    tracing::info!("webrelay v{} starting", env!("CARGO_PKG_VERSION"));

    let store = open_store(&config.storage)
        .await
        .context("Failed to open message store")?;
    let (network, iroh) = open_network(&config.network)
        .await
        .context("Failed to start network")?;

    let relay = Arc::new(WebRelay::new(config.clone(), store, network));
    relay
        .resume_subscriptions()
        .await
        .context("Failed to resume stored subscriptions")?;
    let maintenance = relay
        .rate_limits()
        .spawn_maintenance(LIMITER_MAINTENANCE_INTERVAL);
    health::init_start_time();

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
    tracing::info!(
        "Listening on {} ({:?} auth)",
        listener.local_addr()?,
        config.auth.mode
    );

    let app = http::build_router(relay).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    maintenance.abort();
    if let Some(endpoint) = iroh {
        endpoint
            .shutdown()
            .await
            .context("Failed to shut down network endpoint")?;
    }
    tracing::info!("webrelay stopped");
    Ok(())
}

async fn open_store(config: &StorageConfig) -> webrelay::error::Result<Arc<dyn MessageStore>> {
    let store: Arc<dyn MessageStore> = match config.backend {
        StorageBackend::Sqlite => Arc::new(SqliteStore::new(&config.database).await?),
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory store; messages are lost on restart");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

/// Start the configured network. The iroh endpoint is also returned for shutdown.
async fn open_network(
    config: &NetworkConfig,
) -> webrelay::error::Result<(Arc<dyn Network>, Option<Arc<IrohNetwork>>)> {
    match config.mode {
        NetworkMode::Iroh => {
            let secret_key = config
                .secret_key_path
                .as_deref()
                .map(IrohNetwork::load_or_create_key)
                .transpose()?;
            let endpoint = Arc::new(IrohNetwork::bind(secret_key).await?);
            tracing::info!("Network peer id: {}", endpoint.peer_id());
            let network: Arc<dyn Network> = endpoint.clone();
            Ok((network, Some(endpoint)))
        }
        NetworkMode::Memory => {
            tracing::warn!("Using in-process network; no peers are reachable");
            let network: Arc<dyn Network> = Arc::new(MemoryNetwork::new());
            Ok((network, None))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use bridge_server::accounts::AccountRegistry;
use bridge_server::config::{AccountConfig, Config, Environment};
use bridge_server::dedup::DedupFilter;
use bridge_server::deferred::DeferredStore;
use bridge_server::http::{self, AppState};
use bridge_server::logging;
use bridge_server::router::EventRouter;
use ctrader_client::{Connector, TcpConnector};

fn connector_for(account: &AccountConfig) -> Arc<dyn Connector> {
    match account.environment {
        Environment::Demo => Arc::new(TcpConnector::demo()),
        Environment::Live => Arc::new(TcpConnector::live()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Determine config directory from CONFIG_DIR environment variable,
    // falling back to the executable's directory, then the current one.
    let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_string_lossy().into_owned()))
            .unwrap_or_else(|| ".".to_string())
    });
    let config_path = format!("{}/config.toml", config_dir);

    // Configuration errors are fatal; log before tracing is up.
    eprintln!("Loading configuration from {}", config_path);
    let config = Config::from_file(&config_path)
        .with_context(|| format!("cannot start without a valid {}", config_path))?;

    logging::init(&config.logging);

    tracing::info!("Starting MT5 -> cTrader copy bridge");
    if config.logging.enabled {
        tracing::info!(
            "File logging enabled: directory={}, prefix={}, rotation={}",
            config.logging.directory,
            config.logging.file_prefix,
            config.logging.rotation
        );
    }

    let enabled: Vec<_> = config.enabled_accounts().collect();
    if enabled.is_empty() {
        bail!("no enabled accounts configured");
    }
    tracing::info!("Found {} enabled account(s):", enabled.len());
    for account in &enabled {
        tracing::info!(
            "  - {}: account id {} ({:?})",
            account.name,
            account.account_id,
            account.environment
        );
    }

    let deferred = Arc::new(DeferredStore::new());
    let registry = Arc::new(AccountRegistry::start(
        &config,
        deferred.clone(),
        connector_for,
    ));

    let state = AppState {
        router: Arc::new(EventRouter::new(registry.clone(), deferred)),
        dedup: Arc::new(DedupFilter::default()),
        registry: registry.clone(),
    };
    let app = http::create_router(state);

    let address = config.server_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {}", address))?;
    tracing::info!("HTTP server listening on {}", address);
    tracing::info!("Waiting for trade events from the MT5 EA...");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    Ok(())
}

async fn shutdown_signal(registry: Arc<AccountRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("Shutting down bridge server...");
    registry.close_all().await;
}

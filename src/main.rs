use anyhow::Context;
use dotenvy::dotenv;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

use affiliate_backend::api::{router, shutdown_signal};
use affiliate_backend::core::logging::init_logging;
use affiliate_backend::core::shared::utils::{create_conn, run_migrations};
use affiliate_backend::{AppConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    init_logging(&config.logging);
    info!(
        "Starting affiliate-backend {} ({})",
        env!("CARGO_PKG_VERSION"),
        config.environment
    );

    let pool = create_conn(&config.database.url, config.database.pool_size)
        .context("Failed to create database pool")?;
    run_migrations(&pool).map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid listen address")?;
    let state = Arc::new(AppState::build(config, pool)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweepers = state.sweepers().spawn(shutdown_rx);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {}: {}", addr, e);
        e
    })?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in sweepers {
        if let Err(e) = handle.await {
            error!("Sweeper task ended abnormally: {}", e);
        }
    }
    info!("Shutdown complete");
    Ok(())
}

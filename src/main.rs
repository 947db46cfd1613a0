use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use deposit_tracker::api::{build_router, AppState};
use deposit_tracker::config::load_config;
use deposit_tracker::coordinator::Coordinator;
use deposit_tracker::storage::PgStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .init();

    let storage = PgStorage::connect(&config.database_url).await?;

    let coordinator = Coordinator::start(&config, storage.clone()).await?;
    info!(monitors = coordinator.monitor_count(), "deposit tracker started");

    let state = AppState {
        config: Arc::new(config.clone()),
        storage,
    };
    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, build_router(state)).await {
            error!("http server error: {e}");
        }
    });

    signal::ctrl_c().await?;
    info!("shutdown signal received, draining monitors");
    coordinator.stop().await;

    Ok(())
}

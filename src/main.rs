use forecast_api::handlers::{self, AppState};
use forecast_api::{FileModelStore, ForecastOrchestrator, OrchestratorSettings, ServiceConfig, YahooFinanceClient};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Forecast API...");

    let config = ServiceConfig::load()?;
    info!(
        port = config.port,
        model_dir = %config.model_dir.display(),
        mode = ?config.forecast_mode,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.model_dir)?;
    let store = Arc::new(FileModelStore::new(&config.model_dir));

    let yahoo = Arc::new(YahooFinanceClient::new(config.yahoo_base_url.clone())?);
    info!("✓ Yahoo Finance client initialized");

    let orchestrator = ForecastOrchestrator::new(yahoo, store, OrchestratorSettings::from(&config));
    let state = Arc::new(AppState { orchestrator });
    let app = handlers::router(state, &config.cors_origins());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("🚀 Forecast API listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
}

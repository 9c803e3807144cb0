use anyhow::{Context, Result};
use source_manager::api::{create_router, ApiState};
use source_manager::manager::SourceManager;
use sourcebus::config::{load_config, SourceBusConfig};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "source_manager=info,sourcebus=info".into()),
        )
        .init();

    info!("Source Manager starting...");

    // Config path: first argument, then SOURCE_CONFIG, then ./sources.toml
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SOURCE_CONFIG").ok())
        .unwrap_or_else(|| "sources.toml".to_string());

    let mut config = if Path::new(&config_path).exists() {
        load_config(&config_path)?
    } else {
        warn!(path = %config_path, "Config file not found, starting with no sources");
        SourceBusConfig::default()
    };

    if let Ok(port) = std::env::var("SOURCE_API_PORT") {
        config.api.port = port
            .parse()
            .context("SOURCE_API_PORT must be a valid port number")?;
    }

    info!(
        config_path = %config_path,
        api_port = config.api.port,
        sources = config.sources.len(),
        "Configuration loaded"
    );

    let manager = Arc::new(SourceManager::new());

    // Connect configured sources; one failing does not stop the others
    let mut connected = 0;
    for source in config.sources {
        let id = source.id.clone();
        match manager.add(source).await {
            Ok(_) => connected += 1,
            Err(e) => warn!(source_id = %id, error = %e, "Failed to start source"),
        }
    }
    info!(sources_connected = connected, "Sources started");

    // Log bus traffic
    let mut bus = manager.subscribe();
    let bus_handle = tokio::spawn(async move {
        loop {
            match bus.recv().await {
                Ok(signal) => tracing::debug!(signal = ?signal, "Bus signal"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Bus logger lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Start HTTP API server
    let api_state = ApiState {
        manager: Arc::clone(&manager),
    };
    let router = create_router(api_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.api.port))
        .await
        .context("Failed to bind source API port")?;
    info!(port = config.api.port, "Source API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Source API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Graceful shutdown
    server_handle.abort();
    bus_handle.abort();
    manager.stop_all().await;
    info!("Source manager stopped");

    Ok(())
}

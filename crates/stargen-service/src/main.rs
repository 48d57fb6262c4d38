//! Stargen Service - generation orchestration over HTTP
//!
//! This is the main entry point for the stargen service.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stargen_core::ModelCatalog;
use stargen_service::{create_router, AppState, ServiceConfig};
use stargen_store::{MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stargen_service=debug,stargen_providers=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Stargen Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        database_configured = %config.database_url.is_some(),
        catalog_path = ?config.catalog_path,
        kie_configured = %config.kie_api_key.is_some(),
        openai_configured = %config.openai_api_key.is_some(),
        mock_providers = %config.mock_providers,
        poll_interval_ms = %config.poller.interval.as_millis(),
        poll_max_attempts = %config.poller.max_attempts,
        callback_secret_configured = %config.kie_callback_secret.is_some(),
        sweep_interval_secs = %config.sweep.interval.as_secs(),
        stale_after_minutes = %(config.sweep.stale_after.as_secs() / 60),
        "Service configuration loaded"
    );

    // Load the model catalog once; it is immutable for the process lifetime
    let catalog = match &config.catalog_path {
        Some(path) => ModelCatalog::load(path)?,
        None => ModelCatalog::builtin()?,
    };
    tracing::info!(
        version = %catalog.version(),
        models = catalog.models().len(),
        "Model catalog loaded"
    );

    // Open the store
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL");
            let store = PgStore::connect(url).await?;
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set - state is kept in memory and lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Build app state
    let state = AppState::new(store, Arc::new(catalog), config.clone());
    let missing = state.repository.probe_columns().await?;
    if !missing.is_empty() {
        tracing::warn!(columns = ?missing, "Generation metadata columns will not be stored");
    }
    let poller = Arc::clone(&state.poller);

    // Fail and refund whatever a previous run left unfinished
    let orchestrator = Arc::clone(&state.orchestrator);
    let sweep = config.sweep.clone();
    if let Err(e) = orchestrator
        .sweep_stale(sweep.stale_after, sweep.batch_size)
        .await
    {
        tracing::error!(error = %e, "Startup sweep of stuck generations failed");
    }
    let sweeper = (!sweep.interval.is_zero()).then(|| {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep.interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = orchestrator
                    .sweep_stale(sweep.stale_after, sweep.batch_size)
                    .await
                {
                    tracing::error!(error = %e, "Sweep of stuck generations failed");
                }
            }
        })
    });

    // Create the router
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    poller.shutdown().await;
    tracing::info!("Service stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

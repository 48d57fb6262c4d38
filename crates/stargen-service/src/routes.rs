//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{credits, generations, health, models, webhooks};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent generation submissions.
/// Each submission holds a provider call open until dispatch returns.
const GENERATION_MAX_CONCURRENT_REQUESTS: usize = 32;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Provider callbacks (shared callback secret)
/// - `POST /v1/webhooks/kie` - KIE task callback
///
/// ## Catalog (Service API Key auth)
/// - `GET /v1/models` - List models
/// - `POST /v1/quote` - Price a request
///
/// ## Generations (Service API Key auth, rate-limited)
/// - `POST /v1/generations` - Submit a generation
/// - `GET /v1/generations/{id}` - Get a generation
///
/// ## Credits (Service API Key auth)
/// - `GET /v1/users/{user_id}/balance` - Get balance
/// - `GET /v1/users/{user_id}/transactions` - List transaction history
/// - `POST /v1/users/{user_id}/credits` - Grant credits
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let generation_routes = Router::new()
        .route("/", post(generations::submit_generation))
        .route("/:id", get(generations::get_generation))
        .layer(ConcurrencyLimitLayer::new(GENERATION_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        // Catalog
        .route("/models", get(models::list_models))
        .route("/quote", post(models::quote))
        // Credits
        .route("/users/:user_id/balance", get(credits::get_balance))
        .route("/users/:user_id/transactions", get(credits::list_transactions))
        .route("/users/:user_id/credits", post(credits::grant_credits))
        // Generations (with their own concurrency limit)
        .nest("/generations", generation_routes)
        // Provider callbacks
        .route("/webhooks/kie", post(webhooks::kie_callback))
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (rate limited)
        .nest("/v1", api_routes)
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

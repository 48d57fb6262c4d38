//! Liveness endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

/// Liveness report.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `ok` while the process serves requests.
    pub status: &'static str,
    /// Service name.
    pub service: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Version of the loaded model catalog, also the pricing version.
    pub catalog_version: String,
    /// `postgres` or `memory`.
    pub store: &'static str,
    /// Asynchronous jobs currently being watched.
    pub active_monitors: usize,
}

/// Report liveness with the catalog and storage the process runs on.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "stargen",
        version: env!("CARGO_PKG_VERSION"),
        catalog_version: state.catalog.version().to_string(),
        store: if state.config.database_url.is_some() {
            "postgres"
        } else {
            "memory"
        },
        active_monitors: state.poller.active().await,
    })
}

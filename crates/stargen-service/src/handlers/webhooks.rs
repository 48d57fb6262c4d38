//! Provider callback handlers.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use stargen_core::{GenerationId, GenerationStatus};
use stargen_providers::parse_callback;

use crate::error::ApiError;
use crate::state::AppState;

/// Query parameters KIE may echo back from the callback URL.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    /// Shared secret appended to `KIE_CALLBACK_URL`.
    pub secret: Option<String>,
}

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    /// Provider task id from the payload.
    pub task_id: String,
    /// Generation bound to the task.
    pub generation_id: GenerationId,
    /// Stored status after the callback.
    pub status: GenerationStatus,
}

/// Handle a KIE task callback.
///
/// When `KIE_CALLBACK_SECRET` is set the caller must present it as a bearer
/// token or as the `secret` query parameter.
pub async fn kie_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackResponse>, ApiError> {
    if let Some(expected) = state.config.kie_callback_secret.as_deref() {
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        let presented = bearer.or(query.secret.as_deref());

        if !presented.is_some_and(|p| constant_time_eq(p, expected)) {
            tracing::warn!("Rejected KIE callback with a bad secret");
            return Err(ApiError::Unauthorized);
        }
    }

    let callback = parse_callback(&body).map_err(|e| {
        tracing::warn!(error = %e, "Unreadable KIE callback");
        ApiError::BadRequest(format!("invalid callback payload: {e}"))
    })?;

    tracing::info!(
        task_id = %callback.task_id,
        status = %callback.result.status,
        "KIE callback received"
    );

    let ack = state
        .orchestrator
        .handle_callback(&callback.task_id, callback.result)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no generation for task {}", callback.task_id)))?;

    Ok(Json(CallbackResponse {
        task_id: callback.task_id,
        generation_id: ack.generation_id,
        status: ack.status,
    }))
}

/// Compare two secrets without an early exit on the first differing byte.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

//! Generation handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::Serialize;

use stargen_core::{Category, GenerationId, GenerationRecord, GenerationStatus, UserId};

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::orchestrator::{GenerationRequest, Submission};
use crate::state::AppState;

/// Submit a generation on behalf of a user.
///
/// Returns once the provider has accepted the request. Asynchronous jobs
/// report `generating` here and finish in the background.
pub async fn submit_generation(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<Submission>, ApiError> {
    tracing::info!(
        service = %auth.service_name,
        user_id = %request.user_id,
        model_id = %request.model_id,
        "Generation submitted"
    );

    let submission = state.orchestrator.submit(request).await?;
    Ok(Json(submission))
}

/// Generation response.
#[derive(Debug, Serialize)]
pub struct GenerationResponse {
    /// Generation ID.
    pub id: GenerationId,
    /// Owning user.
    pub user_id: UserId,
    /// Asset category.
    pub category: Category,
    /// Model ID.
    pub model_id: String,
    /// Model display name.
    pub model_name: String,
    /// Selected variant.
    pub variant: Option<String>,
    /// Current status.
    pub status: GenerationStatus,
    /// Stars charged at submission.
    pub charged_stars: i64,
    /// Raw credits of the quote.
    pub credits: Decimal,
    /// Price key.
    pub sku: String,
    /// Catalog version of the quote.
    pub pricing_version: String,
    /// User prompt.
    pub prompt: String,
    /// Aspect ratio.
    pub aspect_ratio: Option<String>,
    /// Quality label or resolution.
    pub resolution: Option<String>,
    /// Provider task ID while generating.
    pub task_id: Option<String>,
    /// Output URLs, primary first.
    pub outputs: Vec<String>,
    /// Failure reason.
    pub error_message: Option<String>,
    /// Failure code.
    pub error_code: Option<String>,
    /// Creation time.
    pub created_at: String,
    /// Last update time.
    pub updated_at: String,
}

impl From<GenerationRecord> for GenerationResponse {
    fn from(record: GenerationRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            category: record.category,
            status: record.status(),
            charged_stars: record.charged_stars(),
            model_id: record.model_id,
            model_name: record.model_name,
            variant: record.variant,
            credits: record.credits,
            sku: record.sku,
            pricing_version: record.pricing_version,
            prompt: record.prompt,
            aspect_ratio: record.aspect_ratio,
            resolution: record.resolution,
            task_id: record.job.map(|j| j.task_id),
            outputs: record.outputs.into_iter().map(|o| o.url).collect(),
            error_message: record.error_message,
            error_code: record.error_code,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

/// Get a generation by ID.
pub async fn get_generation(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(id): Path<String>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let id: GenerationId = id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid generation id: {e}")))?;

    let record = state
        .orchestrator
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Generation not found".into()))?;

    Ok(Json(GenerationResponse::from(record)))
}

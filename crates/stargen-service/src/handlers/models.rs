//! Catalog and pricing handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stargen_core::{Category, ModelDescriptor, PriceOptions, ProviderKind, SupportedOptions};

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Model list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListModelsQuery {
    /// Only models of this category.
    pub category: Option<Category>,
}

/// A selectable model variant.
#[derive(Debug, Serialize)]
pub struct VariantSummary {
    /// Variant ID.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// One catalog entry.
#[derive(Debug, Serialize)]
pub struct ModelSummary {
    /// Model ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Asset category.
    pub category: Category,
    /// Serving provider.
    pub provider: ProviderKind,
    /// Selectable variants.
    pub variants: Vec<VariantSummary>,
    /// Accepted option values.
    pub options: SupportedOptions,
    /// Legacy IDs that resolve to this model.
    pub aliases: Vec<String>,
}

impl From<&ModelDescriptor> for ModelSummary {
    fn from(model: &ModelDescriptor) -> Self {
        Self {
            id: model.id.clone(),
            name: model.name.clone(),
            category: model.category,
            provider: model.provider,
            variants: model
                .variants
                .iter()
                .map(|v| VariantSummary {
                    id: v.id.clone(),
                    name: v.name.clone(),
                })
                .collect(),
            options: model.options.clone(),
            aliases: model.aliases.clone(),
        }
    }
}

/// Model list response.
#[derive(Debug, Serialize)]
pub struct ListModelsResponse {
    /// Catalog version, also the pricing version of quotes.
    pub version: String,
    /// Models in catalog order.
    pub models: Vec<ModelSummary>,
}

/// List catalog models.
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Query(query): Query<ListModelsQuery>,
) -> Json<ListModelsResponse> {
    let models = state
        .catalog
        .models()
        .iter()
        .filter(|m| query.category.map_or(true, |c| m.category == c))
        .map(ModelSummary::from)
        .collect();

    Json(ListModelsResponse {
        version: state.catalog.version().to_string(),
        models,
    })
}

/// Quote request.
#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    /// Model ID or alias.
    pub model_id: String,
    /// Pricing options.
    #[serde(default)]
    pub options: PriceOptions,
}

/// Quote response.
#[derive(Debug, Serialize)]
pub struct QuoteResponse {
    /// Requested model.
    pub model_id: String,
    /// Whether the model could be priced.
    pub available: bool,
    /// Raw credits before rounding.
    pub credits: Decimal,
    /// Stars that would be charged.
    pub stars: i64,
    /// Approximate display-currency cost.
    pub approx_currency: Decimal,
    /// Resolved price key.
    pub sku: String,
    /// Catalog version used.
    pub pricing_version: String,
}

/// Price a request without charging anything.
///
/// Unknown models yield an unavailable, zero-cost quote rather than an error.
pub async fn quote(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Json(request): Json<QuoteRequest>,
) -> Result<Json<QuoteResponse>, ApiError> {
    if request.model_id.trim().is_empty() {
        return Err(ApiError::BadRequest("model_id is required".into()));
    }

    let quote = state.orchestrator.quote(&request.model_id, &request.options);
    Ok(Json(QuoteResponse {
        model_id: request.model_id,
        available: quote.is_available(),
        credits: quote.credits,
        stars: quote.stars,
        approx_currency: quote.approx_currency,
        sku: quote.sku,
        pricing_version: quote.pricing_version,
    }))
}

//! Provider dispatch.
//!
//! Turns a catalog model and the caller's options into a provider request
//! and sends it to exactly one provider client. Dispatch is never retried.

use stargen_core::{GenerationError, GenerationMode, ModelDescriptor, PriceOptions, ProviderKind, Result};
use stargen_providers::{DispatchOutcome, GenerateParams, GenerateRequest, ProviderRegistry};

/// What the caller asked for, beyond pricing options.
#[derive(Debug, Clone, Default)]
pub struct DispatchInput<'a> {
    /// User prompt.
    pub prompt: &'a str,
    /// Requested aspect ratio, before normalization.
    pub aspect_ratio: Option<&'a str>,
    /// Reference image URLs.
    pub reference_images: &'a [String],
    /// Explicit mode; the category default applies when absent.
    pub mode: Option<GenerationMode>,
}

/// Sends generation requests to the registered providers.
#[derive(Clone)]
pub struct Dispatcher {
    registry: ProviderRegistry,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`.
    #[must_use]
    pub const fn new(registry: ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Send one request to the model's provider.
    pub async fn dispatch(
        &self,
        model: &ModelDescriptor,
        options: &PriceOptions,
        input: &DispatchInput<'_>,
    ) -> Result<(ProviderKind, DispatchOutcome)> {
        let provider = model.provider;
        let client = self
            .registry
            .get(provider)
            .map_err(|e| GenerationError::Configuration(e.to_string()))?;

        let request = build_request(model, options, input);
        tracing::info!(
            model_id = %model.id,
            api_model_id = %request.api_model_id,
            provider = provider.as_str(),
            mode = ?request.mode,
            "Dispatching generation"
        );

        match client.generate(&request).await {
            Ok(outcome) => Ok((provider, outcome)),
            Err(err) => {
                tracing::warn!(
                    model_id = %model.id,
                    provider = provider.as_str(),
                    error = %err,
                    "Dispatch failed"
                );
                Err(GenerationError::ProviderDispatch {
                    provider: provider.as_str().to_string(),
                    message: err.to_string(),
                })
            }
        }
    }
}

/// Build the provider request for a model and options.
#[must_use]
pub fn build_request(
    model: &ModelDescriptor,
    options: &PriceOptions,
    input: &DispatchInput<'_>,
) -> GenerateRequest {
    let has_references = !input.reference_images.is_empty();
    let mode = input
        .mode
        .unwrap_or_else(|| GenerationMode::default_for(model.category, has_references));

    GenerateRequest {
        api_model_id: api_model_id(model, options.model_variant.as_deref(), has_references),
        prompt: input.prompt.trim().to_string(),
        mode,
        params: GenerateParams {
            aspect_ratio: input.aspect_ratio.and_then(normalize_aspect_ratio).or_else(|| {
                (!model.options.aspect_ratios.is_empty())
                    .then(|| model.default_aspect_ratio().to_string())
            }),
            quality: options
                .quality
                .as_ref()
                .map(|q| model.quality_codes.get(q).unwrap_or(q).clone()),
            resolution: options.resolution.clone(),
            duration_seconds: options.duration_seconds,
            audio: options.audio,
            output_format: None,
            reference_images: input.reference_images.to_vec(),
            variant_count: options.variant_count.max(1),
        },
    }
}

/// Provider model id for a model, optional variant, and reference-image use.
///
/// With reference images the dedicated image-driven id wins; otherwise the
/// model's reference suffix is appended to the text id.
#[must_use]
pub fn api_model_id(model: &ModelDescriptor, variant: Option<&str>, has_references: bool) -> String {
    let (text_id, image_id) = match variant.and_then(|v| model.variant(v)) {
        Some(v) => (v.api_id.as_str(), v.api_id_i2v.as_deref()),
        None => (model.api_id.as_str(), model.api_id_i2v.as_deref()),
    };

    if !has_references {
        return text_id.to_string();
    }
    match (image_id, model.reference_suffix.as_deref()) {
        (Some(id), _) => id.to_string(),
        (None, Some(suffix)) if !text_id.ends_with(suffix) => format!("{text_id}{suffix}"),
        _ => text_id.to_string(),
    }
}

/// Normalize a user-supplied aspect ratio.
///
/// Named ratios are lowercased; numeric ratios written as `16x9`, `16/9`
/// or `16 : 9` become `16:9`. Blank input yields `None`.
#[must_use]
pub fn normalize_aspect_ratio(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let lowered = trimmed.to_lowercase();
    if matches!(lowered.as_str(), "auto" | "portrait" | "landscape" | "source" | "square") {
        return Some(lowered);
    }

    let parts: Vec<&str> = lowered
        .split(|c: char| matches!(c, ':' | '/' | 'x' | '×') || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .collect();
    match parts.as_slice() {
        [w, h] if is_number(w) && is_number(h) => Some(format!("{w}:{h}")),
        _ => Some(trimmed.to_string()),
    }
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '.')
}

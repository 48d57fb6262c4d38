//! OpenAI-compatible image client.
//!
//! `images/generations` answers synchronously, so every successful call is
//! a [`DispatchOutcome::Completed`] and polling is never needed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stargen_core::{OutputRef, ProviderKind};

use crate::client::{build_http, ClientOptions, ProviderClient};
use crate::error::{ProviderError, Result};
use crate::types::{DispatchOutcome, GenerateRequest, PollResult};

/// Default API base.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI images API client.
#[derive(Debug, Clone)]
pub struct OpenAiImagesClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ImagesRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<&'a str>,
    response_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

/// Pixel size for an aspect ratio.
#[must_use]
pub fn size_for(aspect_ratio: Option<&str>) -> &'static str {
    match aspect_ratio {
        Some("3:2" | "16:9" | "landscape") => "1536x1024",
        Some("2:3" | "9:16" | "portrait") => "1024x1536",
        Some("auto") => "auto",
        _ => "1024x1024",
    }
}

impl OpenAiImagesClient {
    /// Create a client against `base_url` (for example `https://api.openai.com/v1`).
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Configuration` if the API key is empty or the
    /// HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        options: &ClientOptions,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::Configuration("OpenAI API key is not set".into()));
        }

        Ok(Self {
            client: build_http(options)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ProviderClient for OpenAiImagesClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<DispatchOutcome> {
        let url = format!("{}/images/generations", self.base_url);
        let body = ImagesRequest {
            model: &request.api_model_id,
            prompt: &request.prompt,
            n: request.params.variant_count.max(1),
            size: size_for(request.params.aspect_ratio.as_deref()),
            quality: request.params.quality.as_deref(),
            response_format: "url",
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error: std::result::Result<ErrorResponse, _> = response.json().await;
            return Err(match error {
                Ok(err) if status.is_client_error() && status.as_u16() != 429 => {
                    ProviderError::Rejected(err.error.message)
                }
                Ok(err) => ProviderError::Api {
                    status: status.as_u16(),
                    code: err.error.code.unwrap_or_else(|| "unknown".into()),
                    message: err.error.message,
                },
                Err(_) => ProviderError::Api {
                    status: status.as_u16(),
                    code: "unknown".into(),
                    message: format!("HTTP {status}"),
                },
            });
        }

        let images: ImagesResponse = response.json().await?;
        let outputs: Vec<OutputRef> = images
            .data
            .into_iter()
            .filter_map(|d| d.url)
            .map(OutputRef::new)
            .collect();
        if outputs.is_empty() {
            return Err(ProviderError::Rejected("response contained no image URLs".into()));
        }
        Ok(DispatchOutcome::Completed { outputs })
    }

    async fn poll_status(&self, task_id: &str) -> Result<PollResult> {
        Err(ProviderError::UnknownTask {
            task_id: task_id.to_string(),
        })
    }
}

//! The uniform provider capability.

use async_trait::async_trait;
use stargen_core::ProviderKind;

use crate::error::Result;
use crate::types::{DispatchOutcome, GenerateRequest, PollResult};

/// Implemented once per generation backend.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> ProviderKind;

    /// Start a generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or is refused.
    async fn generate(&self, request: &GenerateRequest) -> Result<DispatchOutcome>;

    /// Query an asynchronous task.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be fetched.
    async fn poll_status(&self, task_id: &str) -> Result<PollResult>;
}

/// Request options shared by the HTTP clients.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 60).
    pub timeout_seconds: u64,
    /// Webhook URL the provider calls on completion.
    pub callback_url: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
            callback_url: None,
        }
    }
}

pub(crate) fn build_http(options: &ClientOptions) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(options.timeout_seconds))
        .build()
        .map_err(|e| crate::ProviderError::Configuration(format!("failed to build HTTP client: {e}")))
}

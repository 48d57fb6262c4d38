//! Provider error types.

/// Result type for provider calls.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur when talking to a generation provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider returned a non-success HTTP status.
    #[error("API error: {code} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Provider error code.
        code: String,
        /// Provider message.
        message: String,
    },

    /// Provider accepted the HTTP call but refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Provider does not know the task.
    #[error("unknown task: {task_id}")]
    UnknownTask {
        /// The task ID.
        task_id: String,
    },
}

impl ProviderError {
    /// Whether a poll that failed this way is worth repeating.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

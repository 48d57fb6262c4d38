//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use stargen_core::GenerationError;
use stargen_store::StoreError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - invalid state transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Insufficient credits.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Current balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// A generation failed after the charge; the stars were returned.
    #[error("{message}")]
    GenerationFailed {
        /// Machine-readable failure code.
        code: &'static str,
        /// Failure reason.
        message: String,
    },

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::InsufficientCredits { balance, required } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                self.to_string(),
                Some(serde_json::json!({
                    "balance": balance,
                    "required": required
                })),
            ),
            Self::GenerationFailed { code, message } => (
                StatusCode::BAD_GATEWAY,
                *code,
                message.clone(),
                Some(serde_json::json!({ "refunded": true })),
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound(format!("{entity} not found: {id}")),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<GenerationError> for ApiError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Validation(msg) => Self::BadRequest(msg),
            GenerationError::InvalidId(e) => Self::BadRequest(e.to_string()),
            GenerationError::UnknownModel { model_id } => {
                Self::NotFound(format!("model not found: {model_id}"))
            }
            GenerationError::InsufficientCredits { balance, required } => {
                Self::InsufficientCredits { balance, required }
            }
            GenerationError::InvalidTransition { .. } => Self::Conflict(err.to_string()),
            GenerationError::ProviderDispatch { .. }
            | GenerationError::ProviderTerminalFailure { .. }
            | GenerationError::Timeout { .. }
            | GenerationError::Stuck { .. } => Self::GenerationFailed {
                code: err.code(),
                message: err.to_string(),
            },
            GenerationError::Persistence(_)
            | GenerationError::Ledger(_)
            | GenerationError::Catalog(_)
            | GenerationError::Configuration(_) => Self::Internal(err.to_string()),
        }
    }
}

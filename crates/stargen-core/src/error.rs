//! Error types for stargen.
//!
//! The variants mirror the points in a generation's life where things can
//! go wrong. Anything raised before a reservation succeeds never touches
//! the ledger; anything raised after it is settled by exactly one refund.

use crate::ids::IdError;

/// Result type for stargen operations.
pub type Result<T> = std::result::Result<T, GenerationError>;

/// Errors that can occur while pricing, charging or running a generation.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// Malformed request. No charge was attempted.
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested model is not in the catalog.
    #[error("unknown model: {model_id}")]
    UnknownModel {
        /// The model ID that was requested.
        model_id: String,
    },

    /// The user's balance does not cover the quote. The record was discarded.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Current balance in stars.
        balance: i64,
        /// Required amount in stars.
        required: i64,
    },

    /// The provider rejected or could not receive the job. The charge was refunded.
    #[error("provider dispatch failed: {provider} - {message}")]
    ProviderDispatch {
        /// The provider that failed.
        provider: String,
        /// Error message.
        message: String,
    },

    /// The provider reported the job as failed. The charge was refunded.
    #[error("generation failed at provider: {message}")]
    ProviderTerminalFailure {
        /// Reason reported by the provider.
        message: String,
    },

    /// The poll budget ran out before the job reached a terminal state.
    #[error("generation timed out after {attempts} status checks")]
    Timeout {
        /// Number of status checks performed.
        attempts: u32,
    },

    /// The record sat in a non-terminal status with nothing watching it.
    /// The charge was refunded.
    #[error("generation stuck in {status} for over {minutes} minutes")]
    Stuck {
        /// Status the record was stuck in.
        status: crate::GenerationStatus,
        /// Age threshold that was exceeded.
        minutes: u64,
    },

    /// A status write that the lifecycle does not allow.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: crate::GenerationStatus,
        /// Requested status.
        to: crate::GenerationStatus,
    },

    /// The generation record could not be written.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The balance store could not be read or updated.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// The model catalog is malformed.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GenerationError {
    /// Short machine-readable code, stored on failed records and returned to callers.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::InvalidId(_) => "validation_error",
            Self::UnknownModel { .. } => "unknown_model",
            Self::InsufficientCredits { .. } => "insufficient_credits",
            Self::ProviderDispatch { .. } => "provider_dispatch_error",
            Self::ProviderTerminalFailure { .. } => "provider_failure",
            Self::Timeout { .. } => "timeout",
            Self::Stuck { .. } => "stuck_generation",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Persistence(_) => "persistence_error",
            Self::Ledger(_) => "ledger_error",
            Self::Catalog(_) => "catalog_error",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

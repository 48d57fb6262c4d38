//! Provider request and result types.

use serde::{Deserialize, Serialize};
use stargen_core::{GenerationMode, GenerationStatus, OutputRef};

/// Provider-ready parameters, already mapped to the provider's vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateParams {
    /// Normalized aspect ratio (`"16:9"`, `"auto"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    /// Provider quality code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    /// Output resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    /// Clip length in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u32>,
    /// Generate a soundtrack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<bool>,
    /// Output file format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    /// Reference image URLs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_images: Vec<String>,
    /// Number of outputs.
    #[serde(default = "default_count")]
    pub variant_count: u32,
}

fn default_count() -> u32 {
    1
}

/// A request to start a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Provider-side model identifier.
    pub api_model_id: String,
    /// User prompt.
    pub prompt: String,
    /// Generation mode.
    pub mode: GenerationMode,
    /// Mapped parameters.
    pub params: GenerateParams,
}

/// What the provider did with a generate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Assets were produced synchronously.
    Completed {
        /// Produced assets.
        outputs: Vec<OutputRef>,
    },
    /// An asynchronous task was accepted.
    Submitted {
        /// Provider task identifier.
        task_id: String,
    },
}

/// Normalized status of an asynchronous task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    /// Internal status.
    pub status: GenerationStatus,
    /// Assets, set when completed.
    pub outputs: Vec<OutputRef>,
    /// Provider failure message, set when failed.
    pub error: Option<String>,
}

impl PollResult {
    /// Task waiting to start.
    #[must_use]
    pub const fn queued() -> Self {
        Self {
            status: GenerationStatus::Queued,
            outputs: Vec::new(),
            error: None,
        }
    }

    /// Task running.
    #[must_use]
    pub const fn generating() -> Self {
        Self {
            status: GenerationStatus::Generating,
            outputs: Vec::new(),
            error: None,
        }
    }

    /// Task finished with assets.
    #[must_use]
    pub const fn completed(outputs: Vec<OutputRef>) -> Self {
        Self {
            status: GenerationStatus::Completed,
            outputs,
            error: None,
        }
    }

    /// Task failed.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: GenerationStatus::Failed,
            outputs: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// Whether the task will not change again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

//! Generation provider clients for stargen.
//!
//! Every backend implements [`ProviderClient`]: `generate` either returns
//! finished outputs or a task id, and `poll_status` reports a task in the
//! internal status vocabulary. Provider-specific strings never leave this
//! crate.
//!
//! # Example
//!
//! ```no_run
//! use stargen_core::GenerationMode;
//! use stargen_providers::{ClientOptions, GenerateParams, GenerateRequest, KieClient, ProviderClient};
//!
//! # async fn example() -> Result<(), stargen_providers::ProviderError> {
//! let client = KieClient::new("https://api.kie.ai", "your-api-key", ClientOptions::default())?;
//!
//! let outcome = client
//!     .generate(&GenerateRequest {
//!         api_model_id: "google/nano-banana".to_string(),
//!         prompt: "a lighthouse at dusk".to_string(),
//!         mode: GenerationMode::TextToImage,
//!         params: GenerateParams {
//!             aspect_ratio: Some("16:9".to_string()),
//!             ..GenerateParams::default()
//!         },
//!     })
//!     .await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
pub mod kie;
pub mod openai;
mod registry;
mod scripted;
mod types;

pub use client::{ClientOptions, ProviderClient};
pub use error::{ProviderError, Result};
pub use kie::{parse_callback, KieCallback, KieClient};
pub use openai::OpenAiImagesClient;
pub use registry::ProviderRegistry;
pub use scripted::{ScriptedProvider, DEFAULT_POLLS_TO_COMPLETE};
pub use types::{DispatchOutcome, GenerateParams, GenerateRequest, PollResult};

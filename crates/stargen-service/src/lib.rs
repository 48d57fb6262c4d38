//! Stargen HTTP API service.
//!
//! This crate wires the generation core into an HTTP service:
//!
//! - Model catalog listing and price quotes
//! - Generation submission and status
//! - Credit balances, history and grants
//!
//! # Generation lifecycle
//!
//! A submission is priced, recorded as `queued`, charged, and dispatched to
//! one provider. Synchronous providers complete the record immediately;
//! asynchronous ones move it to `generating` and a background monitor polls
//! the provider until the task ends. Any failure after the charge refunds
//! the stars exactly once before the record is marked `failed`.
//!
//! # Authentication
//!
//! Every `/v1` route requires the `X-API-Key` header. Callers are trusted
//! services that name the user on whose behalf they act.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Catalog handlers need async for consistency

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod orchestrator;
pub mod persistence;
pub mod poller;
pub mod routes;
pub mod state;

pub use config::{PollerConfig, ServiceConfig, SweepConfig};
pub use dispatch::Dispatcher;
pub use error::ApiError;
pub use ledger::{CreditLedger, Reservation};
pub use orchestrator::{CallbackAck, GenerationRequest, Orchestrator, Submission};
pub use persistence::GenerationRepository;
pub use poller::{JobPoller, PollOutcome, StatusEvent};
pub use routes::create_router;
pub use state::AppState;

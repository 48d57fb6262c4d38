//! Core types and utilities for stargen.
//!
//! This crate provides the foundational types used throughout the stargen
//! generation platform:
//!
//! - **Identifiers**: `UserId`, `GenerationId`, `TransactionId`
//! - **Catalog**: `ModelCatalog`, `ModelDescriptor`, `Pricing`
//! - **Pricing**: `quote`, `PriceOptions`, `PriceQuote`, `RateTable`
//! - **Generations**: `GenerationRecord`, `GenerationStatus`, `OutputRef`
//! - **Credits**: `CreditTransaction`, `TransactionType`
//!
//! # Stars
//!
//! Stars are the integer unit users pay with. A model's cost table is kept
//! in raw credits (`Decimal`), and a quote always rounds up to whole stars:
//!
//! - Raw credits 0.4/s for 12 seconds → 4.8 credits → 5 stars
//! - Balances are stored as `i64` stars and never go negative

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod catalog;
pub mod credits;
pub mod error;
pub mod generation;
pub mod ids;
pub mod pricing;

pub use catalog::{
    Category, DurationPrice, GenerationMode, KeyedDurations, ModelCatalog, ModelDescriptor,
    ModelVariant, PriceTier, Pricing, ProviderKind, SupportedOptions, TierPrice,
};
pub use credits::{CreditTransaction, TransactionType};
pub use error::{GenerationError, Result};
pub use generation::{
    columns, ColumnMap, GenerationRecord, GenerationStatus, JobHandle, OutputRef, RecordDetails,
};
pub use ids::{GenerationId, IdError, TransactionId, UserId};
pub use pricing::{
    quote, validate_options, PriceOptions, PriceQuote, RateEntry, RateTable, MAX_VARIANT_COUNT,
};

//! Price calculation.
//!
//! `quote` is a pure function of the catalog, the requested options and a
//! currency rate table. Unknown models never raise: they yield an all-zero
//! quote so callers can show an "unavailable" state.
//!
//! # Lookup precedence
//!
//! | Table | Selection |
//! |---|---|
//! | `Tiered` (photo) | quality key → resolution key → first tier |
//! | `PerSecond` | resolution rate → base rate, × duration |
//! | `ByDuration` | duration → audio branch |
//! | `ByQualityDuration` | quality key → resolution key → first tier, then duration → audio branch |
//! | `ByModeDuration` | mode key → first tier, then duration → audio branch |
//!
//! An unlisted duration falls back to the table's first entry. Fallbacks
//! are lossy: the caller is charged for a tier they did not name.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::catalog::{DurationPrice, KeyedDurations, ModelCatalog, ModelDescriptor, PriceTier, Pricing};
use crate::error::{GenerationError, Result};

/// Largest number of outputs one request may ask for.
pub const MAX_VARIANT_COUNT: u32 = 4;

/// Duration assumed for per-second pricing when none is requested.
pub const DEFAULT_PER_SECOND_DURATION: u32 = 5;

/// Options that influence the price of a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceOptions {
    /// Variant of a unified model (e.g. `kling-2.6`).
    #[serde(default)]
    pub model_variant: Option<String>,
    /// Quality label (e.g. `4k`, `fast`).
    #[serde(default)]
    pub quality: Option<String>,
    /// Resolution key (e.g. `1080p`).
    #[serde(default)]
    pub resolution: Option<String>,
    /// Clip length in seconds.
    #[serde(default)]
    pub duration_seconds: Option<u32>,
    /// Whether an audio track is requested.
    #[serde(default)]
    pub audio: Option<bool>,
    /// Mode tier label for mode-tiered tables (e.g. `standard`).
    #[serde(default)]
    pub mode: Option<String>,
    /// Number of outputs requested.
    #[serde(default = "default_variant_count")]
    pub variant_count: u32,
}

const fn default_variant_count() -> u32 {
    1
}

impl Default for PriceOptions {
    fn default() -> Self {
        Self {
            model_variant: None,
            quality: None,
            resolution: None,
            duration_seconds: None,
            audio: None,
            mode: None,
            variant_count: default_variant_count(),
        }
    }
}

/// Result of pricing a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Raw credits before rounding (already multiplied by the variant count).
    pub credits: Decimal,
    /// Stars to charge: `ceil(credits)`.
    pub stars: i64,
    /// Approximate display-currency cost at the best available rate.
    pub approx_currency: Decimal,
    /// Resolved price key, e.g. `kling-2.6:10s:audio`.
    pub sku: String,
    /// Catalog version the quote was computed against.
    pub pricing_version: String,
}

impl PriceQuote {
    /// The quote returned for models that cannot be priced.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            credits: Decimal::ZERO,
            stars: 0,
            approx_currency: Decimal::ZERO,
            sku: String::new(),
            pricing_version: String::new(),
        }
    }

    /// Whether the model could be priced.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.sku.is_empty()
    }
}

/// One purchasable bundle: `price` in display currency buys `stars`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateEntry {
    /// Bundle name.
    pub label: String,
    /// Price in display currency.
    pub price: Decimal,
    /// Stars granted.
    pub stars: i64,
}

/// Currency-per-star rates supplied from outside the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateTable {
    /// ISO currency code of `price` values.
    pub currency: String,
    /// Known bundles.
    pub entries: Vec<RateEntry>,
}

impl RateTable {
    /// Lowest currency-per-star rate across all bundles.
    ///
    /// Bundles granting no stars are ignored.
    #[must_use]
    pub fn best_rate(&self) -> Option<Decimal> {
        self.entries
            .iter()
            .filter(|e| e.stars > 0)
            .filter_map(|e| e.price.checked_div(Decimal::from(e.stars)))
            .min()
    }
}

impl Default for RateTable {
    fn default() -> Self {
        let entry = |label: &str, price: i64, stars: i64| RateEntry {
            label: label.into(),
            price: Decimal::from(price),
            stars,
        };
        Self {
            currency: "RUB".into(),
            entries: vec![
                entry("pack_mini", 299, 100),
                entry("pack_plus", 990, 400),
                entry("pack_max", 2990, 1200),
                entry("star_250", 690, 250),
                entry("star_800", 1490, 800),
                entry("star_2500", 3490, 2500),
            ],
        }
    }
}

/// Price a request against the catalog.
///
/// Returns [`PriceQuote::unavailable`] when the model, or a requested
/// variant of it, is not in the catalog.
#[must_use]
pub fn quote(
    catalog: &ModelCatalog,
    model_id: &str,
    options: &PriceOptions,
    rates: &RateTable,
) -> PriceQuote {
    let Some(model) = catalog.get(model_id) else {
        return PriceQuote::unavailable();
    };

    let (price_id, pricing) = match options.model_variant.as_deref() {
        Some(variant_id) => match model.variant(variant_id) {
            Some(variant) => (variant.id.as_str(), &variant.pricing),
            None => return PriceQuote::unavailable(),
        },
        None => (model.id.as_str(), &model.pricing),
    };

    let (per_output, sku_parts) = raw_credits(pricing, options);
    let credits = per_output * Decimal::from(options.variant_count.max(1));
    let Some(stars) = credits.ceil().to_i64() else {
        return PriceQuote::unavailable();
    };

    let approx_currency = rates
        .best_rate()
        .map_or(Decimal::ZERO, |rate| (Decimal::from(stars) * rate).round_dp(2));

    let mut sku = price_id.to_string();
    for part in sku_parts {
        sku.push(':');
        sku.push_str(&part);
    }

    PriceQuote {
        credits,
        stars,
        approx_currency,
        sku,
        pricing_version: catalog.version().to_string(),
    }
}

/// Check requested options against what a model accepts.
///
/// Lists a model leaves empty are not enforced.
///
/// # Errors
///
/// Returns `GenerationError::Validation` describing the first offending option.
pub fn validate_options(model: &ModelDescriptor, options: &PriceOptions) -> Result<()> {
    if !(1..=MAX_VARIANT_COUNT).contains(&options.variant_count) {
        return Err(GenerationError::Validation(format!(
            "variant_count must be between 1 and {MAX_VARIANT_COUNT}"
        )));
    }

    if let Some(variant) = options.model_variant.as_deref() {
        if model.variant(variant).is_none() {
            return Err(GenerationError::Validation(format!(
                "model {} has no variant {variant}",
                model.id
            )));
        }
    }

    let supported = &model.options;
    check_listed("quality", options.quality.as_deref(), &supported.qualities)?;
    check_listed("resolution", options.resolution.as_deref(), &supported.resolutions)?;

    if let Some(duration) = options.duration_seconds {
        if !supported.durations.is_empty() && !supported.durations.contains(&duration) {
            return Err(GenerationError::Validation(format!(
                "duration {duration}s is not supported by {}",
                model.id
            )));
        }
    }

    Ok(())
}

fn check_listed(name: &str, requested: Option<&str>, allowed: &[String]) -> Result<()> {
    match requested {
        Some(value) if !allowed.is_empty() && !allowed.iter().any(|a| a == value) => Err(
            GenerationError::Validation(format!("unsupported {name}: {value}")),
        ),
        _ => Ok(()),
    }
}

/// Credits for one output plus the SKU segments that identify the tier.
fn raw_credits(pricing: &Pricing, options: &PriceOptions) -> (Decimal, Vec<String>) {
    match pricing {
        Pricing::Fixed { credits } => (*credits, Vec::new()),
        Pricing::Tiered { tiers } => match select_tier(tiers, options) {
            Some(tier) => (tier.credits, vec![tier.key.clone()]),
            None => (Decimal::ZERO, Vec::new()),
        },
        Pricing::PerSecond {
            rate,
            by_resolution,
        } => {
            let seconds = options
                .duration_seconds
                .unwrap_or(DEFAULT_PER_SECOND_DURATION);
            let matched = options
                .resolution
                .as_deref()
                .and_then(|res| by_resolution.iter().find(|t| t.key == res));
            let mut parts = Vec::new();
            let per_second = match matched {
                Some(tier) => {
                    parts.push(tier.key.clone());
                    tier.credits
                }
                None => *rate,
            };
            parts.push(format!("{seconds}s"));
            (per_second * Decimal::from(seconds), parts)
        }
        Pricing::ByDuration { durations } => duration_price(durations, options, Vec::new()),
        Pricing::ByQualityDuration { tiers } => {
            let tier = options
                .quality
                .as_deref()
                .and_then(|q| find_keyed(tiers, q))
                .or_else(|| options.resolution.as_deref().and_then(|r| find_keyed(tiers, r)))
                .or_else(|| tiers.first());
            keyed_duration_price(tier, options)
        }
        Pricing::ByModeDuration { tiers } => {
            let tier = options
                .mode
                .as_deref()
                .and_then(|m| find_keyed(tiers, m))
                .or_else(|| tiers.first());
            keyed_duration_price(tier, options)
        }
    }
}

fn select_tier<'a>(tiers: &'a [PriceTier], options: &PriceOptions) -> Option<&'a PriceTier> {
    let by_key = |key: Option<&str>| key.and_then(|k| tiers.iter().find(|t| t.key == k));
    by_key(options.quality.as_deref())
        .or_else(|| by_key(options.resolution.as_deref()))
        .or_else(|| tiers.first())
}

fn find_keyed<'a>(tiers: &'a [KeyedDurations], key: &str) -> Option<&'a KeyedDurations> {
    tiers.iter().find(|t| t.key == key)
}

fn keyed_duration_price(
    tier: Option<&KeyedDurations>,
    options: &PriceOptions,
) -> (Decimal, Vec<String>) {
    match tier {
        Some(tier) => duration_price(&tier.durations, options, vec![tier.key.clone()]),
        None => (Decimal::ZERO, Vec::new()),
    }
}

fn duration_price(
    durations: &[DurationPrice],
    options: &PriceOptions,
    mut parts: Vec<String>,
) -> (Decimal, Vec<String>) {
    let entry = options
        .duration_seconds
        .and_then(|s| durations.iter().find(|d| d.seconds == s))
        .or_else(|| durations.first());

    match entry {
        Some(entry) => {
            let (credits, branch) = entry.price.resolve(options.audio);
            parts.push(format!("{}s", entry.seconds));
            if let Some(branch) = branch {
                parts.push(branch.to_string());
            }
            (credits, parts)
        }
        None => (Decimal::ZERO, parts),
    }
}

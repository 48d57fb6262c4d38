//! Model catalog.
//!
//! The catalog is immutable configuration: it is parsed once at startup
//! (from the built-in JSON or a file), validated, indexed, and then shared
//! read-only. Its `version` string is also the pricing version stamped on
//! every quote.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{GenerationError, Result};

/// Catalog shipped with the crate.
const BUILTIN_CATALOG: &str = include_str!("../catalog/models.json");

/// Kind of asset a model produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Still images.
    Photo,
    /// Video clips.
    Video,
    /// Music and speech.
    Audio,
}

impl Category {
    /// Value stored in the record's `type` column.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// Backend that serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    /// KIE market task API (asynchronous).
    #[serde(rename = "kie")]
    Kie,
    /// OpenAI-compatible image API (synchronous).
    #[serde(rename = "openai")]
    OpenAi,
    /// In-process scripted provider.
    #[serde(rename = "scripted")]
    Scripted,
}

impl ProviderKind {
    /// Stable name used in logs and error messages.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Kie => "kie",
            Self::OpenAi => "openai",
            Self::Scripted => "scripted",
        }
    }
}

/// How the prompt is turned into an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenerationMode {
    /// Text to image.
    #[serde(rename = "t2i")]
    TextToImage,
    /// Image to image (edit).
    #[serde(rename = "i2i")]
    ImageToImage,
    /// Text to video.
    #[serde(rename = "t2v")]
    TextToVideo,
    /// Image to video.
    #[serde(rename = "i2v")]
    ImageToVideo,
    /// First and last frame to video.
    #[serde(rename = "start_end")]
    StartEnd,
    /// Reference-guided video.
    #[serde(rename = "reference")]
    Reference,
    /// Text to audio.
    #[serde(rename = "t2a")]
    TextToAudio,
}

impl GenerationMode {
    /// Whether the mode consumes reference images.
    #[must_use]
    pub const fn uses_reference_images(&self) -> bool {
        matches!(
            self,
            Self::ImageToImage | Self::ImageToVideo | Self::StartEnd | Self::Reference
        )
    }

    /// Mode a category falls back to when the caller does not name one.
    #[must_use]
    pub const fn default_for(category: Category, has_reference_images: bool) -> Self {
        match (category, has_reference_images) {
            (Category::Photo, false) => Self::TextToImage,
            (Category::Photo, true) => Self::ImageToImage,
            (Category::Video, false) => Self::TextToVideo,
            (Category::Video, true) => Self::ImageToVideo,
            (Category::Audio, _) => Self::TextToAudio,
        }
    }
}

/// A keyed price: a quality label or resolution and its raw credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    /// Quality label or resolution key (`"4k"`, `"1080p"`).
    pub key: String,
    /// Raw credits for one output.
    pub credits: Decimal,
}

/// Price of one duration entry, optionally split by an audio flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TierPrice {
    /// Single price regardless of audio.
    Flat(Decimal),
    /// Separate prices with and without an audio track.
    Audio {
        /// Price without audio. Used when audio is not requested.
        no_audio: Decimal,
        /// Price with audio, if the model can produce it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<Decimal>,
    },
}

impl TierPrice {
    /// Resolve the price for the requested audio flag.
    ///
    /// Returns the credits and, for split prices, the branch label that
    /// goes into the SKU. Unspecified audio takes the `no_audio` branch.
    #[must_use]
    pub fn resolve(&self, audio: Option<bool>) -> (Decimal, Option<&'static str>) {
        match self {
            Self::Flat(credits) => (*credits, None),
            Self::Audio {
                audio: Some(with_audio),
                ..
            } if audio == Some(true) => (*with_audio, Some("audio")),
            Self::Audio { no_audio, .. } => (*no_audio, Some("no_audio")),
        }
    }

    fn amounts(&self) -> Vec<Decimal> {
        match self {
            Self::Flat(credits) => vec![*credits],
            Self::Audio { no_audio, audio } => std::iter::once(*no_audio).chain(*audio).collect(),
        }
    }
}

/// Price for one clip length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationPrice {
    /// Clip length in seconds.
    pub seconds: u32,
    /// Price for that length.
    pub price: TierPrice,
}

/// A duration table selected by a quality/resolution or mode key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedDurations {
    /// Quality label, resolution or mode.
    pub key: String,
    /// Prices per clip length.
    pub durations: Vec<DurationPrice>,
}

/// A model's cost table in raw credits per output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pricing {
    /// One price for every request.
    Fixed {
        /// Raw credits per output.
        credits: Decimal,
    },
    /// Photo tiers keyed by quality label or resolution.
    Tiered {
        /// Tiers in catalog order. The first is the fallback.
        tiers: Vec<PriceTier>,
    },
    /// Flat rate multiplied by the requested duration.
    PerSecond {
        /// Credits per second when no resolution rate matches.
        rate: Decimal,
        /// Optional per-resolution rates.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        by_resolution: Vec<PriceTier>,
    },
    /// Prices keyed by duration only.
    ByDuration {
        /// Prices per clip length.
        durations: Vec<DurationPrice>,
    },
    /// Quality (or resolution) tiers, each keyed by duration.
    ByQualityDuration {
        /// Tiers in catalog order. The first is the fallback.
        tiers: Vec<KeyedDurations>,
    },
    /// Mode tiers, each keyed by duration.
    ByModeDuration {
        /// Tiers in catalog order. The first is the fallback.
        tiers: Vec<KeyedDurations>,
    },
}

impl Pricing {
    /// Check that every table has entries and no amount is negative.
    fn validate(&self) -> std::result::Result<(), String> {
        let amounts: Vec<Decimal> = match self {
            Self::Fixed { credits } => vec![*credits],
            Self::Tiered { tiers } => {
                if tiers.is_empty() {
                    return Err("tiered pricing has no tiers".into());
                }
                tiers.iter().map(|t| t.credits).collect()
            }
            Self::PerSecond {
                rate,
                by_resolution,
            } => std::iter::once(*rate)
                .chain(by_resolution.iter().map(|t| t.credits))
                .collect(),
            Self::ByDuration { durations } => {
                if durations.is_empty() {
                    return Err("duration pricing has no entries".into());
                }
                durations.iter().flat_map(|d| d.price.amounts()).collect()
            }
            Self::ByQualityDuration { tiers } | Self::ByModeDuration { tiers } => {
                if tiers.is_empty() || tiers.iter().any(|t| t.durations.is_empty()) {
                    return Err("keyed duration pricing has an empty table".into());
                }
                tiers
                    .iter()
                    .flat_map(|t| t.durations.iter())
                    .flat_map(|d| d.price.amounts())
                    .collect()
            }
        };

        if amounts.iter().any(Decimal::is_sign_negative) {
            return Err("negative credit amount".into());
        }
        Ok(())
    }
}

/// Option values a model accepts. Empty lists mean "not constrained".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupportedOptions {
    /// Quality labels.
    #[serde(default)]
    pub qualities: Vec<String>,
    /// Resolution keys.
    #[serde(default)]
    pub resolutions: Vec<String>,
    /// Clip lengths in seconds.
    #[serde(default)]
    pub durations: Vec<u32>,
    /// Aspect ratios. The first is the model default.
    #[serde(default)]
    pub aspect_ratios: Vec<String>,
    /// Generation modes.
    #[serde(default)]
    pub modes: Vec<GenerationMode>,
}

/// A selectable version of a unified model (e.g. `kling-2.6` under `kling`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVariant {
    /// Variant identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Provider model id for text-driven modes.
    pub api_id: String,
    /// Provider model id when reference images are supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_id_i2v: Option<String>,
    /// Variant cost table.
    pub pricing: Pricing,
}

/// Immutable description of one generation model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Asset category.
    pub category: Category,
    /// Serving provider.
    pub provider: ProviderKind,
    /// Provider model id for text-driven modes.
    pub api_id: String,
    /// Provider model id when reference images are supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_id_i2v: Option<String>,
    /// Suffix appended to `api_id` when reference images are supplied and
    /// no dedicated image-driven id exists (e.g. `-edit`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_suffix: Option<String>,
    /// Base cost table, used when no variant is selected.
    pub pricing: Pricing,
    /// Selectable variants.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<ModelVariant>,
    /// Accepted option values.
    #[serde(default)]
    pub options: SupportedOptions,
    /// Quality label to provider quality code (e.g. `1k_2k` → `2K`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub quality_codes: BTreeMap<String, String>,
    /// Legacy identifiers that resolve to this model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl ModelDescriptor {
    /// Look up a variant by id.
    #[must_use]
    pub fn variant(&self, id: &str) -> Option<&ModelVariant> {
        self.variants.iter().find(|v| v.id == id)
    }

    /// Default aspect ratio (first listed, or square).
    #[must_use]
    pub fn default_aspect_ratio(&self) -> &str {
        self.options
            .aspect_ratios
            .first()
            .map_or("1:1", String::as_str)
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    version: String,
    models: Vec<ModelDescriptor>,
}

/// The validated, indexed set of models.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    version: String,
    models: Vec<ModelDescriptor>,
    index: HashMap<String, usize>,
}

impl ModelCatalog {
    /// Build a catalog from parsed descriptors.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::Catalog` for duplicate ids or aliases and
    /// for malformed pricing tables.
    pub fn new(version: impl Into<String>, models: Vec<ModelDescriptor>) -> Result<Self> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(GenerationError::Catalog("catalog version is empty".into()));
        }

        let mut index = HashMap::new();
        for (position, model) in models.iter().enumerate() {
            let pricing_tables = std::iter::once((model.id.as_str(), &model.pricing)).chain(
                model
                    .variants
                    .iter()
                    .map(|v| (v.id.as_str(), &v.pricing)),
            );
            for (owner, pricing) in pricing_tables {
                pricing
                    .validate()
                    .map_err(|e| GenerationError::Catalog(format!("{owner}: {e}")))?;
            }

            for key in std::iter::once(&model.id).chain(model.aliases.iter()) {
                if index.insert(key.clone(), position).is_some() {
                    return Err(GenerationError::Catalog(format!(
                        "duplicate model id or alias: {key}"
                    )));
                }
            }
        }

        Ok(Self {
            version,
            models,
            index,
        })
    }

    /// Parse a catalog from JSON.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::Catalog` if the JSON is malformed or fails validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: CatalogFile =
            serde_json::from_str(json).map_err(|e| GenerationError::Catalog(e.to_string()))?;
        Self::new(file.version, file.models)
    }

    /// Load a catalog from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::Catalog` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GenerationError::Catalog(format!("{}: {e}", path.display())))?;
        Self::from_json(&contents)
    }

    /// The catalog bundled with this crate.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::Catalog` if the bundled JSON is invalid.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_CATALOG)
    }

    /// Catalog version, also used as the pricing version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Find a model by id or alias.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.index.get(id).map(|&position| &self.models[position])
    }

    /// All models in catalog order.
    #[must_use]
    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// Models of one category in catalog order.
    pub fn by_category(&self, category: Category) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.iter().filter(move |m| m.category == category)
    }
}

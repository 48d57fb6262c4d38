//! Generation records.
//!
//! A record tracks one request from submission to its terminal state:
//!
//! ```text
//! queued ──(sync result)──────────────► completed
//! queued ──(task accepted)─► generating ──► completed
//!                                    └──► failed
//! queued ──(dispatch error)──────────► failed
//! ```
//!
//! Terminal records are never written again. The charged amount is fixed
//! when the record is created.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{Category, ProviderKind};
use crate::error::{GenerationError, Result};
use crate::ids::{GenerationId, UserId};
use crate::pricing::PriceQuote;

/// A persisted row: column name to JSON value.
pub type ColumnMap = BTreeMap<String, serde_json::Value>;

/// Column names of the generations table.
pub mod columns {
    /// Primary key.
    pub const ID: &str = "id";
    /// Owning user; references the profiles table.
    pub const USER_ID: &str = "user_id";
    /// Asset category.
    pub const TYPE: &str = "type";
    /// Model identifier.
    pub const MODEL_ID: &str = "model_id";
    /// Lifecycle status.
    pub const STATUS: &str = "status";
    /// Model display name.
    pub const MODEL_NAME: &str = "model_name";
    /// User prompt.
    pub const PROMPT: &str = "prompt";
    /// Requested aspect ratio.
    pub const ASPECT_RATIO: &str = "aspect_ratio";
    /// Provider name.
    pub const PROVIDER: &str = "provider";
    /// Provider task handle while generating.
    pub const TASK_ID: &str = "task_id";
    /// All output URLs.
    pub const RESULT_URLS: &str = "result_urls";
    /// Failure reason.
    pub const ERROR_MESSAGE: &str = "error_message";
    /// Creation time.
    pub const CREATED_AT: &str = "created_at";
    /// Last write time.
    pub const UPDATED_AT: &str = "updated_at";
    /// Primary output URL.
    pub const IMAGE_URL: &str = "image_url";
    /// Requested resolution or quality.
    pub const RESOLUTION: &str = "resolution";
    /// Raw credits of the quote.
    pub const CREDITS_USED: &str = "credits_used";
    /// Stars charged at creation.
    pub const CHARGED_STARS: &str = "charged_stars";
    /// Price key.
    pub const SKU: &str = "sku";
    /// Catalog version of the quote.
    pub const PRICING_VERSION: &str = "pricing_version";
    /// Free-form details (variant, mode, error code).
    pub const METADATA: &str = "metadata";
}

/// Lifecycle status of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    /// Record created, provider not yet called.
    Queued,
    /// Provider accepted an asynchronous task.
    Generating,
    /// Output available. Terminal.
    Completed,
    /// Failed and refunded. Terminal.
    Failed,
}

impl GenerationStatus {
    /// Value stored in the `status` column.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further writes are allowed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (*self, next),
            (Self::Queued, Self::Generating | Self::Completed | Self::Failed)
                | (Self::Generating, Self::Completed | Self::Failed)
        )
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationStatus {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            // older rows used the provider's vocabulary
            "generating" | "processing" => Ok(Self::Generating),
            "completed" | "success" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(GenerationError::Persistence(format!(
                "unknown generation status: {other}"
            ))),
        }
    }
}

/// Reference to one produced asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    /// Where the asset can be fetched.
    pub url: String,
}

impl OutputRef {
    /// Wrap a URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Correlation key for an asynchronous provider task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// Provider running the task.
    pub provider: ProviderKind,
    /// Provider's task identifier.
    pub task_id: String,
}

/// One generation request and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    /// Record identifier.
    pub id: GenerationId,
    /// Owning user.
    pub user_id: UserId,
    /// Asset category.
    pub category: Category,
    /// Model identifier (canonical, aliases resolved).
    pub model_id: String,
    /// Model display name.
    pub model_name: String,
    /// Selected model variant.
    pub variant: Option<String>,
    /// User prompt.
    pub prompt: String,
    /// Requested aspect ratio.
    pub aspect_ratio: Option<String>,
    /// Requested quality label or resolution.
    pub resolution: Option<String>,
    /// Raw credits of the quote.
    pub credits: rust_decimal::Decimal,
    charged_stars: i64,
    /// Price key.
    pub sku: String,
    /// Catalog version of the quote.
    pub pricing_version: String,
    /// Lifecycle status.
    status: GenerationStatus,
    /// Provider task while generating.
    pub job: Option<JobHandle>,
    /// Produced assets.
    pub outputs: Vec<OutputRef>,
    /// Failure reason.
    pub error_message: Option<String>,
    /// Machine-readable failure code.
    pub error_code: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// Last status write.
    pub updated_at: DateTime<Utc>,
}

/// Request details copied onto a new record.
#[derive(Debug, Clone, Default)]
pub struct RecordDetails {
    /// Model display name.
    pub model_name: String,
    /// Selected variant.
    pub variant: Option<String>,
    /// User prompt.
    pub prompt: String,
    /// Aspect ratio after normalization.
    pub aspect_ratio: Option<String>,
    /// Quality label or resolution.
    pub resolution: Option<String>,
}

impl GenerationRecord {
    /// Create a queued record charged at the quote's stars.
    #[must_use]
    pub fn queued(
        user_id: UserId,
        category: Category,
        model_id: impl Into<String>,
        details: RecordDetails,
        quote: &PriceQuote,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: GenerationId::generate(),
            user_id,
            category,
            model_id: model_id.into(),
            model_name: details.model_name,
            variant: details.variant,
            prompt: details.prompt,
            aspect_ratio: details.aspect_ratio,
            resolution: details.resolution,
            credits: quote.credits,
            charged_stars: quote.stars,
            sku: quote.sku.clone(),
            pricing_version: quote.pricing_version.clone(),
            status: GenerationStatus::Queued,
            job: None,
            outputs: Vec::new(),
            error_message: None,
            error_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stars charged when the record was created.
    #[must_use]
    pub const fn charged_stars(&self) -> i64 {
        self.charged_stars
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> GenerationStatus {
        self.status
    }

    /// First output, if any.
    #[must_use]
    pub fn primary_output(&self) -> Option<&OutputRef> {
        self.outputs.first()
    }

    fn transition(&mut self, next: GenerationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(GenerationError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record that the provider accepted an asynchronous task.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::InvalidTransition` unless the record is queued.
    pub fn mark_generating(&mut self, job: JobHandle) -> Result<()> {
        if self.status != GenerationStatus::Queued {
            return Err(GenerationError::InvalidTransition {
                from: self.status,
                to: GenerationStatus::Generating,
            });
        }
        self.transition(GenerationStatus::Generating)?;
        self.job = Some(job);
        Ok(())
    }

    /// Record the produced assets.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::InvalidTransition` if the record is terminal.
    pub fn mark_completed(&mut self, outputs: Vec<OutputRef>) -> Result<()> {
        self.transition(GenerationStatus::Completed)?;
        self.outputs = outputs;
        Ok(())
    }

    /// Record a failure.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::InvalidTransition` if the record is terminal.
    pub fn mark_failed(&mut self, error: &GenerationError) -> Result<()> {
        self.transition(GenerationStatus::Failed)?;
        self.error_message = Some(error.to_string());
        self.error_code = Some(error.code().to_string());
        Ok(())
    }

    /// Flatten into table columns.
    #[must_use]
    pub fn to_columns(&self) -> ColumnMap {
        use serde_json::{json, Value};

        let optional_string = |v: &Option<String>| v.clone().map_or(Value::Null, Value::String);

        let mut row = ColumnMap::new();
        row.insert(columns::ID.into(), json!(self.id.to_string()));
        row.insert(columns::USER_ID.into(), json!(self.user_id.to_string()));
        row.insert(columns::TYPE.into(), json!(self.category.as_str()));
        row.insert(columns::MODEL_ID.into(), json!(self.model_id));
        row.insert(columns::STATUS.into(), json!(self.status.as_str()));
        row.insert(columns::MODEL_NAME.into(), json!(self.model_name));
        row.insert(columns::PROMPT.into(), json!(self.prompt));
        row.insert(columns::ASPECT_RATIO.into(), optional_string(&self.aspect_ratio));
        row.insert(
            columns::PROVIDER.into(),
            self.job
                .as_ref()
                .map_or(Value::Null, |j| json!(j.provider.as_str())),
        );
        row.insert(
            columns::TASK_ID.into(),
            self.job.as_ref().map_or(Value::Null, |j| json!(j.task_id)),
        );
        row.insert(
            columns::RESULT_URLS.into(),
            json!(self.outputs.iter().map(|o| o.url.as_str()).collect::<Vec<_>>()),
        );
        row.insert(columns::ERROR_MESSAGE.into(), optional_string(&self.error_message));
        row.insert(columns::CREATED_AT.into(), json!(self.created_at.to_rfc3339()));
        row.insert(columns::UPDATED_AT.into(), json!(self.updated_at.to_rfc3339()));
        row.insert(
            columns::IMAGE_URL.into(),
            self.primary_output().map_or(Value::Null, |o| json!(o.url)),
        );
        row.insert(columns::RESOLUTION.into(), optional_string(&self.resolution));
        row.insert(columns::CREDITS_USED.into(), json!(self.credits.to_string()));
        row.insert(columns::CHARGED_STARS.into(), json!(self.charged_stars));
        row.insert(columns::SKU.into(), json!(self.sku));
        row.insert(columns::PRICING_VERSION.into(), json!(self.pricing_version));
        row.insert(
            columns::METADATA.into(),
            json!({
                "variant": self.variant,
                "error_code": self.error_code,
                "provider": self.job.as_ref().map(|j| j.provider),
            }),
        );
        row
    }

    /// Rebuild a record from a stored row.
    ///
    /// Optional columns missing from the row take neutral defaults.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::Persistence` if a required column is missing or malformed.
    pub fn from_columns(row: &ColumnMap) -> Result<Self> {
        let text = |name: &str| row.get(name).and_then(serde_json::Value::as_str);
        let required = |name: &str| {
            text(name).ok_or_else(|| {
                GenerationError::Persistence(format!("generation row missing column {name}"))
            })
        };
        let owned = |name: &str| text(name).map(str::to_string);
        let timestamp = |name: &str| {
            text(name)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
        };

        let category = match required(columns::TYPE)? {
            "photo" => Category::Photo,
            "video" => Category::Video,
            "audio" => Category::Audio,
            other => {
                return Err(GenerationError::Persistence(format!(
                    "unknown generation type: {other}"
                )))
            }
        };

        let metadata = row.get(columns::METADATA);
        let meta_text = |key: &str| {
            metadata
                .and_then(|m| m.get(key))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        };
        let provider: Option<ProviderKind> = metadata
            .and_then(|m| m.get("provider"))
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        let job = owned(columns::TASK_ID).map(|task_id| JobHandle {
            provider: provider.unwrap_or(ProviderKind::Kie),
            task_id,
        });

        let outputs = row
            .get(columns::RESULT_URLS)
            .and_then(serde_json::Value::as_array)
            .map(|urls| {
                urls.iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(OutputRef::new)
                    .collect::<Vec<_>>()
            })
            .filter(|urls| !urls.is_empty())
            .or_else(|| owned(columns::IMAGE_URL).map(|url| vec![OutputRef::new(url)]))
            .unwrap_or_default();

        let created_at = timestamp(columns::CREATED_AT).unwrap_or_else(Utc::now);

        Ok(Self {
            id: required(columns::ID)?.parse()?,
            user_id: required(columns::USER_ID)?.parse()?,
            category,
            model_id: required(columns::MODEL_ID)?.to_string(),
            model_name: owned(columns::MODEL_NAME).unwrap_or_default(),
            variant: meta_text("variant"),
            prompt: owned(columns::PROMPT).unwrap_or_default(),
            aspect_ratio: owned(columns::ASPECT_RATIO),
            resolution: owned(columns::RESOLUTION),
            credits: match row.get(columns::CREDITS_USED) {
                Some(serde_json::Value::String(s)) => s.parse().unwrap_or_default(),
                Some(serde_json::Value::Number(n)) => n.to_string().parse().unwrap_or_default(),
                _ => rust_decimal::Decimal::ZERO,
            },
            charged_stars: row
                .get(columns::CHARGED_STARS)
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0),
            sku: owned(columns::SKU).unwrap_or_default(),
            pricing_version: owned(columns::PRICING_VERSION).unwrap_or_default(),
            status: required(columns::STATUS)?.parse()?,
            job,
            outputs,
            error_message: owned(columns::ERROR_MESSAGE),
            error_code: meta_text("error_code"),
            created_at,
            updated_at: timestamp(columns::UPDATED_AT).unwrap_or(created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn quote(stars: i64) -> PriceQuote {
        PriceQuote {
            credits: Decimal::from(stars),
            stars,
            approx_currency: Decimal::ZERO,
            sku: "kling-2.6:5s:no_audio".into(),
            pricing_version: "2026-01-27".into(),
        }
    }

    fn record() -> GenerationRecord {
        GenerationRecord::queued(
            UserId::generate(),
            Category::Video,
            "kling",
            RecordDetails {
                model_name: "Kling".into(),
                variant: Some("kling-2.6".into()),
                prompt: "a cat surfing".into(),
                aspect_ratio: Some("16:9".into()),
                resolution: None,
            },
            &quote(92),
        )
    }

    fn handle() -> JobHandle {
        JobHandle {
            provider: ProviderKind::Kie,
            task_id: "task-1".into(),
        }
    }

    #[test]
    fn new_record_is_queued_with_fixed_charge() {
        let record = record();
        assert_eq!(record.status(), GenerationStatus::Queued);
        assert_eq!(record.charged_stars(), 92);
    }

    #[test]
    fn async_path_reaches_completed() {
        let mut record = record();
        record.mark_generating(handle()).unwrap();
        record
            .mark_completed(vec![OutputRef::new("https://cdn.example/v.mp4")])
            .unwrap();
        assert_eq!(record.status(), GenerationStatus::Completed);
        assert_eq!(record.primary_output().unwrap().url, "https://cdn.example/v.mp4");
    }

    #[test]
    fn terminal_records_refuse_writes() {
        let mut record = record();
        record
            .mark_failed(&GenerationError::Timeout { attempts: 3 })
            .unwrap();
        assert_eq!(record.error_code.as_deref(), Some("timeout"));

        assert!(matches!(
            record.mark_completed(Vec::new()),
            Err(GenerationError::InvalidTransition { .. })
        ));
        assert!(record
            .mark_failed(&GenerationError::Timeout { attempts: 4 })
            .is_err());
        assert_eq!(record.status(), GenerationStatus::Failed);
    }

    #[test]
    fn generating_cannot_restart() {
        let mut record = record();
        record.mark_generating(handle()).unwrap();
        assert!(record.mark_generating(handle()).is_err());
    }

    #[test]
    fn columns_round_trip_through_a_row() {
        let mut record = record();
        record.mark_generating(handle()).unwrap();

        let restored = GenerationRecord::from_columns(&record.to_columns()).unwrap();
        assert_eq!(restored.id, record.id);
        assert_eq!(restored.status(), GenerationStatus::Generating);
        assert_eq!(restored.charged_stars(), 92);
        assert_eq!(restored.job, record.job);
        assert_eq!(restored.variant.as_deref(), Some("kling-2.6"));
    }

    #[test]
    fn row_without_optional_columns_still_loads() {
        let mut row = record().to_columns();
        for column in [
            columns::IMAGE_URL,
            columns::RESOLUTION,
            columns::CREDITS_USED,
            columns::CHARGED_STARS,
            columns::SKU,
            columns::PRICING_VERSION,
            columns::METADATA,
        ] {
            row.remove(column);
        }

        let restored = GenerationRecord::from_columns(&row).unwrap();
        assert_eq!(restored.charged_stars(), 0);
        assert!(restored.sku.is_empty());
        assert!(restored.variant.is_none());
    }

    #[test]
    fn numeric_credits_column_loads() {
        let mut row = record().to_columns();
        row.insert(columns::CREDITS_USED.into(), serde_json::json!(14.4));
        let restored = GenerationRecord::from_columns(&row).unwrap();
        assert_eq!(restored.credits, Decimal::new(144, 1));
    }

    #[test]
    fn row_missing_status_is_rejected() {
        let mut row = record().to_columns();
        row.remove(columns::STATUS);
        assert!(matches!(
            GenerationRecord::from_columns(&row),
            Err(GenerationError::Persistence(_))
        ));
    }

    #[test]
    fn legacy_status_words_parse() {
        assert_eq!(
            "success".parse::<GenerationStatus>().unwrap(),
            GenerationStatus::Completed
        );
        assert_eq!(
            "processing".parse::<GenerationStatus>().unwrap(),
            GenerationStatus::Generating
        );
    }
}

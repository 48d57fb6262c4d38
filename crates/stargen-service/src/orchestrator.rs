//! Generation orchestration.
//!
//! Drives a request through pricing, record creation, reservation,
//! dispatch and, for asynchronous providers, a polling monitor. Once stars
//! are reserved, every failure path refunds exactly once before the record
//! is marked failed. That includes a failed write of a later state, provider
//! callbacks reporting failure, and records left unfinished by a restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use stargen_core::{
    quote, validate_options, GenerationError, GenerationId, GenerationMode, GenerationRecord,
    GenerationStatus, JobHandle, ModelCatalog, ModelDescriptor, OutputRef, PriceOptions,
    PriceQuote, RateTable, RecordDetails, Result, UserId,
};
use stargen_providers::{DispatchOutcome, PollResult};

use crate::dispatch::{normalize_aspect_ratio, DispatchInput, Dispatcher};
use crate::ledger::{CreditLedger, Reservation};
use crate::persistence::GenerationRepository;
use crate::poller::{JobPoller, PollOutcome, StatusEvent};

/// A caller's generation request.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    /// Paying user.
    pub user_id: UserId,
    /// Model id or alias.
    pub model_id: String,
    /// User prompt.
    pub prompt: String,
    /// Pricing options.
    #[serde(default)]
    pub options: PriceOptions,
    /// Requested aspect ratio.
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    /// Reference image URLs.
    #[serde(default)]
    pub reference_images: Vec<String>,
    /// Generation mode; must be one the model lists.
    #[serde(default)]
    pub mode: Option<GenerationMode>,
}

/// What the caller gets back from a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    /// New record id.
    pub generation_id: GenerationId,
    /// Status right after dispatch.
    pub status: GenerationStatus,
    /// Stars reserved for the request.
    pub charged_stars: i64,
}

/// Where a provider callback left its generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallbackAck {
    /// Generation bound to the task.
    pub generation_id: GenerationId,
    /// Stored status once the callback was handled.
    pub status: GenerationStatus,
}

/// Runs generations end to end.
pub struct Orchestrator {
    catalog: Arc<ModelCatalog>,
    rates: RateTable,
    ledger: CreditLedger,
    repository: Arc<GenerationRepository>,
    dispatcher: Dispatcher,
    poller: Arc<JobPoller>,
}

impl Orchestrator {
    /// Wire an orchestrator from its parts.
    #[must_use]
    pub fn new(
        catalog: Arc<ModelCatalog>,
        rates: RateTable,
        ledger: CreditLedger,
        repository: Arc<GenerationRepository>,
        dispatcher: Dispatcher,
        poller: Arc<JobPoller>,
    ) -> Self {
        Self {
            catalog,
            rates,
            ledger,
            repository,
            dispatcher,
            poller,
        }
    }

    /// Price a request without side effects.
    #[must_use]
    pub fn quote(&self, model_id: &str, options: &PriceOptions) -> PriceQuote {
        quote(&self.catalog, model_id, options, &self.rates)
    }

    /// Load a record.
    pub async fn get(&self, id: &GenerationId) -> Result<Option<GenerationRecord>> {
        self.repository.get(id).await
    }

    /// Submit a generation.
    ///
    /// Returns after dispatch. Asynchronous jobs keep running in a monitor
    /// that finalizes the record later.
    pub async fn submit(self: &Arc<Self>, request: GenerationRequest) -> Result<Submission> {
        let model = self
            .catalog
            .get(&request.model_id)
            .ok_or_else(|| GenerationError::UnknownModel {
                model_id: request.model_id.clone(),
            })?;
        let aspect_ratio = validate_request(model, &request)?;

        let quote = self.quote(&model.id, &request.options);
        if !quote.is_available() {
            return Err(GenerationError::Validation(format!(
                "model {} cannot be priced with these options",
                model.id
            )));
        }

        let mut record = GenerationRecord::queued(
            request.user_id,
            model.category,
            model.id.clone(),
            RecordDetails {
                model_name: model.name.clone(),
                variant: request.options.model_variant.clone(),
                prompt: request.prompt.trim().to_string(),
                aspect_ratio: aspect_ratio.clone(),
                resolution: request
                    .options
                    .quality
                    .clone()
                    .or_else(|| request.options.resolution.clone()),
            },
            &quote,
        );
        self.repository.insert(&record).await?;

        self.reserve(&record).await?;

        let dispatched = self
            .dispatcher
            .dispatch(
                model,
                &request.options,
                &DispatchInput {
                    prompt: &record.prompt,
                    aspect_ratio: aspect_ratio.as_deref(),
                    reference_images: &request.reference_images,
                    mode: request.mode,
                },
            )
            .await;

        match dispatched {
            Err(err) => Err(self.fail(&mut record, err).await),
            Ok((_, DispatchOutcome::Completed { outputs })) => {
                self.complete(&mut record, outputs).await?;
                Ok(Submission::from(&record))
            }
            Ok((provider, DispatchOutcome::Submitted { task_id })) => {
                let mut next = record.clone();
                if let Err(err) = next.mark_generating(JobHandle { provider, task_id }) {
                    return Err(self.fail(&mut record, err).await);
                }
                self.advance(&mut record, next).await?;
                self.poller.publish(StatusEvent::now(
                    record.id,
                    record.user_id,
                    GenerationStatus::Generating,
                ));

                let submission = Submission::from(&record);
                let orchestrator = Arc::clone(self);
                self.poller
                    .spawn_monitor(record.id, async move { orchestrator.monitor(record).await })
                    .await;
                Ok(submission)
            }
        }
    }

    async fn reserve(&self, record: &GenerationRecord) -> Result<()> {
        let stars = record.charged_stars();
        let metadata = json!({
            "model_id": record.model_id,
            "variant": record.variant,
            "sku": record.sku,
            "pricing_version": record.pricing_version,
        });

        let outcome = self
            .ledger
            .reserve(&record.user_id, &record.id, stars, metadata)
            .await;

        let err = match outcome {
            Ok(Reservation::Reserved { .. }) => return Ok(()),
            Ok(Reservation::Insufficient { balance }) => GenerationError::InsufficientCredits {
                balance,
                required: stars,
            },
            Err(err) => err,
        };

        if let Err(delete_err) = self.repository.delete(&record.id).await {
            tracing::error!(
                generation_id = %record.id,
                error = %delete_err,
                "Failed to discard uncharged generation record"
            );
        }
        Err(err)
    }

    /// Persist `next` as the successor of the charged `current`.
    ///
    /// A failed write refunds and marks `current` failed. A write refused
    /// because the stored record is already final changes nothing.
    async fn advance(&self, current: &mut GenerationRecord, next: GenerationRecord) -> Result<()> {
        match self.repository.update(&next).await {
            Ok(()) => {
                *current = next;
                Ok(())
            }
            Err(err @ GenerationError::InvalidTransition { .. }) => {
                tracing::warn!(
                    generation_id = %current.id,
                    error = %err,
                    "Generation already finalized, keeping stored state"
                );
                Err(err)
            }
            Err(err) => {
                tracing::error!(
                    generation_id = %current.id,
                    status = %next.status(),
                    error = %err,
                    "Failed to persist charged generation"
                );
                Err(self.fail(current, err).await)
            }
        }
    }

    async fn complete(&self, record: &mut GenerationRecord, outputs: Vec<OutputRef>) -> Result<()> {
        if outputs.is_empty() {
            let err = GenerationError::ProviderTerminalFailure {
                message: "provider returned no outputs".into(),
            };
            return Err(self.fail(record, err).await);
        }

        let mut next = record.clone();
        if let Err(err) = next.mark_completed(outputs) {
            return Err(self.fail(record, err).await);
        }
        self.advance(record, next).await?;

        tracing::info!(
            generation_id = %record.id,
            outputs = record.outputs.len(),
            "Generation completed"
        );
        self.publish_completed(record);
        Ok(())
    }

    async fn monitor(self: Arc<Self>, mut record: GenerationRecord) {
        let Some(job) = record.job.clone() else {
            return;
        };

        match self.poller.run(record.id, record.user_id, &job).await {
            PollOutcome::Completed(outputs) => {
                // Failures are refunded and logged inside.
                let _ = self.complete(&mut record, outputs).await;
            }
            PollOutcome::Failed(err) => {
                self.fail(&mut record, err).await;
            }
        }
    }

    /// Apply a task status pushed by the provider.
    ///
    /// A running monitor takes the status over; without one the record is
    /// finalized here. Returns `None` when no generation owns `task_id`.
    pub async fn handle_callback(
        &self,
        task_id: &str,
        result: PollResult,
    ) -> Result<Option<CallbackAck>> {
        let Some(mut record) = self.repository.find_by_task(task_id).await? else {
            tracing::warn!(task_id, "Callback for unknown task");
            return Ok(None);
        };
        let generation_id = record.id;
        let ack = |status| Some(CallbackAck { generation_id, status });

        if record.status().is_terminal() {
            tracing::info!(
                generation_id = %generation_id,
                task_id,
                status = %record.status(),
                "Callback for finished generation ignored"
            );
            return Ok(ack(record.status()));
        }
        if !result.is_terminal() {
            return Ok(ack(record.status()));
        }
        if self.poller.deliver(&generation_id, result.clone()).await {
            tracing::debug!(generation_id = %generation_id, task_id, "Callback handed to monitor");
            return Ok(ack(record.status()));
        }

        tracing::info!(
            generation_id = %generation_id,
            task_id,
            status = %result.status,
            "Finalizing generation from callback"
        );
        if result.status == GenerationStatus::Completed {
            // Failures are refunded and logged inside.
            let _ = self.complete(&mut record, result.outputs).await;
        } else {
            let err = GenerationError::ProviderTerminalFailure {
                message: result
                    .error
                    .unwrap_or_else(|| "provider reported failure".into()),
            };
            self.fail(&mut record, err).await;
        }

        let stored = self.repository.get(&generation_id).await?;
        Ok(ack(stored.map_or(record.status(), |r| r.status())))
    }

    /// Fail and refund records left in `queued` or `generating` for longer
    /// than `stale_after`, at most `batch_size` per call.
    ///
    /// Records a live monitor still owns are skipped. Returns how many
    /// records were failed.
    pub async fn sweep_stale(&self, stale_after: Duration, batch_size: usize) -> Result<usize> {
        let age = chrono::Duration::from_std(stale_after)
            .map_err(|e| GenerationError::Configuration(format!("stale threshold: {e}")))?;
        let minutes = stale_after.as_secs() / 60;
        let stale = self.repository.unfinished(Utc::now() - age, batch_size).await?;

        let mut failed = 0;
        for mut record in stale {
            if self.poller.is_monitoring(&record.id).await {
                continue;
            }
            let err = GenerationError::Stuck {
                status: record.status(),
                minutes,
            };
            self.fail(&mut record, err).await;
            failed += 1;
        }

        if failed > 0 {
            tracing::info!(failed, minutes, "Failed stuck generations");
        }
        Ok(failed)
    }

    /// Refund the charge, then mark the record failed.
    async fn fail(&self, record: &mut GenerationRecord, err: GenerationError) -> GenerationError {
        tracing::warn!(
            generation_id = %record.id,
            code = err.code(),
            error = %err,
            "Generation failed"
        );
        if let Ok(Some(stored)) = self.repository.get(&record.id).await {
            if stored.status().is_terminal() {
                tracing::warn!(
                    generation_id = %record.id,
                    status = %stored.status(),
                    "Generation already finalized, leaving charge as is"
                );
                return err;
            }
        }
        self.refund(record, &err).await;

        match record.mark_failed(&err) {
            Ok(()) => {
                if let Err(update_err) = self.repository.update(record).await {
                    tracing::error!(
                        generation_id = %record.id,
                        error = %update_err,
                        "Failed to persist failed generation"
                    );
                }
            }
            Err(transition_err) => {
                tracing::error!(generation_id = %record.id, error = %transition_err, "Cannot mark generation failed");
            }
        }

        let mut event = StatusEvent::now(record.id, record.user_id, GenerationStatus::Failed);
        event.error = Some(err.to_string());
        self.poller.publish(event);
        err
    }

    async fn refund(&self, record: &GenerationRecord, err: &GenerationError) {
        let metadata = json!({
            "error_code": err.code(),
            "model_id": record.model_id,
            "sku": record.sku,
        });
        if let Err(refund_err) = self
            .ledger
            .refund(
                &record.user_id,
                &record.id,
                record.charged_stars(),
                &err.to_string(),
                metadata,
            )
            .await
        {
            tracing::error!(
                generation_id = %record.id,
                stars = record.charged_stars(),
                error = %refund_err,
                "Refund failed"
            );
        }
    }

    fn publish_completed(&self, record: &GenerationRecord) {
        let mut event = StatusEvent::now(record.id, record.user_id, GenerationStatus::Completed);
        event.outputs.clone_from(&record.outputs);
        self.poller.publish(event);
    }
}

impl From<&GenerationRecord> for Submission {
    fn from(record: &GenerationRecord) -> Self {
        Self {
            generation_id: record.id,
            status: record.status(),
            charged_stars: record.charged_stars(),
        }
    }
}

/// Check a request against the model and return the aspect ratio to use.
fn validate_request(
    model: &ModelDescriptor,
    request: &GenerationRequest,
) -> Result<Option<String>> {
    if request.prompt.trim().is_empty() {
        return Err(GenerationError::Validation("prompt must not be empty".into()));
    }
    validate_options(model, &request.options)?;

    let allowed = &model.options.aspect_ratios;
    let aspect_ratio = request
        .aspect_ratio
        .as_deref()
        .and_then(normalize_aspect_ratio)
        .or_else(|| (!allowed.is_empty()).then(|| model.default_aspect_ratio().to_string()));
    if let Some(ratio) = &aspect_ratio {
        if !allowed.is_empty() && ratio != "auto" && !allowed.contains(ratio) {
            return Err(GenerationError::Validation(format!(
                "aspect ratio {ratio} is not supported by {}",
                model.id
            )));
        }
    }

    let modes = &model.options.modes;
    if let Some(mode) = request.mode {
        if !modes.is_empty() && !modes.contains(&mode) {
            return Err(GenerationError::Validation(format!(
                "{} does not support mode {}",
                model.id,
                mode_name(mode)
            )));
        }
        if mode.uses_reference_images() && request.reference_images.is_empty() {
            return Err(GenerationError::Validation(format!(
                "mode {} needs at least one reference image",
                mode_name(mode)
            )));
        }
    }
    if !request.reference_images.is_empty()
        && !modes.is_empty()
        && !modes.iter().any(|m| m.uses_reference_images())
    {
        return Err(GenerationError::Validation(format!(
            "{} does not accept reference images",
            model.id
        )));
    }

    Ok(aspect_ratio)
}

fn mode_name(mode: GenerationMode) -> String {
    serde_json::to_value(mode)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{mode:?}"))
}

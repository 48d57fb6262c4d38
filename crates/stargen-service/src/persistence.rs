//! Generation record persistence.
//!
//! The generations table may lag behind the record shape while a migration
//! rolls out. Optional columns the table lacks are stripped from every
//! write; the set of missing columns is probed once and then extended
//! whenever the store rejects a column by name.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use stargen_core::{
    columns, ColumnMap, GenerationError, GenerationId, GenerationRecord, GenerationStatus, Result,
};
use stargen_store::{schema, Store, StoreError};

/// Reads and writes generation records with schema-drift tolerance.
pub struct GenerationRepository {
    store: Arc<dyn Store>,
    missing: RwLock<BTreeSet<String>>,
    probed: RwLock<bool>,
    max_attempts: u32,
}

fn persistence_error(err: StoreError) -> GenerationError {
    GenerationError::Persistence(err.to_string())
}

impl GenerationRepository {
    /// Create a repository. `max_attempts` bounds write attempts per call.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, max_attempts: u32) -> Self {
        Self {
            store,
            missing: RwLock::new(BTreeSet::new()),
            probed: RwLock::new(false),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Discover which optional columns the table lacks.
    ///
    /// Runs at most once per process; later calls return the cached set.
    pub async fn probe_columns(&self) -> Result<BTreeSet<String>> {
        let mut probed = self.probed.write().await;
        if !*probed {
            let present = self
                .store
                .generation_columns()
                .await
                .map_err(persistence_error)?;

            if let Some(required) = schema::REQUIRED_COLUMNS
                .iter()
                .find(|c| !present.contains(**c))
            {
                return Err(GenerationError::Persistence(format!(
                    "generations table lacks required column {required}"
                )));
            }

            let absent: BTreeSet<String> = schema::OPTIONAL_COLUMNS
                .iter()
                .filter(|c| !present.contains(**c))
                .map(|c| (*c).to_string())
                .collect();
            if !absent.is_empty() {
                tracing::warn!(columns = ?absent, "Generations table is missing optional columns");
            }
            self.missing.write().await.extend(absent);
            *probed = true;
        }
        Ok(self.missing.read().await.clone())
    }

    /// Optional columns currently known to be missing.
    pub async fn missing_columns(&self) -> BTreeSet<String> {
        self.missing.read().await.clone()
    }

    /// Insert a new record.
    ///
    /// A missing owner profile is provisioned once and the insert retried.
    pub async fn insert(&self, record: &GenerationRecord) -> Result<()> {
        self.probe_columns().await?;

        let mut row = record.to_columns();
        let mut provisioned = false;

        for attempt in 1..=self.max_attempts {
            self.strip_missing(&mut row).await;

            match self.store.insert_generation(&row).await {
                Ok(()) => {
                    tracing::debug!(generation_id = %record.id, attempt, "Generation record inserted");
                    return Ok(());
                }
                Err(StoreError::UnknownColumn { column }) => {
                    self.forget_column(&column).await?;
                }
                Err(StoreError::ForeignKeyViolation { constraint, .. }) if !provisioned => {
                    tracing::warn!(
                        user_id = %record.user_id,
                        constraint = ?constraint,
                        "Owner profile missing, provisioning"
                    );
                    self.store
                        .ensure_profile(&record.user_id)
                        .await
                        .map_err(persistence_error)?;
                    provisioned = true;
                }
                Err(err) => return Err(persistence_error(err)),
            }
        }

        Err(GenerationError::Persistence(format!(
            "insert of generation {} gave up after {} attempts",
            record.id, self.max_attempts
        )))
    }

    /// Write the record's current state.
    ///
    /// Refused with `InvalidTransition` when the stored record is already
    /// terminal.
    pub async fn update(&self, record: &GenerationRecord) -> Result<()> {
        if let Some(stored) = self.stored_status(&record.id).await? {
            if stored.is_terminal() {
                return Err(GenerationError::InvalidTransition {
                    from: stored,
                    to: record.status(),
                });
            }
        }

        let mut row = record.to_columns();
        for immutable in [columns::ID, columns::USER_ID, columns::CREATED_AT] {
            row.remove(immutable);
        }

        for _ in 0..self.max_attempts {
            self.strip_missing(&mut row).await;
            match self.store.update_generation(&record.id, &row).await {
                Ok(()) => {
                    tracing::debug!(
                        generation_id = %record.id,
                        status = %record.status(),
                        "Generation record updated"
                    );
                    return Ok(());
                }
                Err(StoreError::UnknownColumn { column }) => self.forget_column(&column).await?,
                Err(err) => return Err(persistence_error(err)),
            }
        }

        Err(GenerationError::Persistence(format!(
            "update of generation {} gave up after {} attempts",
            record.id, self.max_attempts
        )))
    }

    /// Remove a record that never got charged.
    pub async fn delete(&self, id: &GenerationId) -> Result<()> {
        self.store
            .delete_generation(id)
            .await
            .map_err(persistence_error)
    }

    /// Load a record.
    pub async fn get(&self, id: &GenerationId) -> Result<Option<GenerationRecord>> {
        match self
            .store
            .get_generation(id)
            .await
            .map_err(persistence_error)?
        {
            Some(row) => GenerationRecord::from_columns(&row).map(Some),
            None => Ok(None),
        }
    }

    /// Most recent record bound to a provider task.
    pub async fn find_by_task(&self, task_id: &str) -> Result<Option<GenerationRecord>> {
        self.store
            .find_generation_by_task(task_id)
            .await
            .map_err(persistence_error)?
            .map(|row| GenerationRecord::from_columns(&row))
            .transpose()
    }

    /// Queued or generating records created before `created_before`,
    /// oldest first.
    pub async fn unfinished(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationRecord>> {
        self.store
            .unfinished_generations(created_before, limit)
            .await
            .map_err(persistence_error)?
            .iter()
            .map(GenerationRecord::from_columns)
            .collect()
    }

    async fn stored_status(&self, id: &GenerationId) -> Result<Option<GenerationStatus>> {
        let row = self
            .store
            .get_generation(id)
            .await
            .map_err(persistence_error)?;
        row.as_ref()
            .and_then(|r| r.get(columns::STATUS))
            .and_then(serde_json::Value::as_str)
            .map(str::parse)
            .transpose()
    }

    async fn strip_missing(&self, row: &mut ColumnMap) {
        let missing = self.missing.read().await;
        row.retain(|column, _| !missing.contains(column));
    }

    async fn forget_column(&self, column: &str) -> Result<()> {
        if !schema::is_optional(column) {
            return Err(GenerationError::Persistence(format!(
                "store rejected required column {column}"
            )));
        }
        let mut missing = self.missing.write().await;
        if !missing.insert(column.to_string()) {
            return Err(GenerationError::Persistence(format!(
                "store rejected column {column} after it was stripped"
            )));
        }
        tracing::warn!(column, "Column missing from generations table, dropping it from writes");
        Ok(())
    }
}

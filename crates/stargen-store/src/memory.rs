//! In-memory store.
//!
//! Behaves like the PostgreSQL backend for everything the orchestrator
//! relies on: guarded balance updates, unknown-column rejection, and
//! foreign-key enforcement on the owning profile. The last two are opt-in
//! so tests can reproduce a schema mid-rollout. A few knobs inject write
//! failures and stale reads for exercising recovery paths.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use stargen_core::{columns, ColumnMap, CreditTransaction, GenerationId, TransactionType, UserId};

use crate::error::{Result, StoreError};
use crate::schema;
use crate::Store;

#[derive(Default)]
struct Inner {
    balances: HashMap<UserId, i64>,
    transactions: Vec<CreditTransaction>,
    generations: HashMap<GenerationId, ColumnMap>,
    profiles: HashSet<UserId>,
    insert_attempts: usize,
    column_probes: usize,
    forced_cas_conflicts: usize,
    failing_inserts: usize,
    failing_updates: usize,
    stale_refund_reads: usize,
}

/// A [`Store`] kept entirely in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    missing_columns: BTreeSet<String>,
    enforce_profiles: bool,
}

impl MemoryStore {
    /// A store with the full schema and no profile enforcement.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a generations table that lacks the given columns.
    #[must_use]
    pub fn with_missing_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.missing_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Reject generation inserts whose owner has no profile row.
    #[must_use]
    pub fn with_profile_enforcement(mut self) -> Self {
        self.enforce_profiles = true;
        self
    }

    /// Make the next `count` compare-and-swap calls lose to a phantom writer.
    pub async fn force_cas_conflicts(&self, count: usize) {
        self.inner.lock().await.forced_cas_conflicts = count;
    }

    /// Make the next `count` generation inserts fail with a database error.
    pub async fn fail_next_inserts(&self, count: usize) {
        self.inner.lock().await.failing_inserts = count;
    }

    /// Make the next `count` generation updates fail with a database error.
    pub async fn fail_next_updates(&self, count: usize) {
        self.inner.lock().await.failing_updates = count;
    }

    /// Make the next `count` refund lookups miss, as if a concurrent refund
    /// committed right after the read.
    pub async fn miss_next_refund_reads(&self, count: usize) {
        self.inner.lock().await.stale_refund_reads = count;
    }

    /// Overwrite columns of a stored row, bypassing every check.
    pub async fn patch_generation(&self, id: &GenerationId, patch: ColumnMap) {
        if let Some(row) = self.inner.lock().await.generations.get_mut(id) {
            row.extend(patch);
        }
    }

    /// Number of generation inserts attempted, including rejected ones.
    pub async fn insert_attempts(&self) -> usize {
        self.inner.lock().await.insert_attempts
    }

    /// Number of times the column set was probed.
    pub async fn column_probes(&self) -> usize {
        self.inner.lock().await.column_probes
    }

    /// Number of generation rows currently stored.
    pub async fn generation_count(&self) -> usize {
        self.inner.lock().await.generations.len()
    }

    /// Whether a profile row exists.
    pub async fn has_profile(&self, user_id: &UserId) -> bool {
        self.inner.lock().await.profiles.contains(user_id)
    }

    /// All ledger entries for one generation, oldest first.
    pub async fn transactions_for(&self, generation_id: &GenerationId) -> Vec<CreditTransaction> {
        self.inner
            .lock()
            .await
            .transactions
            .iter()
            .filter(|t| t.generation_id.as_ref() == Some(generation_id))
            .cloned()
            .collect()
    }

    fn reject_unknown(&self, row: &ColumnMap) -> Result<()> {
        match row.keys().find(|c| self.missing_columns.contains(*c)) {
            Some(column) => Err(StoreError::UnknownColumn {
                column: column.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn is_refund_of(transaction: &CreditTransaction, generation_id: &GenerationId) -> bool {
    transaction.transaction_type == TransactionType::Refund
        && transaction.generation_id.as_ref() == Some(generation_id)
}

fn created_at(row: &ColumnMap) -> Option<DateTime<Utc>> {
    row.get(columns::CREATED_AT)
        .and_then(serde_json::Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_balance(&self, user_id: &UserId) -> Result<Option<i64>> {
        Ok(self.inner.lock().await.balances.get(user_id).copied())
    }

    async fn ensure_account(&self, user_id: &UserId, starting_balance: i64) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        Ok(*inner
            .balances
            .entry(*user_id)
            .or_insert(starting_balance.max(0)))
    }

    async fn compare_and_swap(&self, user_id: &UserId, expected: i64, new: i64) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.forced_cas_conflicts > 0 {
            inner.forced_cas_conflicts -= 1;
            return Ok(false);
        }

        let balance = inner
            .balances
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "account",
                id: user_id.to_string(),
            })?;

        if *balance != expected || new < 0 {
            return Ok(false);
        }
        *balance = new;
        Ok(true)
    }

    async fn append_transaction(&self, transaction: &CreditTransaction) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if transaction.transaction_type == TransactionType::Refund {
            if let Some(generation_id) = transaction.generation_id {
                if inner.transactions.iter().any(|t| is_refund_of(t, &generation_id)) {
                    return Err(StoreError::Conflict(format!(
                        "generation {generation_id} already refunded"
                    )));
                }
            }
        }
        inner.transactions.push(transaction.clone());
        Ok(())
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == *user_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_refund(&self, generation_id: &GenerationId) -> Result<Option<CreditTransaction>> {
        let mut inner = self.inner.lock().await;
        if inner.stale_refund_reads > 0 {
            inner.stale_refund_reads -= 1;
            return Ok(None);
        }
        Ok(inner
            .transactions
            .iter()
            .find(|t| is_refund_of(t, generation_id))
            .cloned())
    }

    async fn insert_generation(&self, row: &ColumnMap) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.insert_attempts += 1;
        if inner.failing_inserts > 0 {
            inner.failing_inserts -= 1;
            return Err(StoreError::Database("injected insert failure".into()));
        }
        self.reject_unknown(row)?;

        let id: GenerationId = row
            .get(columns::ID)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| StoreError::Serialization("generation row has no id".into()))?
            .parse()
            .map_err(|e| StoreError::Serialization(format!("{e}")))?;

        if self.enforce_profiles {
            let owner: Option<UserId> = row
                .get(columns::USER_ID)
                .and_then(serde_json::Value::as_str)
                .and_then(|s| s.parse().ok());
            if !owner.is_some_and(|u| inner.profiles.contains(&u)) {
                return Err(StoreError::ForeignKeyViolation {
                    constraint: Some("generations_user_id_fkey".into()),
                    message: "insert or update on table \"generations\" violates foreign key constraint".into(),
                });
            }
        }

        if inner.generations.contains_key(&id) {
            return Err(StoreError::Conflict(format!("generation {id} already exists")));
        }
        inner.generations.insert(id, row.clone());
        Ok(())
    }

    async fn update_generation(&self, id: &GenerationId, row: &ColumnMap) -> Result<()> {
        self.reject_unknown(row)?;
        let mut inner = self.inner.lock().await;
        if inner.failing_updates > 0 {
            inner.failing_updates -= 1;
            return Err(StoreError::Database("injected update failure".into()));
        }
        let existing = inner
            .generations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "generation",
                id: id.to_string(),
            })?;
        existing.extend(row.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn delete_generation(&self, id: &GenerationId) -> Result<()> {
        self.inner
            .lock()
            .await
            .generations
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                entity: "generation",
                id: id.to_string(),
            })
    }

    async fn get_generation(&self, id: &GenerationId) -> Result<Option<ColumnMap>> {
        Ok(self.inner.lock().await.generations.get(id).cloned())
    }

    async fn generation_columns(&self) -> Result<BTreeSet<String>> {
        self.inner.lock().await.column_probes += 1;
        Ok(schema::all_columns()
            .filter(|c| !self.missing_columns.contains(*c))
            .map(str::to_string)
            .collect())
    }

    async fn find_generation_by_task(&self, task_id: &str) -> Result<Option<ColumnMap>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .generations
            .values()
            .find(|row| {
                row.get(columns::TASK_ID).and_then(serde_json::Value::as_str) == Some(task_id)
            })
            .cloned())
    }

    async fn unfinished_generations(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ColumnMap>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<(DateTime<Utc>, &ColumnMap)> = inner
            .generations
            .values()
            .filter(|row| {
                matches!(
                    row.get(columns::STATUS).and_then(serde_json::Value::as_str),
                    Some("queued" | "generating")
                )
            })
            .filter_map(|row| created_at(row).map(|at| (at, row)))
            .filter(|(at, _)| *at < created_before)
            .collect();
        rows.sort_by_key(|(at, _)| *at);
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn ensure_profile(&self, user_id: &UserId) -> Result<()> {
        self.inner.lock().await.profiles.insert(*user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: GenerationId, user_id: UserId) -> ColumnMap {
        let mut row = ColumnMap::new();
        row.insert("id".into(), json!(id.to_string()));
        row.insert("user_id".into(), json!(user_id.to_string()));
        row.insert("type".into(), json!("photo"));
        row.insert("model_id".into(), json!("nano-banana"));
        row.insert("status".into(), json!("queued"));
        row
    }

    #[tokio::test]
    async fn cas_succeeds_only_on_expected_value() {
        let store = MemoryStore::new();
        let user = UserId::generate();
        assert_eq!(store.ensure_account(&user, 50).await.unwrap(), 50);

        assert!(!store.compare_and_swap(&user, 49, 40).await.unwrap());
        assert!(store.compare_and_swap(&user, 50, 40).await.unwrap());
        assert_eq!(store.get_balance(&user).await.unwrap(), Some(40));
    }

    #[tokio::test]
    async fn cas_refuses_negative_balance() {
        let store = MemoryStore::new();
        let user = UserId::generate();
        store.ensure_account(&user, 5).await.unwrap();
        assert!(!store.compare_and_swap(&user, 5, -1).await.unwrap());
    }

    #[tokio::test]
    async fn cas_on_missing_account_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .compare_and_swap(&UserId::generate(), 0, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "account", .. }));
    }

    #[tokio::test]
    async fn ensure_account_keeps_existing_balance() {
        let store = MemoryStore::new();
        let user = UserId::generate();
        store.ensure_account(&user, 10).await.unwrap();
        assert_eq!(store.ensure_account(&user, 999).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn missing_column_is_reported_by_name() {
        let store = MemoryStore::new().with_missing_columns(["metadata"]);
        let mut row = row(GenerationId::generate(), UserId::generate());
        row.insert("metadata".into(), json!({}));

        let err = store.insert_generation(&row).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownColumn { column } if column == "metadata"));
        assert_eq!(store.insert_attempts().await, 1);
    }

    #[tokio::test]
    async fn profile_enforcement_rejects_orphans() {
        let store = MemoryStore::new().with_profile_enforcement();
        let user = UserId::generate();
        let id = GenerationId::generate();

        let err = store.insert_generation(&row(id, user)).await.unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation { .. }));

        store.ensure_profile(&user).await.unwrap();
        store.insert_generation(&row(id, user)).await.unwrap();
        assert!(store.get_generation(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_merges_columns() {
        let store = MemoryStore::new();
        let id = GenerationId::generate();
        store
            .insert_generation(&row(id, UserId::generate()))
            .await
            .unwrap();

        let mut patch = ColumnMap::new();
        patch.insert("status".into(), json!("generating"));
        patch.insert("task_id".into(), json!("t-1"));
        store.update_generation(&id, &patch).await.unwrap();

        let stored = store.get_generation(&id).await.unwrap().unwrap();
        assert_eq!(stored["status"], "generating");
        assert_eq!(stored["model_id"], "nano-banana");
    }

    #[tokio::test]
    async fn transactions_list_newest_first() {
        let store = MemoryStore::new();
        let user = UserId::generate();
        for amount in [1, 2, 3] {
            store
                .append_transaction(&CreditTransaction::grant(user, amount, amount, "t".into()))
                .await
                .unwrap();
        }
        let listed = store.list_transactions(&user, 2, 0).await.unwrap();
        assert_eq!(listed.iter().map(|t| t.amount).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[tokio::test]
    async fn column_probe_omits_missing_columns() {
        let store = MemoryStore::new().with_missing_columns(["sku", "pricing_version"]);
        let columns = store.generation_columns().await.unwrap();
        assert!(columns.contains("status"));
        assert!(!columns.contains("sku"));
        assert_eq!(store.column_probes().await, 1);
    }

    #[tokio::test]
    async fn second_refund_for_a_generation_conflicts() {
        let store = MemoryStore::new();
        let user = UserId::generate();
        let generation = GenerationId::generate();
        let refund = || {
            CreditTransaction::refund(user, generation, 40, 40, "failed".into(), json!(null))
        };

        store.append_transaction(&refund()).await.unwrap();
        let err = store.append_transaction(&refund()).await.unwrap_err();

        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.transactions_for(&generation).await.len(), 1);
    }

    #[tokio::test]
    async fn finds_rows_by_task_id() {
        let store = MemoryStore::new();
        let id = GenerationId::generate();
        let mut row = row(id, UserId::generate());
        row.insert("task_id".into(), json!("task-77"));
        store.insert_generation(&row).await.unwrap();

        let found = store.find_generation_by_task("task-77").await.unwrap().unwrap();
        assert_eq!(found["id"], id.to_string());
        assert!(store.find_generation_by_task("task-78").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unfinished_rows_older_than_cutoff() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for (status, age_minutes) in [("generating", 300), ("queued", 200), ("completed", 400), ("generating", 5)] {
            let id = GenerationId::generate();
            let mut row = row(id, UserId::generate());
            row.insert("status".into(), json!(status));
            row.insert(
                "created_at".into(),
                json!((now - chrono::Duration::minutes(age_minutes)).to_rfc3339()),
            );
            store.insert_generation(&row).await.unwrap();
            ids.push(id.to_string());
        }

        let stale = store
            .unfinished_generations(now - chrono::Duration::minutes(60), 10)
            .await
            .unwrap();
        let stale: Vec<_> = stale.iter().map(|r| r["id"].as_str().unwrap().to_string()).collect();
        assert_eq!(stale, vec![ids[0].clone(), ids[1].clone()]);
    }

    #[tokio::test]
    async fn injected_write_failures_are_consumed() {
        let store = MemoryStore::new();
        let id = GenerationId::generate();
        store.fail_next_inserts(1).await;

        let err = store
            .insert_generation(&row(id, UserId::generate()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
        store
            .insert_generation(&row(id, UserId::generate()))
            .await
            .unwrap();

        store.fail_next_updates(1).await;
        assert!(store.update_generation(&id, &ColumnMap::new()).await.is_err());
        store.update_generation(&id, &ColumnMap::new()).await.unwrap();
    }
}

//! Credit ledger.
//!
//! Every balance change is a compare-and-swap against the value just read,
//! retried a bounded number of times when another writer wins. A successful
//! swap is followed by a ledger entry.

use std::sync::Arc;

use stargen_core::{CreditTransaction, GenerationError, GenerationId, Result, UserId};
use stargen_store::{Store, StoreError};

/// Result of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Stars were deducted.
    Reserved {
        /// Balance after the deduction.
        balance_after: i64,
    },
    /// The balance does not cover the amount; nothing changed.
    Insufficient {
        /// Balance at the time of the check.
        balance: i64,
    },
}

/// Balance reads, reservations, refunds and grants.
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn Store>,
    max_cas_attempts: u32,
    starting_balance: i64,
}

fn ledger_error(err: StoreError) -> GenerationError {
    GenerationError::Ledger(err.to_string())
}

impl CreditLedger {
    /// Create a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, max_cas_attempts: u32, starting_balance: i64) -> Self {
        Self {
            store,
            max_cas_attempts: max_cas_attempts.max(1),
            starting_balance,
        }
    }

    /// Current balance, creating the account on first sight.
    pub async fn get_balance(&self, user_id: &UserId) -> Result<i64> {
        self.store
            .ensure_account(user_id, self.starting_balance)
            .await
            .map_err(ledger_error)
    }

    /// Deduct `stars` for a generation whose record already exists.
    pub async fn reserve(
        &self,
        user_id: &UserId,
        generation_id: &GenerationId,
        stars: i64,
        metadata: serde_json::Value,
    ) -> Result<Reservation> {
        if stars < 0 {
            return Err(GenerationError::Ledger(format!(
                "cannot reserve a negative amount: {stars}"
            )));
        }

        for attempt in 1..=self.max_cas_attempts {
            let balance = self.get_balance(user_id).await?;
            if balance < stars {
                return Ok(Reservation::Insufficient { balance });
            }

            let balance_after = balance - stars;
            if self.swap(user_id, balance, balance_after).await? {
                let entry = CreditTransaction::reservation(
                    *user_id,
                    *generation_id,
                    stars,
                    balance_after,
                    metadata,
                );
                self.append(&entry).await;
                tracing::info!(
                    user_id = %user_id,
                    generation_id = %generation_id,
                    stars,
                    balance_after,
                    "Stars reserved"
                );
                return Ok(Reservation::Reserved { balance_after });
            }
            tracing::warn!(user_id = %user_id, attempt, "Balance changed during reservation, retrying");
        }

        Err(self.contention(user_id))
    }

    /// Return the stars charged for a generation.
    ///
    /// A generation is refunded at most once: if a refund entry already
    /// exists it is returned and the balance is left alone.
    pub async fn refund(
        &self,
        user_id: &UserId,
        generation_id: &GenerationId,
        stars: i64,
        reason: &str,
        metadata: serde_json::Value,
    ) -> Result<CreditTransaction> {
        if let Some(existing) = self
            .store
            .find_refund(generation_id)
            .await
            .map_err(ledger_error)?
        {
            tracing::warn!(generation_id = %generation_id, "Refund already issued, skipping");
            return Ok(existing);
        }

        let stars = stars.abs();
        let balance_after = self.credit(user_id, stars).await?;
        let entry = CreditTransaction::refund(
            *user_id,
            *generation_id,
            stars,
            balance_after,
            reason.to_string(),
            metadata,
        );

        match self.store.append_transaction(&entry).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                // Lost a race with a concurrent refund of the same generation.
                self.debit_back(user_id, stars).await?;
                return self
                    .store
                    .find_refund(generation_id)
                    .await
                    .map_err(ledger_error)?
                    .ok_or_else(|| {
                        GenerationError::Ledger(format!(
                            "refund for {generation_id} conflicted but was not found"
                        ))
                    });
            }
            Err(err) => {
                tracing::error!(
                    generation_id = %generation_id,
                    error = %err,
                    "Refund applied but ledger entry not written"
                );
            }
        }

        tracing::info!(
            user_id = %user_id,
            generation_id = %generation_id,
            stars,
            balance_after,
            reason,
            "Stars refunded"
        );
        Ok(entry)
    }

    /// Add stars outside any generation.
    pub async fn grant(&self, user_id: &UserId, stars: i64, reason: &str) -> Result<CreditTransaction> {
        if stars <= 0 {
            return Err(GenerationError::Validation("grant amount must be positive".into()));
        }

        let balance_after = self.credit(user_id, stars).await?;
        let entry = CreditTransaction::grant(*user_id, stars, balance_after, reason.to_string());
        self.append(&entry).await;
        tracing::info!(user_id = %user_id, stars, balance_after, "Stars granted");
        Ok(entry)
    }

    /// Ledger entries for a user, newest first.
    pub async fn transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        self.store
            .list_transactions(user_id, limit, offset)
            .await
            .map_err(ledger_error)
    }

    async fn credit(&self, user_id: &UserId, stars: i64) -> Result<i64> {
        for attempt in 1..=self.max_cas_attempts {
            let balance = self.get_balance(user_id).await?;
            let balance_after = balance.checked_add(stars).ok_or_else(|| {
                GenerationError::Ledger(format!("balance overflow for {user_id}"))
            })?;
            if self.swap(user_id, balance, balance_after).await? {
                return Ok(balance_after);
            }
            tracing::warn!(user_id = %user_id, attempt, "Balance changed during credit, retrying");
        }
        Err(self.contention(user_id))
    }

    async fn debit_back(&self, user_id: &UserId, stars: i64) -> Result<()> {
        for _ in 0..self.max_cas_attempts {
            let balance = self.get_balance(user_id).await?;
            if self.swap(user_id, balance, (balance - stars).max(0)).await? {
                return Ok(());
            }
        }
        Err(self.contention(user_id))
    }

    async fn swap(&self, user_id: &UserId, expected: i64, new: i64) -> Result<bool> {
        self.store
            .compare_and_swap(user_id, expected, new)
            .await
            .map_err(ledger_error)
    }

    async fn append(&self, entry: &CreditTransaction) {
        if let Err(err) = self.store.append_transaction(entry).await {
            tracing::error!(
                transaction_id = %entry.id,
                user_id = %entry.user_id,
                error = %err,
                "Balance changed but ledger entry not written"
            );
        }
    }

    fn contention(&self, user_id: &UserId) -> GenerationError {
        tracing::error!(user_id = %user_id, attempts = self.max_cas_attempts, "Balance update gave up under contention");
        GenerationError::Ledger(format!(
            "balance for {user_id} kept changing; gave up after {} attempts",
            self.max_cas_attempts
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stargen_core::TransactionType;
    use stargen_store::MemoryStore;

    fn ledger(store: &Arc<MemoryStore>) -> CreditLedger {
        CreditLedger::new(store.clone(), 10, 0)
    }

    async fn funded(store: &Arc<MemoryStore>, stars: i64) -> UserId {
        let user = UserId::generate();
        ledger(store).grant(&user, stars, "test").await.unwrap();
        user
    }

    #[tokio::test]
    async fn reserve_deducts_and_logs() {
        let store = Arc::new(MemoryStore::new());
        let user = funded(&store, 500).await;
        let generation = GenerationId::generate();

        let result = ledger(&store)
            .reserve(&user, &generation, 368, serde_json::Value::Null)
            .await
            .unwrap();

        assert_eq!(result, Reservation::Reserved { balance_after: 132 });
        let entries = store.transactions_for(&generation).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, -368);
    }

    #[tokio::test]
    async fn reserve_never_goes_negative() {
        let store = Arc::new(MemoryStore::new());
        let user = funded(&store, 50).await;

        let result = ledger(&store)
            .reserve(&user, &GenerationId::generate(), 92, serde_json::Value::Null)
            .await
            .unwrap();

        assert_eq!(result, Reservation::Insufficient { balance: 50 });
        assert_eq!(ledger(&store).get_balance(&user).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn reserve_retries_through_contention() {
        let store = Arc::new(MemoryStore::new());
        let user = funded(&store, 100).await;
        store.force_cas_conflicts(3).await;

        let result = ledger(&store)
            .reserve(&user, &GenerationId::generate(), 40, serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(result, Reservation::Reserved { balance_after: 60 });
    }

    #[tokio::test]
    async fn reserve_gives_up_after_budget() {
        let store = Arc::new(MemoryStore::new());
        let user = funded(&store, 100).await;
        store.force_cas_conflicts(10).await;

        let err = ledger(&store)
            .reserve(&user, &GenerationId::generate(), 40, serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Ledger(_)));
        assert_eq!(ledger(&store).get_balance(&user).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn refund_happens_once() {
        let store = Arc::new(MemoryStore::new());
        let user = funded(&store, 100).await;
        let generation = GenerationId::generate();
        let ledger = ledger(&store);

        ledger
            .reserve(&user, &generation, 70, serde_json::Value::Null)
            .await
            .unwrap();
        let first = ledger
            .refund(&user, &generation, 70, "provider failure", serde_json::Value::Null)
            .await
            .unwrap();
        let second = ledger
            .refund(&user, &generation, 70, "provider failure", serde_json::Value::Null)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(ledger.get_balance(&user).await.unwrap(), 100);
        let refunds: Vec<_> = store
            .transactions_for(&generation)
            .await
            .into_iter()
            .filter(|t| t.transaction_type == TransactionType::Refund)
            .collect();
        assert_eq!(refunds.len(), 1);
    }

    #[tokio::test]
    async fn racing_refund_is_taken_back() {
        let store = Arc::new(MemoryStore::new());
        let user = funded(&store, 100).await;
        let generation = GenerationId::generate();
        let ledger = ledger(&store);

        ledger
            .reserve(&user, &generation, 70, serde_json::Value::Null)
            .await
            .unwrap();
        let first = ledger
            .refund(&user, &generation, 70, "timeout", serde_json::Value::Null)
            .await
            .unwrap();

        // The second refund does not see the first and writes its own entry.
        store.miss_next_refund_reads(1).await;
        let second = ledger
            .refund(&user, &generation, 70, "timeout", serde_json::Value::Null)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(ledger.get_balance(&user).await.unwrap(), 100);
        let refunds = store
            .transactions_for(&generation)
            .await
            .into_iter()
            .filter(|t| t.transaction_type == TransactionType::Refund)
            .count();
        assert_eq!(refunds, 1);
    }

    #[tokio::test]
    async fn new_accounts_get_starting_balance() {
        let store = Arc::new(MemoryStore::new());
        let ledger = CreditLedger::new(store, 10, 25);
        assert_eq!(ledger.get_balance(&UserId::generate()).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn grant_rejects_non_positive() {
        let store = Arc::new(MemoryStore::new());
        let err = ledger(&store)
            .grant(&UserId::generate(), 0, "nothing")
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Validation(_)));
    }
}

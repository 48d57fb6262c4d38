//! Ledger entry types for stargen.
//!
//! Every balance change appends an entry. Reservation entries are negative,
//! refunds and grants positive, so the sum of a user's entries equals the
//! net change of their balance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GenerationId, TransactionId, UserId};

/// A single balance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// Amount in stars. Positive = credit, Negative = debit.
    pub amount: i64,

    /// Type of transaction.
    pub transaction_type: TransactionType,

    /// Balance after this transaction.
    pub balance_after: i64,

    /// The generation this entry settles, if any.
    pub generation_id: Option<GenerationId>,

    /// Human-readable reason.
    pub description: String,

    /// Additional metadata (model, sku, error code).
    pub metadata: serde_json::Value,

    /// When the transaction was created.
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    /// Stars reserved for a generation.
    #[must_use]
    pub fn reservation(
        user_id: UserId,
        generation_id: GenerationId,
        stars: i64,
        balance_after: i64,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            amount: -stars.abs(),
            transaction_type: TransactionType::Reservation,
            balance_after,
            generation_id: Some(generation_id),
            description: format!("Reserved {stars} stars for generation {generation_id}"),
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Stars returned for a generation that did not complete.
    #[must_use]
    pub fn refund(
        user_id: UserId,
        generation_id: GenerationId,
        stars: i64,
        balance_after: i64,
        reason: String,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            amount: stars.abs(),
            transaction_type: TransactionType::Refund,
            balance_after,
            generation_id: Some(generation_id),
            description: reason,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Stars added outside a generation (purchase, promotion, admin top-up).
    #[must_use]
    pub fn grant(user_id: UserId, stars: i64, balance_after: i64, reason: String) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            amount: stars.abs(),
            transaction_type: TransactionType::Grant,
            balance_after,
            generation_id: None,
            description: reason,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }
}

/// Type of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Stars deducted before dispatch.
    Reservation,

    /// Stars returned after a failed or timed-out generation.
    Refund,

    /// Stars added by purchase or administration.
    Grant,
}

impl TransactionType {
    /// Value stored in the `transaction_type` column.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reservation => "reservation",
            Self::Refund => "refund",
            Self::Grant => "grant",
        }
    }

    /// Check if this entry adds stars.
    #[must_use]
    pub const fn is_credit(&self) -> bool {
        matches!(self, Self::Refund | Self::Grant)
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reservation" => Ok(Self::Reservation),
            "refund" => Ok(Self::Refund),
            "grant" => Ok(Self::Grant),
            other => Err(format!("unknown transaction type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_is_negative_and_linked() {
        let user_id = UserId::generate();
        let generation_id = GenerationId::generate();
        let tx = CreditTransaction::reservation(user_id, generation_id, 92, 908, serde_json::Value::Null);

        assert_eq!(tx.amount, -92);
        assert_eq!(tx.transaction_type, TransactionType::Reservation);
        assert_eq!(tx.generation_id, Some(generation_id));
        assert!(!tx.transaction_type.is_credit());
    }

    #[test]
    fn refund_is_positive_even_if_given_negative() {
        let tx = CreditTransaction::refund(
            UserId::generate(),
            GenerationId::generate(),
            -92,
            1000,
            "provider failure".into(),
            serde_json::json!({"code": "provider_failure"}),
        );
        assert_eq!(tx.amount, 92);
        assert!(tx.transaction_type.is_credit());
    }

    #[test]
    fn transaction_type_parses_its_column_value() {
        for ty in [
            TransactionType::Reservation,
            TransactionType::Refund,
            TransactionType::Grant,
        ] {
            assert_eq!(ty.as_str().parse::<TransactionType>(), Ok(ty));
        }
        assert!("usage".parse::<TransactionType>().is_err());
    }
}

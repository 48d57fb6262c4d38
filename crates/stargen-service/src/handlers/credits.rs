//! Credit balance, transaction and grant handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use stargen_core::{CreditTransaction, UserId};

use super::parse_user_id;
use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// The user.
    pub user_id: UserId,
    /// Balance in stars.
    pub balance: i64,
}

/// Get a user's star balance.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user_id = parse_user_id(&user_id)?;
    let balance = state.ledger.get_balance(&user_id).await?;

    Ok(Json(BalanceResponse { user_id, balance }))
}

/// Transaction list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    /// Maximum number of transactions to return (default: 50).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

/// Transaction response.
#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    /// Transaction ID.
    pub id: String,
    /// Amount in stars (positive = credit, negative = debit).
    pub amount: i64,
    /// Transaction type.
    pub transaction_type: String,
    /// Balance after this transaction.
    pub balance_after: i64,
    /// Generation the entry settles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
    /// Description.
    pub description: String,
    /// Additional details.
    pub metadata: serde_json::Value,
    /// Timestamp.
    pub created_at: String,
}

impl From<&CreditTransaction> for TransactionResponse {
    fn from(tx: &CreditTransaction) -> Self {
        Self {
            id: tx.id.to_string(),
            amount: tx.amount,
            transaction_type: tx.transaction_type.as_str().to_string(),
            balance_after: tx.balance_after,
            generation_id: tx.generation_id.map(|g| g.to_string()),
            description: tx.description.clone(),
            metadata: tx.metadata.clone(),
            created_at: tx.created_at.to_rfc3339(),
        }
    }
}

/// List transactions response.
#[derive(Debug, Serialize)]
pub struct ListTransactionsResponse {
    /// Transactions (newest first).
    pub transactions: Vec<TransactionResponse>,
    /// Whether there are more transactions.
    pub has_more: bool,
}

/// List a user's transaction history.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(user_id): Path<String>,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    let user_id = parse_user_id(&user_id)?;

    // Fetch one more than requested to determine has_more
    let limit = query.limit.min(100);
    let transactions = state
        .ledger
        .transactions(&user_id, limit + 1, query.offset)
        .await?;

    let has_more = transactions.len() > limit;
    let transactions: Vec<_> = transactions
        .iter()
        .take(limit)
        .map(TransactionResponse::from)
        .collect();

    Ok(Json(ListTransactionsResponse {
        transactions,
        has_more,
    }))
}

/// Grant credits request.
#[derive(Debug, Deserialize)]
pub struct GrantCreditsRequest {
    /// Stars to add.
    pub stars: i64,
    /// Reason recorded on the ledger entry.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Add stars to a user's balance (top-ups, promotions, support credits).
pub async fn grant_credits(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Path(user_id): Path<String>,
    Json(request): Json<GrantCreditsRequest>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let user_id = parse_user_id(&user_id)?;
    let reason = request
        .reason
        .unwrap_or_else(|| format!("Granted by {}", auth.service_name));

    let tx = state.ledger.grant(&user_id, request.stars, &reason).await?;

    tracing::info!(
        service = %auth.service_name,
        user_id = %user_id,
        stars = request.stars,
        "Credits granted"
    );

    Ok(Json(TransactionResponse::from(&tx)))
}

//! PostgreSQL store.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use stargen_core::{ColumnMap, CreditTransaction, GenerationId, UserId};

use crate::error::{Result, StoreError};
use crate::schema::{self, tables};
use crate::Store;

/// A [`Store`] backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(300))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: String,
    user_id: Uuid,
    amount: i64,
    transaction_type: String,
    balance_after: i64,
    generation_id: Option<Uuid>,
    description: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for CreditTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(Self {
            id: row
                .id
                .parse()
                .map_err(|e| StoreError::Serialization(format!("{e}")))?,
            user_id: UserId::from_uuid(row.user_id),
            amount: row.amount,
            transaction_type: row
                .transaction_type
                .parse()
                .map_err(StoreError::Serialization)?,
            balance_after: row.balance_after,
            generation_id: row.generation_id.map(GenerationId::from_uuid),
            description: row.description,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

const TRANSACTION_COLUMNS: &str =
    "id, user_id, amount, transaction_type, balance_after, generation_id, description, metadata, created_at";

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Text form of a column value; the SQL casts it to the column type.
fn bind_text(column: &str, value: &serde_json::Value) -> Option<String> {
    let is_json = schema::sql_cast(column) == "jsonb";
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if !is_json => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn build_insert(row: &ColumnMap) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(format!("INSERT INTO {} (", tables::GENERATIONS));
    let mut names = query.separated(", ");
    for column in row.keys() {
        names.push(quote_ident(column));
    }
    query.push(") VALUES (");
    let mut values = query.separated(", ");
    for (column, value) in row {
        values.push_bind(bind_text(column, value));
        values.push_unseparated(format!("::{}", schema::sql_cast(column)));
    }
    query.push(")");
    query
}

fn build_update(id: &GenerationId, row: &ColumnMap) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(format!("UPDATE {} SET ", tables::GENERATIONS));
    let mut assignments = query.separated(", ");
    for (column, value) in row {
        assignments.push(format!("{} = ", quote_ident(column)));
        assignments.push_bind_unseparated(bind_text(column, value));
        assignments.push_unseparated(format!("::{}", schema::sql_cast(column)));
    }
    query.push(" WHERE id = ");
    query.push_bind(*id.as_uuid());
    query
}

/// A generation row selected as `to_jsonb(g)`.
fn column_map(value: serde_json::Value) -> Result<ColumnMap> {
    match value {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(StoreError::Serialization(format!(
            "expected a JSON object for a generation row, got {other}"
        ))),
    }
}

fn page_bound(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl Store for PgStore {
    // =========================================================================
    // Balance Operations
    // =========================================================================

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<i64>> {
        let balance = sqlx::query_scalar::<_, i64>(
            "SELECT balance FROM credit_balances WHERE user_id = $1",
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(balance)
    }

    async fn ensure_account(&self, user_id: &UserId, starting_balance: i64) -> Result<i64> {
        sqlx::query(
            "INSERT INTO credit_balances (user_id, balance) VALUES ($1, $2) \
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id.as_uuid())
        .bind(starting_balance.max(0))
        .execute(&self.pool)
        .await?;

        self.get_balance(user_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "account",
                id: user_id.to_string(),
            })
    }

    async fn compare_and_swap(&self, user_id: &UserId, expected: i64, new: i64) -> Result<bool> {
        if new < 0 {
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE credit_balances SET balance = $3, updated_at = now() \
             WHERE user_id = $1 AND balance = $2",
        )
        .bind(user_id.as_uuid())
        .bind(expected)
        .bind(new)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_balance(user_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                entity: "account",
                id: user_id.to_string(),
            }),
        }
    }

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    async fn append_transaction(&self, transaction: &CreditTransaction) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} ({TRANSACTION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            tables::CREDIT_TRANSACTIONS
        ))
        .bind(transaction.id.to_string())
        .bind(transaction.user_id.as_uuid())
        .bind(transaction.amount)
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.balance_after)
        .bind(transaction.generation_id.map(|g| *g.as_uuid()))
        .bind(&transaction.description)
        .bind(&transaction.metadata)
        .bind(transaction.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM {} WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
            tables::CREDIT_TRANSACTIONS
        ))
        .bind(user_id.as_uuid())
        .bind(page_bound(limit))
        .bind(page_bound(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CreditTransaction::try_from).collect()
    }

    async fn find_refund(&self, generation_id: &GenerationId) -> Result<Option<CreditTransaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM {} \
             WHERE generation_id = $1 AND transaction_type = 'refund' LIMIT 1",
            tables::CREDIT_TRANSACTIONS
        ))
        .bind(generation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(CreditTransaction::try_from).transpose()
    }

    // =========================================================================
    // Generation Table Operations
    // =========================================================================

    async fn insert_generation(&self, row: &ColumnMap) -> Result<()> {
        build_insert(row).build().execute(&self.pool).await?;
        Ok(())
    }

    async fn update_generation(&self, id: &GenerationId, row: &ColumnMap) -> Result<()> {
        if row.is_empty() {
            return Ok(());
        }
        let result = build_update(id, row).build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "generation",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_generation(&self, id: &GenerationId) -> Result<()> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", tables::GENERATIONS))
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "generation",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_generation(&self, id: &GenerationId) -> Result<Option<ColumnMap>> {
        let row = sqlx::query_scalar::<_, serde_json::Value>(&format!(
            "SELECT to_jsonb(g) FROM {} g WHERE g.id = $1",
            tables::GENERATIONS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(column_map).transpose()
    }

    async fn generation_columns(&self) -> Result<BTreeSet<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(tables::GENERATIONS)
        .fetch_all(&self.pool)
        .await?;
        Ok(names.into_iter().collect())
    }

    async fn find_generation_by_task(&self, task_id: &str) -> Result<Option<ColumnMap>> {
        let row = sqlx::query_scalar::<_, serde_json::Value>(&format!(
            "SELECT to_jsonb(g) FROM {} g WHERE g.task_id = $1 ORDER BY g.created_at DESC LIMIT 1",
            tables::GENERATIONS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(column_map).transpose()
    }

    async fn unfinished_generations(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ColumnMap>> {
        let rows = sqlx::query_scalar::<_, serde_json::Value>(&format!(
            "SELECT to_jsonb(g) FROM {} g \
             WHERE g.status IN ('queued', 'generating') AND g.created_at < $1 \
             ORDER BY g.created_at LIMIT $2",
            tables::GENERATIONS
        ))
        .bind(created_before)
        .bind(page_bound(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(column_map).collect()
    }

    // =========================================================================
    // Profile Operations
    // =========================================================================

    async fn ensure_profile(&self, user_id: &UserId) -> Result<()> {
        sqlx::query("INSERT INTO profiles (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(user_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

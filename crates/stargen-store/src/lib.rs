//! Storage layer for stargen.
//!
//! This crate persists balances, ledger entries, profiles and generation
//! records. Two backends implement the [`Store`] trait:
//!
//! - [`PgStore`]: PostgreSQL via `sqlx`, used in production
//! - [`MemoryStore`]: in-process, used by tests and local runs without a
//!   database; it can simulate a schema mid-rollout and missing profiles
//!
//! Generation rows are written as column maps rather than typed structs so
//! that the caller can drop columns the live schema does not have yet.
//!
//! # Example
//!
//! ```no_run
//! use stargen_core::UserId;
//! use stargen_store::{MemoryStore, Store};
//!
//! # async fn run() -> stargen_store::Result<()> {
//! let store = MemoryStore::new();
//! let user_id = UserId::generate();
//! let balance = store.ensure_account(&user_id, 100).await?;
//! assert!(store.compare_and_swap(&user_id, balance, balance - 10).await?);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod postgres;
pub mod schema;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;

use stargen_core::{ColumnMap, CreditTransaction, GenerationId, UserId};

/// The storage trait defining all database operations.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Balance Operations
    // =========================================================================

    /// Get a user's balance, or `None` if the user has no account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_balance(&self, user_id: &UserId) -> Result<Option<i64>>;

    /// Create the account with `starting_balance` if missing; return the current balance.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn ensure_account(&self, user_id: &UserId, starting_balance: i64) -> Result<i64>;

    /// Set the balance to `new` only if it currently equals `expected`.
    ///
    /// Returns `false` when another writer changed the balance first. The
    /// store refuses negative balances.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the account doesn't exist.
    async fn compare_and_swap(&self, user_id: &UserId, expected: i64, new: i64) -> Result<bool>;

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    /// Append a ledger entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn append_transaction(&self, transaction: &CreditTransaction) -> Result<()>;

    /// List a user's ledger entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>>;

    /// Find the refund entry already written for a generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_refund(&self, generation_id: &GenerationId) -> Result<Option<CreditTransaction>>;

    // =========================================================================
    // Generation Table Operations
    // =========================================================================

    /// Insert a generation row.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UnknownColumn` for a column the table lacks and
    /// `StoreError::ForeignKeyViolation` when the owning profile is missing.
    async fn insert_generation(&self, row: &ColumnMap) -> Result<()>;

    /// Overwrite the given columns of an existing generation row.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UnknownColumn` for a column the table lacks and
    /// `StoreError::NotFound` if the row doesn't exist.
    async fn update_generation(&self, id: &GenerationId, row: &ColumnMap) -> Result<()>;

    /// Delete a generation row.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the row doesn't exist.
    async fn delete_generation(&self, id: &GenerationId) -> Result<()>;

    /// Fetch a generation row with whatever columns the table has.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_generation(&self, id: &GenerationId) -> Result<Option<ColumnMap>>;

    /// Columns the generations table currently has.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn generation_columns(&self) -> Result<BTreeSet<String>>;

    /// Fetch the generation row tracking a provider task.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_generation_by_task(&self, task_id: &str) -> Result<Option<ColumnMap>>;

    /// Rows still `queued` or `generating` that were created before
    /// `created_before`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn unfinished_generations(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ColumnMap>>;

    // =========================================================================
    // Profile Operations
    // =========================================================================

    /// Create the user's profile row if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn ensure_profile(&self, user_id: &UserId) -> Result<()>;
}

//! Table and column definitions.
//!
//! The generations table is versioned. Version 1 holds the required and
//! base columns; version 2 adds the optional pricing and output columns.
//! A database still on version 1 rejects writes to optional columns, and
//! the persistence adapter strips them instead of failing.

use stargen_core::columns;

/// Schema version this build writes.
pub const SCHEMA_VERSION: u32 = 2;

/// Table names.
pub mod tables {
    /// One row per user; generations reference it.
    pub const PROFILES: &str = "profiles";

    /// Current star balance per user.
    pub const CREDIT_BALANCES: &str = "credit_balances";

    /// Append-only ledger entries.
    pub const CREDIT_TRANSACTIONS: &str = "credit_transactions";

    /// Generation records.
    pub const GENERATIONS: &str = "generations";
}

/// Columns every generation write must include.
pub const REQUIRED_COLUMNS: &[&str] = &[
    columns::ID,
    columns::USER_ID,
    columns::TYPE,
    columns::MODEL_ID,
    columns::STATUS,
];

/// Columns present since schema version 1.
pub const BASE_COLUMNS: &[&str] = &[
    columns::MODEL_NAME,
    columns::PROMPT,
    columns::ASPECT_RATIO,
    columns::PROVIDER,
    columns::TASK_ID,
    columns::RESULT_URLS,
    columns::ERROR_MESSAGE,
    columns::CREATED_AT,
    columns::UPDATED_AT,
];

/// Columns added in schema version 2; they may be absent during rollout.
pub const OPTIONAL_COLUMNS: &[&str] = &[
    columns::IMAGE_URL,
    columns::RESOLUTION,
    columns::CREDITS_USED,
    columns::CHARGED_STARS,
    columns::SKU,
    columns::PRICING_VERSION,
    columns::METADATA,
];

/// Whether a column may be dropped from a write.
#[must_use]
pub fn is_optional(column: &str) -> bool {
    OPTIONAL_COLUMNS.contains(&column)
}

/// All columns of the current schema version.
pub fn all_columns() -> impl Iterator<Item = &'static str> {
    REQUIRED_COLUMNS
        .iter()
        .chain(BASE_COLUMNS)
        .chain(OPTIONAL_COLUMNS)
        .copied()
}

/// PostgreSQL cast applied to a bound text parameter for the column.
#[must_use]
pub fn sql_cast(column: &str) -> &'static str {
    match column {
        c if c == columns::ID || c == columns::USER_ID => "uuid",
        c if c == columns::CREATED_AT || c == columns::UPDATED_AT => "timestamptz",
        c if c == columns::RESULT_URLS || c == columns::METADATA => "jsonb",
        c if c == columns::CHARGED_STARS => "bigint",
        c if c == columns::CREDITS_USED => "numeric",
        _ => "text",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_sets_are_disjoint() {
        let all: Vec<_> = all_columns().collect();
        let mut deduped = all.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(all.len(), deduped.len());
    }

    #[test]
    fn only_optional_columns_are_strippable() {
        assert!(is_optional("metadata"));
        assert!(is_optional("charged_stars"));
        assert!(!is_optional("status"));
        assert!(!is_optional("prompt"));
    }

    #[test]
    fn casts_follow_column_types() {
        assert_eq!(sql_cast("id"), "uuid");
        assert_eq!(sql_cast("metadata"), "jsonb");
        assert_eq!(sql_cast("charged_stars"), "bigint");
        assert_eq!(sql_cast("prompt"), "text");
    }
}

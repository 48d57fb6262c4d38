//! Error types for stargen storage.

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A written column does not exist in the table (schema mid-rollout).
    #[error("unknown column: {column}")]
    UnknownColumn {
        /// The column the store rejected.
        column: String,
    },

    /// A referenced row does not exist (e.g. the owning user's profile).
    #[error("foreign key violation: {message}")]
    ForeignKeyViolation {
        /// Violated constraint, if reported.
        constraint: Option<String>,
        /// Database message.
        message: String,
    },

    /// Unique constraint violation.
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Map driver errors onto the classes the persistence adapter can recover from.
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some("42703") => match extract_column_name(db_err.message()) {
                    Some(column) => Self::UnknownColumn { column },
                    None => Self::Database(db_err.message().to_string()),
                },
                Some("23503") => Self::ForeignKeyViolation {
                    constraint: db_err.constraint().map(str::to_string),
                    message: db_err.message().to_string(),
                },
                Some("23505") => Self::Conflict(db_err.message().to_string()),
                _ => Self::Database(db_err.message().to_string()),
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Serialization(err.to_string())
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Pull the column name out of a "column does not exist" message.
///
/// Understands PostgreSQL (`column "metadata" of relation "generations"
/// does not exist`) and PostgREST (`Could not find the 'metadata' column
/// of 'generations' in the schema cache`) wording.
#[must_use]
pub fn extract_column_name(message: &str) -> Option<String> {
    let quoted = |quote: char| {
        let start = message.find(quote)? + 1;
        let len = message[start..].find(quote)?;
        Some(message[start..start + len].to_string())
    };

    if !message.contains("column") {
        return None;
    }
    quoted('"')
        .or_else(|| quoted('\''))
        .filter(|name| !name.is_empty())
}

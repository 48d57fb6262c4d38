//! API handlers.

pub mod credits;
pub mod generations;
pub mod health;
pub mod models;
pub mod webhooks;

use stargen_core::UserId;

use crate::error::ApiError;

/// Parse a user id from a path segment.
pub(crate) fn parse_user_id(raw: &str) -> Result<UserId, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid user id: {e}")))
}

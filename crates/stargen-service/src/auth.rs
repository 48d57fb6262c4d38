//! Service-to-service authentication.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the shared service key.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Header naming the calling service.
pub const SERVICE_NAME_HEADER: &str = "x-service-name";

/// A caller that presented the shared service key.
///
/// Generation and credit routes trust the user id the caller supplies, so
/// only holders of `SERVICE_API_KEY` may reach them. A service with no key
/// configured rejects every authenticated route.
#[derive(Debug, Clone)]
pub struct ServiceAuth {
    /// Value of `X-Service-Name`, or `unknown`.
    pub service_name: String,
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

impl FromRequestParts<Arc<AppState>> for ServiceAuth {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let Some(expected) = state.config.service_api_key.as_deref() else {
                tracing::warn!(path = %parts.uri.path(), "SERVICE_API_KEY unset, rejecting request");
                return Err(ApiError::Unauthorized);
            };

            let service_name = header(parts, SERVICE_NAME_HEADER)
                .unwrap_or("unknown")
                .to_string();

            match header(parts, API_KEY_HEADER) {
                Some(presented) if presented == expected => Ok(Self { service_name }),
                _ => {
                    tracing::debug!(service = %service_name, path = %parts.uri.path(), "Rejected service key");
                    Err(ApiError::Unauthorized)
                }
            }
        })
    }
}

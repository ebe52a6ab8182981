// Caller authentication
//
// Mutual TLS is terminated in front of the relay; the terminator forwards the client
// certificate fingerprint in a header. Requests are rejected here, before any query
// logic runs, when the header is missing or names no known identity.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::api::handlers::AppState;
use crate::api::middleware::RelayError;
use crate::models::ClientIdentity;

/// Identity of the authenticated caller
#[derive(Debug, Clone)]
pub struct Authenticated(pub ClientIdentity);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = RelayError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let fingerprint = parts
            .headers
            .get(state.identity_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| RelayError::Unauthenticated("no client certificate presented".to_string()))?;

        let identity = state
            .relay
            .dispatcher()
            .registry()
            .identity(fingerprint)
            .cloned()
            .ok_or_else(|| {
                tracing::warn!("Rejected unknown client certificate {}", fingerprint);
                RelayError::Forbidden("client certificate is not recognised".to_string())
            })?;

        Ok(Authenticated(identity))
    }
}

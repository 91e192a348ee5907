//! API-key authentication.
//!
//! When a key is configured, protected routes require
//! `Authorization: Bearer <key>`. An unset or empty key disables
//! authentication entirely. `/health` is never gated, and the multipart
//! upload route may carry the key in an `ai_token` form field instead,
//! which its handler checks via [`form_token_matches`].

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::server::routes::AppState;

/// Extract the bearer token from request headers.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Whether the request headers satisfy the configured key.
/// Always true when authentication is disabled.
pub fn headers_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    match state.config.api_key.as_deref() {
        None => true,
        Some(expected) => bearer_token(headers) == Some(expected),
    }
}

/// Whether an `ai_token` form field satisfies the configured key.
pub fn form_token_matches(state: &AppState, token: Option<&str>) -> bool {
    match state.config.api_key.as_deref() {
        None => true,
        Some(expected) => token == Some(expected),
    }
}

/// Middleware gating protected routes on the configured API key.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !headers_authorized(&state, request.headers()) {
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert_eq!(bearer_token(&headers), Some("secret"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);
    }
}

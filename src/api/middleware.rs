//! Authentication middleware.
//!
//! Sync routes accept `Authorization: Bearer` only; storage routes dispatch
//! on the header prefix and additionally accept SigV4 against issued
//! credentials. Both attach the resolved [`AuthUser`] to request extensions;
//! handlers read identity from there and nowhere else.

use axum::body::Body;
use axum::extract::{OriginalUri, State};
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::api::response::ApiError;
use crate::sigv4;
use crate::AppState;

/// The authenticated caller, as resolved by one of the middleware below.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub email: Option<String>,
    pub id: uuid::Uuid,
}

/// Extract the token from a `Bearer` authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Require a valid bearer token; resolves it through the identity provider.
pub async fn bearer_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers())
        .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

    let user = state.identity.resolve_token(&token).await?;
    request.extensions_mut().insert(AuthUser {
        email: user.email,
        id: user.id,
    });

    Ok(next.run(request).await)
}

/// Storage authentication: SigV4 against issued credentials, or Bearer via
/// the identity provider, chosen by the Authorization prefix.
pub async fn storage_auth(
    State(state): State<Arc<AppState>>,
    // Nesting strips the /storage prefix before this runs; the signature
    // covers the path the client actually sent, so verify against that.
    OriginalUri(original_uri): OriginalUri,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    // Degraded mode short-circuits everything, including authentication.
    if state.gateway.is_none() {
        return Err(ApiError::unavailable("Object storage is not configured"));
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let user = if auth_header.starts_with("AWS4-HMAC-SHA256") {
        let parsed = sigv4::parse_authorization(&auth_header)
            .ok_or_else(|| ApiError::forbidden("Malformed signature"))?;

        let (user_id, secret) = state
            .credentials
            .lookup(&state.db, &parsed.access_key_id)
            .await?
            .ok_or_else(|| ApiError::forbidden("Unknown access key"))?;

        let headers: Vec<(String, String)> = request
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let parts = sigv4::CanonicalParts {
            headers: &headers,
            method: request.method().as_str(),
            path: original_uri.path(),
            query: original_uri.query().unwrap_or(""),
        };

        sigv4::verify(&parts, &parsed, &secret, Utc::now())
            .map_err(|e| ApiError::forbidden(e.to_string()))?;

        AuthUser {
            email: None,
            id: user_id,
        }
    } else if auth_header.starts_with("Bearer ") {
        let token = bearer_token(request.headers())
            .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;
        let user = state.identity.resolve_token(&token).await?;
        AuthUser {
            email: user.email,
            id: user.id,
        }
    } else {
        return Err(ApiError::unauthorized("Missing authorization"));
    };

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// Admin operations require a bearer equal to the process service key,
/// compared in constant time.
pub fn require_service_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token =
        bearer_token(headers).ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;
    let matches: bool = token
        .as_bytes()
        .ct_eq(state.config.auth.service_key.as_bytes())
        .into();
    if matches {
        Ok(())
    } else {
        Err(ApiError::unauthorized("Invalid service key"))
    }
}

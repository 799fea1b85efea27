use axum::extract::State;
use axum::http::HeaderMap;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::middleware::{require_service_key, AuthUser};
use crate::api::response::ApiError;
use crate::identity::TokenBundle;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub email: Option<String>,
    pub id: Uuid,
}

/// Everything a client needs to point an S3 SDK at the gateway.
#[derive(Debug, Serialize)]
pub struct StorageConfigResponse {
    pub access_key_id: String,
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub secret_access_key: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub access_token: String,
    pub expires_at: Option<i64>,
    pub expires_in: i64,
    pub refresh_token: String,
    pub storage_config: Option<StorageConfigResponse>,
    pub user: UserResponse,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    if req.email.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::bad_request("email and password are required"));
    }

    let bundle = state.identity.password_login(&req.email, &req.password).await?;
    let session = session_response(&state, bundle).await?;
    Ok(Json(session))
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    if req.refresh_token.trim().is_empty() {
        return Err(ApiError::bad_request("refresh_token is required"));
    }

    let bundle = state.identity.refresh(&req.refresh_token).await?;
    let session = session_response(&state, bundle).await?;
    Ok(Json(session))
}

/// `GET /auth/storage-credentials`: the storage block alone, for clients
/// that already hold a session.
pub async fn storage_credentials(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<StorageConfigResponse>, ApiError> {
    match build_storage_config(&state, user.id).await? {
        Some(config) => Ok(Json(config)),
        None => Err(ApiError::unavailable("Object storage is not configured")),
    }
}

/// `POST /auth/storage-credentials/rotate`: invalidate the caller's access
/// key and mint a fresh pair.
pub async fn rotate_storage_credentials(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<StorageConfigResponse>, ApiError> {
    let Some(storage) = &state.config.storage else {
        return Err(ApiError::unavailable("Object storage is not configured"));
    };

    let issued = state.credentials.rotate(&state.db, user.id).await?;
    Ok(Json(StorageConfigResponse {
        access_key_id: issued.access_key_id,
        bucket: format!("{}{}", storage.bucket_prefix, user.id),
        endpoint: storage.public_endpoint.clone(),
        region: storage.region.clone(),
        secret_access_key: issued.secret_access_key,
    }))
}

pub async fn admin_create_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    require_service_key(&state, &headers)?;

    if req.email.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::bad_request("email and password are required"));
    }

    let user = state.identity.create_user(&req.email, &req.password).await?;
    tracing::info!(user_id = %user.id, "Created user");
    Ok(Json(UserResponse {
        email: user.email,
        id: user.id,
    }))
}

// ============================================================================
// Helpers
// ============================================================================

async fn session_response(
    state: &AppState,
    bundle: TokenBundle,
) -> Result<SessionResponse, ApiError> {
    let storage_config = build_storage_config(state, bundle.user.id).await?;
    Ok(SessionResponse {
        access_token: bundle.access_token,
        expires_at: bundle.expires_at,
        expires_in: bundle.expires_in,
        refresh_token: bundle.refresh_token,
        storage_config,
        user: UserResponse {
            email: bundle.user.email,
            id: bundle.user.id,
        },
    })
}

/// Assemble the caller's storage block, minting credentials on first use.
/// `None` when the backend or the credential key is not configured.
async fn build_storage_config(
    state: &AppState,
    user_id: Uuid,
) -> Result<Option<StorageConfigResponse>, ApiError> {
    let Some(storage) = &state.config.storage else {
        return Ok(None);
    };
    if !state.credentials.available() {
        return Ok(None);
    }

    let issued = state.credentials.get_or_mint(&state.db, user_id).await?;
    Ok(Some(StorageConfigResponse {
        access_key_id: issued.access_key_id,
        bucket: format!("{}{}", storage.bucket_prefix, user_id),
        endpoint: storage.public_endpoint.clone(),
        region: storage.region.clone(),
        secret_access_key: issued.secret_access_key,
    }))
}

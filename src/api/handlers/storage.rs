use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use chrono::Utc;
use std::sync::Arc;

use crate::api::middleware::AuthUser;
use crate::api::response::ApiError;
use crate::gateway::{self, xml, GatewayError, ListParams, S3Gateway};
use crate::storage::quotas;
use crate::AppState;

// ============================================================================
// Object operations
// ============================================================================

pub async fn put_object(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let gateway = require_gateway(&state)?;
    let (bucket, key) = resolve_bucket(gateway, &user, &uri)?;
    if key.is_empty() {
        return Err(ApiError::bad_request("Object key is required"));
    }

    // First-write provisioning: idempotent create plus best-effort quota.
    gateway.ensure_bucket(&bucket).await.map_err(upstream)?;
    if let Ok(Some(quota_bytes)) = quotas::effective_quota_bytes(&state.db, user.id).await {
        gateway.apply_quota(&bucket, quota_bytes).await;
    }

    let content_type = header_string(&headers, header::CONTENT_TYPE);
    let content_length = header_string(&headers, header::CONTENT_LENGTH)
        .and_then(|v| v.parse::<u64>().ok());
    let stream = reqwest::Body::wrap_stream(body.into_data_stream());

    let response = gateway
        .put_object(&bucket, &key, content_type, content_length, stream)
        .await
        .map_err(upstream)?;

    if !response.status().is_success() {
        return Err(relay_failure("Upload failed", response.status().as_u16()));
    }

    let etag = response
        .headers()
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("\"{}\"", Utc::now().timestamp_millis()));

    tracing::debug!(bucket = %bucket, key = %key, "Stored object");
    Ok(([(header::ETAG, etag)], StatusCode::OK).into_response())
}

pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let gateway = require_gateway(&state)?;
    let (bucket, key) = resolve_bucket(gateway, &user, &uri)?;
    if key.is_empty() {
        return Err(ApiError::bad_request("Object key is required"));
    }

    let range = header_string(&headers, header::RANGE);
    let response = gateway
        .get_object(&bucket, &key, range)
        .await
        .map_err(upstream)?;
    Ok(passthrough(response, true))
}

pub async fn head_object(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    uri: Uri,
) -> Result<Response, ApiError> {
    let gateway = require_gateway(&state)?;
    let (bucket, key) = resolve_bucket(gateway, &user, &uri)?;
    if key.is_empty() {
        return Err(ApiError::bad_request("Object key is required"));
    }

    let response = gateway.head_object(&bucket, &key).await.map_err(upstream)?;
    Ok(passthrough(response, false))
}

pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    uri: Uri,
) -> Result<Response, ApiError> {
    let gateway = require_gateway(&state)?;
    let (bucket, key) = resolve_bucket(gateway, &user, &uri)?;
    if key.is_empty() {
        return Err(ApiError::bad_request("Object key is required"));
    }

    let response = gateway
        .delete_object(&bucket, &key)
        .await
        .map_err(upstream)?;

    // S3 deletes are idempotent; a missing key still deletes cleanly.
    match response.status().as_u16() {
        200..=299 | 404 => {
            tracing::debug!(bucket = %bucket, key = %key, "Deleted object");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        status => Err(relay_failure("Delete failed", status)),
    }
}

pub async fn list_objects(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    uri: Uri,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let gateway = require_gateway(&state)?;
    let (bucket, _) = resolve_bucket(gateway, &user, &uri)?;

    let response = gateway
        .list_objects(&bucket, &params)
        .await
        .map_err(upstream)?;

    // A bucket that was never provisioned lists as empty, not as an error.
    if response.status().as_u16() == 404 {
        let body = xml::empty_list_result(&bucket, params.prefix.as_deref());
        return Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/xml")],
            body,
        )
            .into_response());
    }
    if !response.status().is_success() {
        return Err(relay_failure("List failed", response.status().as_u16()));
    }

    Ok(passthrough(response, true))
}

// ============================================================================
// Helpers
// ============================================================================

fn require_gateway(state: &AppState) -> Result<&S3Gateway, ApiError> {
    state
        .gateway
        .as_ref()
        .ok_or_else(|| ApiError::unavailable("Object storage is not configured"))
}

/// Enforce bucket isolation on the raw request path, before any backend
/// call. An empty bucket segment means the caller's own bucket.
fn resolve_bucket(
    gateway: &S3Gateway,
    user: &AuthUser,
    uri: &Uri,
) -> Result<(String, String), ApiError> {
    let (bucket, key) = gateway::parse_object_path(uri.path())
        .ok_or_else(|| ApiError::bad_request("Invalid storage path"))?;
    let expected = gateway.bucket_for(user.id);
    if bucket.is_empty() {
        return Ok((expected, key));
    }
    if bucket != expected {
        return Err(ApiError::forbidden("Bucket access denied"));
    }
    Ok((bucket, key))
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn upstream(error: GatewayError) -> ApiError {
    ApiError::bad_gateway(error.to_string())
}

fn relay_failure(context: &str, status: u16) -> ApiError {
    let status =
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    if status.is_client_error() {
        ApiError::Status(status, context.to_string())
    } else {
        ApiError::bad_gateway(format!("{context} (backend status {status})"))
    }
}

/// Relay a backend response: status, the relevant headers, and (optionally)
/// the body as a stream.
fn passthrough(response: reqwest::Response, with_body: bool) -> Response {
    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for name in [
        header::ACCEPT_RANGES,
        header::CONTENT_LENGTH,
        header::CONTENT_RANGE,
        header::CONTENT_TYPE,
        header::ETAG,
        header::LAST_MODIFIED,
    ] {
        if let Some(value) = response.headers().get(&name) {
            builder = builder.header(&name, value);
        }
    }

    let body = if with_body {
        Body::from_stream(response.bytes_stream())
    } else {
        Body::empty()
    };

    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

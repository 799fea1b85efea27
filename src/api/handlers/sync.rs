use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::middleware::AuthUser;
use crate::api::response::ApiError;
use crate::storage::changes::{
    self, ChangeSubmission, PullCursor, PullQuery,
};
use crate::storage::models::{ChangeRow, VaultKeyRow, VaultSummaryRow};
use crate::storage::{partitions, vaults};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVaultRequest {
    pub encrypted_vault_key: String,
    pub encrypted_vault_name: String,
    pub vault_id: String,
    pub vault_key_nonce: String,
    pub vault_key_salt: String,
    pub vault_name_nonce: String,
    pub vault_name_salt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameVaultRequest {
    pub encrypted_vault_name: String,
    pub vault_name_nonce: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultKeyResponse {
    pub created_at: String,
    pub encrypted_vault_key: String,
    pub encrypted_vault_name: String,
    pub updated_at: String,
    pub vault_id: String,
    pub vault_key_nonce: String,
    pub vault_key_salt: String,
    pub vault_name_nonce: String,
    pub vault_name_salt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultSummaryResponse {
    pub created_at: String,
    pub encrypted_vault_name: String,
    pub updated_at: String,
    pub vault_id: String,
    pub vault_name_nonce: String,
    pub vault_name_salt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub changes: Vec<ChangeDto>,
    pub vault_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDto {
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub batch_seq: Option<i64>,
    #[serde(default)]
    pub batch_total: Option<i64>,
    #[serde(default)]
    pub column_name: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub encrypted_value: Option<String>,
    pub hlc_timestamp: String,
    #[serde(default)]
    pub nonce: Option<String>,
    pub row_pks: String,
    pub table_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub count: u64,
    pub last_hlc: Option<String>,
    pub server_timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullParams {
    #[serde(default)]
    pub after_row_pks: Option<String>,
    #[serde(default)]
    pub after_table_name: Option<String>,
    #[serde(default)]
    pub after_updated_at: Option<String>,
    #[serde(default)]
    pub exclude_device_id: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    pub vault_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub changes: Vec<PullChangeResponse>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_row_pks: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_table_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullChangeResponse {
    pub column_name: Option<String>,
    pub device_id: Option<String>,
    pub encrypted_value: Option<String>,
    pub hlc_timestamp: String,
    pub nonce: Option<String>,
    pub row_pks: String,
    pub table_name: String,
    pub updated_at: String,
}

// ============================================================================
// Vault registry
// ============================================================================

pub async fn create_vault(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateVaultRequest>,
) -> Result<(StatusCode, Json<VaultKeyResponse>), ApiError> {
    if req.vault_id.trim().is_empty() {
        return Err(ApiError::bad_request("vaultId is required"));
    }

    let vault = vaults::NewVault {
        encrypted_vault_key: req.encrypted_vault_key,
        encrypted_vault_name: req.encrypted_vault_name,
        vault_id: req.vault_id,
        vault_key_nonce: req.vault_key_nonce,
        vault_key_salt: req.vault_key_salt,
        vault_name_nonce: req.vault_name_nonce,
        vault_name_salt: req.vault_name_salt,
    };

    let row = vaults::create(&state.db, user.id, &vault).await?;

    // The default partition catches any rows that land before this
    // completes; bootstrap repairs it on the next start if it fails.
    if let Err(error) = partitions::ensure_partition(&state.db, &row.vault_id).await {
        tracing::warn!(vault_id = %row.vault_id, error = %error, "Partition creation deferred");
    }

    tracing::debug!(vault_id = %row.vault_id, user_id = %user.id, "Created vault");
    Ok((StatusCode::CREATED, Json(vault_key_response(row))))
}

pub async fn list_vaults(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<VaultSummaryResponse>>, ApiError> {
    let rows = vaults::list(&state.db, user.id).await?;
    Ok(Json(rows.into_iter().map(vault_summary_response).collect()))
}

pub async fn get_vault_key(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(vault_id): Path<String>,
) -> Result<Json<VaultKeyResponse>, ApiError> {
    let row = vaults::fetch(&state.db, user.id, &vault_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Vault not found"))?;
    Ok(Json(vault_key_response(row)))
}

pub async fn rename_vault(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(vault_id): Path<String>,
    Json(req): Json<RenameVaultRequest>,
) -> Result<Json<VaultKeyResponse>, ApiError> {
    let renamed = vaults::rename(
        &state.db,
        user.id,
        &vault_id,
        &req.encrypted_vault_name,
        &req.vault_name_nonce,
    )
    .await?;
    if !renamed {
        return Err(ApiError::not_found("Vault not found"));
    }

    let row = vaults::fetch(&state.db, user.id, &vault_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Vault not found"))?;
    tracing::debug!(vault_id = %vault_id, "Renamed vault");
    Ok(Json(vault_key_response(row)))
}

pub async fn delete_vault(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(vault_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = vaults::delete(&state.db, user.id, &vault_id).await?;
    if !deleted {
        return Err(ApiError::not_found("Vault not found"));
    }

    partitions::drop_partition(&state.db, &vault_id).await?;
    tracing::info!(vault_id = %vault_id, user_id = %user.id, "Deleted vault");
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ============================================================================
// Push / pull
// ============================================================================

pub async fn push_changes(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<PushRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    // A vault not owned by the caller behaves as absent.
    vaults::fetch(&state.db, user.id, &req.vault_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Vault not found"))?;

    let submissions: Vec<ChangeSubmission> = req.changes.into_iter().map(submission).collect();
    let outcome = changes::push(&state.db, user.id, &req.vault_id, submissions).await?;

    tracing::debug!(
        vault_id = %req.vault_id,
        count = outcome.count,
        "Applied push"
    );
    Ok(Json(PushResponse {
        count: outcome.count,
        last_hlc: outcome.last_hlc,
        server_timestamp: changes::format_server_timestamp(outcome.server_timestamp),
    }))
}

pub async fn pull_changes(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<PullParams>,
) -> Result<Json<PullResponse>, ApiError> {
    vaults::fetch(&state.db, user.id, &params.vault_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Vault not found"))?;

    let cursor = parse_cursor(&params)?;
    let query = PullQuery {
        cursor,
        exclude_device_id: params.exclude_device_id.clone(),
        limit: changes::clamp_limit(params.limit),
        vault_id: params.vault_id.clone(),
    };

    let page = changes::pull(&state.db, user.id, &query).await?;
    Ok(Json(PullResponse {
        changes: page.changes.into_iter().map(pull_change_response).collect(),
        has_more: page.has_more,
        last_row_pks: page.last_row_pks,
        last_table_name: page.last_table_name,
        server_timestamp: page.server_timestamp.map(changes::format_server_timestamp),
    }))
}

// ============================================================================
// Helpers
// ============================================================================

/// The triple cursor travels together: all three parts or none.
fn parse_cursor(params: &PullParams) -> Result<Option<PullCursor>, ApiError> {
    match (
        &params.after_updated_at,
        &params.after_table_name,
        &params.after_row_pks,
    ) {
        (None, None, None) => Ok(None),
        (Some(updated_at), Some(table_name), Some(row_pks)) => {
            let after_updated_at = DateTime::parse_from_rfc3339(updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| {
                    ApiError::bad_request("afterUpdatedAt must be an RFC 3339 timestamp")
                })?;
            Ok(Some(PullCursor {
                after_row_pks: row_pks.clone(),
                after_table_name: table_name.clone(),
                after_updated_at,
            }))
        }
        _ => Err(ApiError::bad_request(
            "cursor requires afterUpdatedAt, afterTableName and afterRowPks together",
        )),
    }
}

fn submission(dto: ChangeDto) -> ChangeSubmission {
    ChangeSubmission {
        batch_id: dto.batch_id,
        batch_seq: dto.batch_seq,
        batch_total: dto.batch_total,
        column_name: dto.column_name,
        device_id: dto.device_id,
        encrypted_value: dto.encrypted_value,
        hlc_timestamp: dto.hlc_timestamp,
        nonce: dto.nonce,
        row_pks: dto.row_pks,
        table_name: dto.table_name,
    }
}

fn vault_key_response(row: VaultKeyRow) -> VaultKeyResponse {
    VaultKeyResponse {
        created_at: row.created_at.to_rfc3339(),
        encrypted_vault_key: row.encrypted_vault_key,
        encrypted_vault_name: row.encrypted_vault_name,
        updated_at: row.updated_at.to_rfc3339(),
        vault_id: row.vault_id,
        vault_key_nonce: row.vault_key_nonce,
        vault_key_salt: row.vault_key_salt,
        vault_name_nonce: row.vault_name_nonce,
        vault_name_salt: row.vault_name_salt,
    }
}

fn vault_summary_response(row: VaultSummaryRow) -> VaultSummaryResponse {
    VaultSummaryResponse {
        created_at: row.created_at.to_rfc3339(),
        encrypted_vault_name: row.encrypted_vault_name,
        updated_at: row.updated_at.to_rfc3339(),
        vault_id: row.vault_id,
        vault_name_nonce: row.vault_name_nonce,
        vault_name_salt: row.vault_name_salt,
    }
}

fn pull_change_response(row: ChangeRow) -> PullChangeResponse {
    PullChangeResponse {
        column_name: row.column_name,
        device_id: row.device_id,
        encrypted_value: row.encrypted_value,
        hlc_timestamp: row.hlc_timestamp,
        nonce: row.nonce,
        row_pks: row.row_pks,
        table_name: row.table_name,
        updated_at: changes::format_server_timestamp(row.updated_at),
    }
}

//! Vault registry.
//!
//! Every operation is scoped to the owning user; a vault owned by someone
//! else behaves exactly like a vault that does not exist.

use uuid::Uuid;

use super::models::{VaultKeyRow, VaultSummaryRow};
use super::{Database, StorageError};

/// The encrypted key bundle supplied at vault creation.
#[derive(Debug, Clone)]
pub struct NewVault {
    pub encrypted_vault_key: String,
    pub encrypted_vault_name: String,
    pub vault_id: String,
    pub vault_key_nonce: String,
    pub vault_key_salt: String,
    pub vault_name_nonce: String,
    pub vault_name_salt: String,
}

/// Insert a vault record. `StorageError::Duplicate` when the user already
/// registered this vault id.
pub async fn create(
    db: &Database,
    user_id: Uuid,
    vault: &NewVault,
) -> Result<VaultKeyRow, StorageError> {
    let inserted: Option<VaultKeyRow> = sqlx::query_as(
        r#"
        INSERT INTO vault_keys
            (user_id, vault_id, encrypted_vault_key, encrypted_vault_name,
             vault_key_salt, vault_name_salt, vault_key_nonce, vault_name_nonce)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (user_id, vault_id) DO NOTHING
        RETURNING user_id, vault_id, encrypted_vault_key, encrypted_vault_name,
                  vault_key_salt, vault_name_salt, vault_key_nonce, vault_name_nonce,
                  created_at, updated_at
        "#,
    )
    .bind(user_id)
    .bind(&vault.vault_id)
    .bind(&vault.encrypted_vault_key)
    .bind(&vault.encrypted_vault_name)
    .bind(&vault.vault_key_salt)
    .bind(&vault.vault_name_salt)
    .bind(&vault.vault_key_nonce)
    .bind(&vault.vault_name_nonce)
    .fetch_optional(db.pool())
    .await?;

    inserted.ok_or(StorageError::Duplicate)
}

/// All of a user's vaults, oldest first, without key material.
pub async fn list(db: &Database, user_id: Uuid) -> Result<Vec<VaultSummaryRow>, StorageError> {
    let rows = sqlx::query_as(
        r#"
        SELECT vault_id, encrypted_vault_name, vault_name_salt, vault_name_nonce,
               created_at, updated_at
        FROM vault_keys
        WHERE user_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(db.pool())
    .await?;
    Ok(rows)
}

/// One vault's full key bundle.
pub async fn fetch(
    db: &Database,
    user_id: Uuid,
    vault_id: &str,
) -> Result<Option<VaultKeyRow>, StorageError> {
    let row = sqlx::query_as(
        r#"
        SELECT user_id, vault_id, encrypted_vault_key, encrypted_vault_name,
               vault_key_salt, vault_name_salt, vault_key_nonce, vault_name_nonce,
               created_at, updated_at
        FROM vault_keys
        WHERE user_id = $1 AND vault_id = $2
        "#,
    )
    .bind(user_id)
    .bind(vault_id)
    .fetch_optional(db.pool())
    .await?;
    Ok(row)
}

/// Replace the encrypted name and its nonce. False when the vault is absent
/// (or not owned).
pub async fn rename(
    db: &Database,
    user_id: Uuid,
    vault_id: &str,
    encrypted_vault_name: &str,
    vault_name_nonce: &str,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        r#"
        UPDATE vault_keys
        SET encrypted_vault_name = $3, vault_name_nonce = $4, updated_at = now()
        WHERE user_id = $1 AND vault_id = $2
        "#,
    )
    .bind(user_id)
    .bind(vault_id)
    .bind(encrypted_vault_name)
    .bind(vault_name_nonce)
    .execute(db.pool())
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete a vault record. The caller drops the partition afterwards.
pub async fn delete(db: &Database, user_id: Uuid, vault_id: &str) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM vault_keys WHERE user_id = $1 AND vault_id = $2")
        .bind(user_id)
        .bind(vault_id)
        .execute(db.pool())
        .await?;
    Ok(result.rows_affected() > 0)
}

//! Persistence for issued storage credentials. Secrets arrive here already
//! encrypted; this module never sees plaintext.

use uuid::Uuid;

use super::models::StorageCredentialRow;
use super::{Database, StorageError};

pub async fn fetch_by_user(
    db: &Database,
    user_id: Uuid,
) -> Result<Option<StorageCredentialRow>, StorageError> {
    let row = sqlx::query_as(
        "SELECT user_id, access_key_id, encrypted_secret_key \
         FROM user_storage_credentials WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(db.pool())
    .await?;
    Ok(row)
}

pub async fn fetch_by_access_key(
    db: &Database,
    access_key_id: &str,
) -> Result<Option<StorageCredentialRow>, StorageError> {
    let row = sqlx::query_as(
        "SELECT user_id, access_key_id, encrypted_secret_key \
         FROM user_storage_credentials WHERE access_key_id = $1",
    )
    .bind(access_key_id)
    .fetch_optional(db.pool())
    .await?;
    Ok(row)
}

/// Insert a fresh credential row. False when the user already has one (a
/// concurrent mint won).
pub async fn insert(
    db: &Database,
    user_id: Uuid,
    access_key_id: &str,
    encrypted_secret_key: &str,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "INSERT INTO user_storage_credentials (user_id, access_key_id, encrypted_secret_key) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (user_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(access_key_id)
    .bind(encrypted_secret_key)
    .execute(db.pool())
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Swap a user's credentials in one transaction: the old access key id stops
/// resolving at the same instant the new one starts.
pub async fn replace(
    db: &Database,
    user_id: Uuid,
    access_key_id: &str,
    encrypted_secret_key: &str,
) -> Result<(), StorageError> {
    let mut tx = db.pool().begin().await?;
    sqlx::query("DELETE FROM user_storage_credentials WHERE user_id = $1")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO user_storage_credentials (user_id, access_key_id, encrypted_secret_key) \
         VALUES ($1, $2, $3)",
    )
    .bind(user_id)
    .bind(access_key_id)
    .bind(encrypted_secret_key)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

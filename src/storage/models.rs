use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// A vault's full key bundle, as persisted.
#[derive(Debug, Clone, FromRow)]
pub struct VaultKeyRow {
    pub created_at: DateTime<Utc>,
    /// Opaque ciphertext; the server never sees the vault key.
    pub encrypted_vault_key: String,
    pub encrypted_vault_name: String,
    pub updated_at: DateTime<Utc>,
    pub user_id: Uuid,
    pub vault_id: String,
    /// AES-GCM IV for the key ciphertext.
    pub vault_key_nonce: String,
    /// PBKDF2 salt for the key-derivation path.
    pub vault_key_salt: String,
    pub vault_name_nonce: String,
    pub vault_name_salt: String,
}

/// Listing row: everything needed to show a vault without exposing its key.
#[derive(Debug, Clone, FromRow)]
pub struct VaultSummaryRow {
    pub created_at: DateTime<Utc>,
    pub encrypted_vault_name: String,
    pub updated_at: DateTime<Utc>,
    pub vault_id: String,
    pub vault_name_nonce: String,
    pub vault_name_salt: String,
}

/// One persisted cell value.
#[derive(Debug, Clone, FromRow)]
pub struct ChangeRow {
    /// `None` denotes a whole-row tombstone.
    pub column_name: Option<String>,
    pub device_id: Option<String>,
    /// `None` denotes a cell tombstone.
    pub encrypted_value: Option<String>,
    pub hlc_timestamp: String,
    pub nonce: Option<String>,
    pub row_pks: String,
    pub table_name: String,
    pub updated_at: DateTime<Utc>,
}

/// One entry of a pull's row page: a `(table, row)` key and the greatest
/// `updated_at` across its cells.
#[derive(Debug, Clone, FromRow)]
pub struct RowPageEntry {
    pub max_updated: DateTime<Utc>,
    pub row_pks: String,
    pub table_name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct StorageCredentialRow {
    pub access_key_id: String,
    pub encrypted_secret_key: String,
    pub user_id: Uuid,
}

//! Quota catalog reads.
//!
//! Tiers and assignments are administered out of band; the gateway only reads
//! the effective quota when provisioning a user's bucket.

use uuid::Uuid;

use super::{Database, StorageError};

const DEFAULT_TIER: &str = "free";

/// A user's effective quota in bytes: the admin override if set, otherwise
/// the assigned tier's quota, otherwise the default tier's.
pub async fn effective_quota_bytes(
    db: &Database,
    user_id: Uuid,
) -> Result<Option<i64>, StorageError> {
    let assigned: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT COALESCE(q.override_quota_bytes, t.quota_bytes)
        FROM user_storage_quotas q
        JOIN storage_tiers t ON t.name = q.tier_name
        WHERE q.user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(db.pool())
    .await?;

    if assigned.is_some() {
        return Ok(assigned);
    }

    let default: Option<i64> =
        sqlx::query_scalar("SELECT quota_bytes FROM storage_tiers WHERE name = $1")
            .bind(DEFAULT_TIER)
            .fetch_optional(db.pool())
            .await?;
    Ok(default)
}

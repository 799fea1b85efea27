//! Per-vault partition lifecycle.
//!
//! Each vault's change records live in their own list partition so that vault
//! deletion is a single `DROP TABLE` and per-vault scans touch one partition.
//! Row-level policies are attached per partition (authorization does not
//! inherit across the partitioning boundary), and every partition joins the
//! change-feed publication with full replica identity.
//!
//! All DDL here is idempotent; [`bootstrap`] replays it for every known vault
//! at startup to repair drift.

use super::{Database, StorageError};

const PARTITION_PREFIX: &str = "sync_changes_";
const PUBLICATION: &str = "sync_changes_feed";

/// Postgres truncates identifiers beyond this length.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Deterministic partition name for a vault id. Bytes that are not valid
/// identifier characters (notably `-` in UUIDs) become `_`; uppercase folds
/// to lowercase to match the server's identifier handling.
pub fn partition_table_name(vault_id: &str) -> String {
    let mut name = String::with_capacity(PARTITION_PREFIX.len() + vault_id.len());
    name.push_str(PARTITION_PREFIX);
    for b in vault_id.bytes() {
        match b {
            b'a'..=b'z' | b'0'..=b'9' | b'_' => name.push(b as char),
            b'A'..=b'Z' => name.push(b.to_ascii_lowercase() as char),
            _ => name.push('_'),
        }
    }
    name.truncate(MAX_IDENTIFIER_LEN);
    name
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Create the vault's partition with its policies and feed membership.
/// A partition that already exists is repaired, not duplicated.
pub async fn ensure_partition(db: &Database, vault_id: &str) -> Result<(), StorageError> {
    let table = partition_table_name(vault_id);
    let value = quote_literal(vault_id);

    let ddl = format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} PARTITION OF sync_changes FOR VALUES IN ({value});
ALTER TABLE {table} ENABLE ROW LEVEL SECURITY;
ALTER TABLE {table} REPLICA IDENTITY FULL;
DO $$
BEGIN
    IF NOT EXISTS (SELECT 1 FROM pg_policies WHERE tablename = '{table}' AND policyname = 'select_own_changes') THEN
        CREATE POLICY select_own_changes ON {table}
            FOR SELECT USING (user_id = current_setting('app.user_id', true)::uuid);
    END IF;
    IF NOT EXISTS (SELECT 1 FROM pg_policies WHERE tablename = '{table}' AND policyname = 'insert_own_changes') THEN
        CREATE POLICY insert_own_changes ON {table}
            FOR INSERT WITH CHECK (user_id = current_setting('app.user_id', true)::uuid);
    END IF;
END $$;
DO $$
BEGIN
    ALTER PUBLICATION {PUBLICATION} ADD TABLE {table};
EXCEPTION
    WHEN duplicate_object THEN NULL;
END $$;
"#
    );

    sqlx::raw_sql(&ddl).execute(db.pool()).await?;
    tracing::debug!(vault_id = %vault_id, table = %table, "Ensured vault partition");
    Ok(())
}

/// Drop the vault's partition and sweep any of its rows out of the default
/// partition. Dropping the table removes the vault's changes in O(1).
pub async fn drop_partition(db: &Database, vault_id: &str) -> Result<(), StorageError> {
    let table = partition_table_name(vault_id);

    sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(db.pool())
        .await?;
    sqlx::query("DELETE FROM sync_changes_default WHERE vault_id = $1")
        .bind(vault_id)
        .execute(db.pool())
        .await?;

    tracing::debug!(vault_id = %vault_id, table = %table, "Dropped vault partition");
    Ok(())
}

/// Ensure every registered vault has its partition, policies, and feed
/// membership. Run at startup.
pub async fn bootstrap(db: &Database) -> Result<usize, StorageError> {
    let vault_ids: Vec<String> = sqlx::query_scalar("SELECT vault_id FROM vault_keys")
        .fetch_all(db.pool())
        .await?;

    for vault_id in &vault_ids {
        ensure_partition(db, vault_id).await?;
    }

    tracing::info!(count = vault_ids.len(), "Partition bootstrap complete");
    Ok(vault_ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_name_replaces_hyphens() {
        assert_eq!(
            partition_table_name("8b33f41a-7137-4101-9ca5-0ae52f0da1de"),
            "sync_changes_8b33f41a_7137_4101_9ca5_0ae52f0da1de"
        );
    }

    #[test]
    fn test_partition_name_is_identifier_safe() {
        let name = partition_table_name("x; DROP TABLE vault_keys; --");
        assert!(name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_'));
    }

    #[test]
    fn test_partition_name_folds_case() {
        assert_eq!(partition_table_name("ABC-123"), "sync_changes_abc_123");
    }

    #[test]
    fn test_partition_name_respects_identifier_limit() {
        let long = "v".repeat(100);
        assert!(partition_table_name(&long).len() <= 63);
    }

    #[test]
    fn test_quote_literal_escapes_quotes() {
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal("plain"), "'plain'");
    }
}

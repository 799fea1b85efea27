//! Cell-addressed CRDT change store.
//!
//! Push is an all-or-nothing transaction: the submission list is validated
//! up front (batch sequence sets must be complete and duplicate-free), then
//! written as chunked multi-row upserts whose merge rule is gated on the HLC
//! total order. `updated_at` advances only when a strictly newer HLC
//! replaces a cell; the pull cursor depends on that.
//!
//! Pull pages rows, not cells: the row page is computed from the per-row
//! `max(updated_at)` aggregate strictly above the composite cursor, then
//! every cell of the paged rows is returned so a peer can always materialize
//! complete rows.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use uuid::Uuid;

use super::models::{ChangeRow, RowPageEntry};
use super::{Database, StorageError};
use crate::hlc;

/// Rows per upsert statement. Ten bind parameters per row keeps a full chunk
/// well under the backend's parameter limit.
const UPSERT_CHUNK_ROWS: usize = 5_000;

pub const PULL_LIMIT_DEFAULT: i64 = 100;
pub const PULL_LIMIT_MAX: i64 = 1_000;

// ============================================================================
// Types
// ============================================================================

/// One incoming cell write.
#[derive(Debug, Clone)]
pub struct ChangeSubmission {
    pub batch_id: Option<String>,
    pub batch_seq: Option<i64>,
    pub batch_total: Option<i64>,
    pub column_name: Option<String>,
    pub device_id: Option<String>,
    pub encrypted_value: Option<String>,
    pub hlc_timestamp: String,
    pub nonce: Option<String>,
    pub row_pks: String,
    pub table_name: String,
}

#[derive(Debug, Clone)]
pub struct PushOutcome {
    /// Rows inserted or replaced. Stale writes (HLC not newer) touch nothing.
    pub count: u64,
    /// Greatest HLC among the accepted submissions.
    pub last_hlc: Option<String>,
    pub server_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PullCursor {
    pub after_row_pks: String,
    pub after_table_name: String,
    pub after_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PullQuery {
    pub cursor: Option<PullCursor>,
    pub exclude_device_id: Option<String>,
    pub limit: i64,
    pub vault_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct PullPage {
    pub changes: Vec<ChangeRow>,
    pub has_more: bool,
    pub last_row_pks: Option<String>,
    pub last_table_name: Option<String>,
    /// `max(updated_at)` of the last returned row; the caller's next cursor.
    pub server_timestamp: Option<DateTime<Utc>>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushValidationError {
    #[error("Conflicting batch totals")]
    ConflictingTotals {
        batch_id: String,
        expected: i64,
        received: i64,
    },
    #[error("Duplicate sequence numbers in batch")]
    DuplicateSequences { batch_id: String },
    #[error("Incomplete batch metadata")]
    IncompleteMetadata { batch_id: String },
    #[error("Invalid batch total")]
    InvalidTotal { batch_id: String, total: i64 },
    #[error("Missing sequence numbers in batch")]
    MissingSequences {
        batch_id: String,
        expected: i64,
        missing: Vec<i64>,
        received: i64,
    },
    #[error("Sequence number out of range")]
    SequenceOutOfRange { batch_id: String, sequence: i64 },
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Validation(#[from] PushValidationError),
}

// ============================================================================
// Validation
// ============================================================================

/// Scan the full submission list before any write.
///
/// For every `batch_id` present, the sequence numbers must form exactly
/// `{1..batch_total}` and all members must agree on the total. Unbatched
/// changes pass through untouched.
pub fn validate_batches(changes: &[ChangeSubmission]) -> Result<(), PushValidationError> {
    let mut batches: HashMap<&str, (i64, Vec<i64>)> = HashMap::new();

    for change in changes {
        match (&change.batch_id, change.batch_seq, change.batch_total) {
            (None, None, None) => continue,
            (Some(id), Some(seq), Some(total)) => {
                let entry = batches.entry(id.as_str()).or_insert_with(|| (total, Vec::new()));
                if entry.0 != total {
                    return Err(PushValidationError::ConflictingTotals {
                        batch_id: id.clone(),
                        expected: entry.0,
                        received: total,
                    });
                }
                entry.1.push(seq);
            }
            (id, _, _) => {
                return Err(PushValidationError::IncompleteMetadata {
                    batch_id: id.clone().unwrap_or_default(),
                });
            }
        }
    }

    for (batch_id, (total, seqs)) in &batches {
        if *total < 1 {
            return Err(PushValidationError::InvalidTotal {
                batch_id: (*batch_id).to_string(),
                total: *total,
            });
        }
        if let Some(seq) = seqs.iter().find(|s| **s < 1 || **s > *total) {
            return Err(PushValidationError::SequenceOutOfRange {
                batch_id: (*batch_id).to_string(),
                sequence: *seq,
            });
        }
        let unique: HashSet<i64> = seqs.iter().copied().collect();
        if unique.len() != seqs.len() {
            return Err(PushValidationError::DuplicateSequences {
                batch_id: (*batch_id).to_string(),
            });
        }
        if (unique.len() as i64) != *total {
            let missing: Vec<i64> = (1..=*total).filter(|n| !unique.contains(n)).collect();
            return Err(PushValidationError::MissingSequences {
                batch_id: (*batch_id).to_string(),
                expected: *total,
                missing,
                received: seqs.len() as i64,
            });
        }
    }

    Ok(())
}

/// Collapse duplicate cells within one submission, keeping the greatest HLC.
///
/// A single multi-row upsert may not touch the same row twice; last-write-wins
/// makes the reduction transparent.
fn dedupe_latest(changes: Vec<ChangeSubmission>) -> Vec<ChangeSubmission> {
    let mut latest: HashMap<(String, String, Option<String>), ChangeSubmission> =
        HashMap::with_capacity(changes.len());
    for change in changes {
        let key = (
            change.table_name.clone(),
            change.row_pks.clone(),
            change.column_name.clone(),
        );
        match latest.get(&key) {
            Some(existing) if !hlc::is_newer(&change.hlc_timestamp, &existing.hlc_timestamp) => {}
            _ => {
                latest.insert(key, change);
            }
        }
    }
    latest.into_values().collect()
}

// ============================================================================
// Push
// ============================================================================

/// Apply a push: validate, then upsert everything in one transaction.
pub async fn push(
    db: &Database,
    user_id: Uuid,
    vault_id: &str,
    changes: Vec<ChangeSubmission>,
) -> Result<PushOutcome, PushError> {
    validate_batches(&changes)?;

    let deduped = dedupe_latest(changes);
    let last_hlc =
        hlc::max_hlc(deduped.iter().map(|c| c.hlc_timestamp.as_str())).map(String::from);
    let now = Utc::now();

    let mut tx = db.pool().begin().await.map_err(StorageError::from)?;
    let mut count = 0u64;

    for chunk in deduped.chunks(UPSERT_CHUNK_ROWS) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO sync_changes \
             (user_id, vault_id, table_name, row_pks, column_name, hlc_timestamp, \
              device_id, encrypted_value, nonce, updated_at) ",
        );
        builder.push_values(chunk, |mut row, change| {
            row.push_bind(user_id)
                .push_bind(vault_id)
                .push_bind(&change.table_name)
                .push_bind(&change.row_pks)
                .push_bind(&change.column_name)
                .push_bind(&change.hlc_timestamp)
                .push_bind(&change.device_id)
                .push_bind(&change.encrypted_value)
                .push_bind(&change.nonce)
                .push_bind(now);
        });
        builder.push(
            " ON CONFLICT (vault_id, table_name, row_pks, column_name) DO UPDATE SET \
             hlc_timestamp = EXCLUDED.hlc_timestamp, \
             device_id = EXCLUDED.device_id, \
             encrypted_value = EXCLUDED.encrypted_value, \
             nonce = EXCLUDED.nonce, \
             updated_at = EXCLUDED.updated_at \
             WHERE sync_changes.hlc_timestamp < EXCLUDED.hlc_timestamp",
        );
        count += builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?
            .rows_affected();
    }

    tx.commit().await.map_err(StorageError::from)?;

    Ok(PushOutcome {
        count,
        last_hlc,
        server_timestamp: Utc::now(),
    })
}

// ============================================================================
// Pull
// ============================================================================

/// Clamp a requested page size into `[1, 1000]`, defaulting to 100.
pub fn clamp_limit(requested: Option<i64>) -> i64 {
    requested.unwrap_or(PULL_LIMIT_DEFAULT).clamp(1, PULL_LIMIT_MAX)
}

/// Read one page of changes after the composite cursor.
pub async fn pull(db: &Database, user_id: Uuid, query: &PullQuery) -> Result<PullPage, StorageError> {
    // Both steps run on one snapshot so the column fetch cannot see rows the
    // row page did not.
    let mut tx = db.pool().begin().await?;

    let (after_updated, after_table, after_pks) = match &query.cursor {
        Some(c) => (
            Some(c.after_updated_at),
            Some(c.after_table_name.clone()),
            Some(c.after_row_pks.clone()),
        ),
        None => (None, None, None),
    };

    let page: Vec<RowPageEntry> = sqlx::query_as(
        r#"
        SELECT table_name, row_pks, MAX(updated_at) AS max_updated
        FROM sync_changes
        WHERE vault_id = $1
          AND user_id = $2
          AND ($3::text IS NULL OR device_id IS DISTINCT FROM $3)
        GROUP BY table_name, row_pks
        HAVING $4::timestamptz IS NULL
            OR (MAX(updated_at), table_name, row_pks) > ($4, $5::text, $6::text)
        ORDER BY max_updated ASC, table_name ASC, row_pks ASC
        LIMIT $7
        "#,
    )
    .bind(&query.vault_id)
    .bind(user_id)
    .bind(&query.exclude_device_id)
    .bind(after_updated)
    .bind(after_table)
    .bind(after_pks)
    .bind(query.limit)
    .fetch_all(&mut *tx)
    .await?;

    if page.is_empty() {
        tx.commit().await?;
        return Ok(PullPage::default());
    }

    // Every cell of every paged row, regardless of when it last changed: a
    // newly-arriving peer must be able to materialize the full row.
    let tables: Vec<&str> = page.iter().map(|r| r.table_name.as_str()).collect();
    let pks: Vec<&str> = page.iter().map(|r| r.row_pks.as_str()).collect();

    let mut changes: Vec<ChangeRow> = sqlx::query_as(
        r#"
        SELECT c.table_name, c.row_pks, c.column_name, c.hlc_timestamp,
               c.device_id, c.encrypted_value, c.nonce, c.updated_at
        FROM sync_changes c
        JOIN unnest($3::text[], $4::text[]) AS page(table_name, row_pks)
          ON c.table_name = page.table_name AND c.row_pks = page.row_pks
        WHERE c.vault_id = $1
          AND c.user_id = $2
        "#,
    )
    .bind(&query.vault_id)
    .bind(user_id)
    .bind(&tables)
    .bind(&pks)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    // Emit cells in row-page order so pages read contiguously.
    let order: HashMap<(&str, &str), usize> = page
        .iter()
        .enumerate()
        .map(|(idx, r)| ((r.table_name.as_str(), r.row_pks.as_str()), idx))
        .collect();
    changes.sort_by(|a, b| {
        let pos_a = order.get(&(a.table_name.as_str(), a.row_pks.as_str()));
        let pos_b = order.get(&(b.table_name.as_str(), b.row_pks.as_str()));
        pos_a.cmp(&pos_b).then_with(|| a.column_name.cmp(&b.column_name))
    });

    let has_more = page.len() as i64 == query.limit;
    let last = page.last().expect("page is non-empty");

    Ok(PullPage {
        changes,
        has_more,
        last_row_pks: Some(last.row_pks.clone()),
        last_table_name: Some(last.table_name.clone()),
        server_timestamp: Some(last.max_updated),
    })
}

/// UTC ISO-8601 with microsecond precision. Truncating this re-emits rows on
/// the next pull.
pub fn format_server_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::change;
    use chrono::TimeZone;

    fn batched(id: &str, seq: i64, total: i64) -> ChangeSubmission {
        let mut c = change("notes", r#"["r1"]"#, Some("title"), &format!("hlc-{seq}"));
        c.batch_id = Some(id.to_string());
        c.batch_seq = Some(seq);
        c.batch_total = Some(total);
        c
    }

    #[test]
    fn test_validate_accepts_complete_batch() {
        let changes: Vec<_> = (1..=5).map(|s| batched("B", s, 5)).collect();
        assert_eq!(validate_batches(&changes), Ok(()));
    }

    #[test]
    fn test_validate_accepts_mixed_batched_and_unbatched() {
        let mut changes: Vec<_> = (1..=3).map(|s| batched("B", s, 3)).collect();
        changes.push(change("notes", r#"["r9"]"#, Some("body"), "hlc-x"));
        assert_eq!(validate_batches(&changes), Ok(()));
    }

    #[test]
    fn test_validate_reports_missing_sequences() {
        let changes = vec![batched("B", 1, 4), batched("B", 2, 4), batched("B", 4, 4)];
        assert_eq!(
            validate_batches(&changes),
            Err(PushValidationError::MissingSequences {
                batch_id: "B".to_string(),
                expected: 4,
                missing: vec![3],
                received: 3,
            })
        );
    }

    #[test]
    fn test_validate_duplicates_win_over_missing() {
        // [1,2,4,5,5] out of 5: sequence 3 is also missing, but the duplicate
        // is reported.
        let changes = vec![
            batched("B", 1, 5),
            batched("B", 2, 5),
            batched("B", 4, 5),
            batched("B", 5, 5),
            batched("B", 5, 5),
        ];
        assert_eq!(
            validate_batches(&changes),
            Err(PushValidationError::DuplicateSequences {
                batch_id: "B".to_string()
            })
        );
    }

    #[test]
    fn test_validate_rejects_conflicting_totals() {
        let changes = vec![batched("B", 1, 2), batched("B", 2, 3)];
        assert_eq!(
            validate_batches(&changes),
            Err(PushValidationError::ConflictingTotals {
                batch_id: "B".to_string(),
                expected: 2,
                received: 3,
            })
        );
    }

    #[test]
    fn test_validate_rejects_partial_metadata() {
        let mut c = change("notes", r#"["r1"]"#, Some("title"), "hlc-1");
        c.batch_id = Some("B".to_string());
        assert_eq!(
            validate_batches(&[c]),
            Err(PushValidationError::IncompleteMetadata {
                batch_id: "B".to_string()
            })
        );
    }

    #[test]
    fn test_validate_rejects_out_of_range_sequence() {
        let changes = vec![batched("B", 1, 2), batched("B", 7, 2)];
        assert_eq!(
            validate_batches(&changes),
            Err(PushValidationError::SequenceOutOfRange {
                batch_id: "B".to_string(),
                sequence: 7,
            })
        );
    }

    #[test]
    fn test_validate_rejects_nonpositive_total() {
        let changes = vec![batched("B", 1, 0)];
        // Sequence-range check needs a sane total first.
        assert!(matches!(
            validate_batches(&changes),
            Err(PushValidationError::SequenceOutOfRange { .. })
                | Err(PushValidationError::InvalidTotal { .. })
        ));
    }

    #[test]
    fn test_validate_independent_batches() {
        let mut changes: Vec<_> = (1..=2).map(|s| batched("A", s, 2)).collect();
        changes.extend((1..=3).map(|s| batched("B", s, 3)));
        assert_eq!(validate_batches(&changes), Ok(()));
    }

    #[test]
    fn test_dedupe_keeps_greatest_hlc() {
        let older = change("notes", r#"["r1"]"#, Some("title"), "hlc-a");
        let newer = change("notes", r#"["r1"]"#, Some("title"), "hlc-b");
        let other = change("notes", r#"["r2"]"#, Some("title"), "hlc-a");

        let out = dedupe_latest(vec![newer.clone(), older, other]);
        assert_eq!(out.len(), 2);
        let kept = out
            .iter()
            .find(|c| c.row_pks == r#"["r1"]"#)
            .expect("cell survives");
        assert_eq!(kept.hlc_timestamp, "hlc-b");
    }

    #[test]
    fn test_dedupe_distinguishes_columns_and_tombstones() {
        let col = change("notes", r#"["r1"]"#, Some("title"), "hlc-a");
        let row_tombstone = change("notes", r#"["r1"]"#, None, "hlc-a");
        assert_eq!(dedupe_latest(vec![col, row_tombstone]).len(), 2);
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), 100);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-5)), 1);
        assert_eq!(clamp_limit(Some(250)), 250);
        assert_eq!(clamp_limit(Some(10_000)), 1_000);
    }

    #[test]
    fn test_server_timestamp_keeps_microseconds() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 4, 12, 30, 15).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(
            format_server_timestamp(ts),
            "2024-05-04T12:30:15.123456Z"
        );
        // Whole seconds still carry the full precision field.
        let ts = Utc.with_ymd_and_hms(2024, 5, 4, 12, 30, 15).unwrap();
        assert_eq!(format_server_timestamp(ts), "2024-05-04T12:30:15.000000Z");
    }
}

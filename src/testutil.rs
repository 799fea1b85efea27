//! Shared test helpers — available to all `#[cfg(test)]` modules in the crate.

use crate::storage::changes::ChangeSubmission;

/// A minimal change submission for the given cell. No batch metadata, no
/// device, a value derived from the HLC.
pub fn change(
    table_name: &str,
    row_pks: &str,
    column_name: Option<&str>,
    hlc: &str,
) -> ChangeSubmission {
    ChangeSubmission {
        batch_id: None,
        batch_seq: None,
        batch_total: None,
        column_name: column_name.map(str::to_string),
        device_id: None,
        encrypted_value: Some(format!("ct:{hlc}")),
        hlc_timestamp: hlc.to_string(),
        nonce: Some("AAAAAAAAAAAAAAAA".to_string()),
        row_pks: row_pks.to_string(),
        table_name: table_name.to_string(),
    }
}

//! Legacy importer: one-shot conversion of the old single-JSON export.
//!
//! ```json
//! { "data": { "contacts": "xc1:...", "pets": [{ "id": 1, "name": "Rex" }] },
//!   "master_password_hash": "..." }
//! ```
//!
//! A category is either one sealed string holding a JSON array, or a
//! plaintext array. Each category is written back through the record store,
//! so it ends up sealed under the current key.

use std::collections::BTreeMap;
use std::path::Path;

use lockbox_core::{validate_category, Record, VaultError, VaultResult};
use lockbox_crypto::VaultSession;
use lockbox_store::RecordStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct LegacyExport {
    data: BTreeMap<String, Value>,
    #[serde(default)]
    master_password_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyFailure {
    pub category: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LegacyImportReport {
    /// Records written across all categories
    pub records: usize,
    /// Categories imported successfully
    pub keys: Vec<String>,
    /// Categories that failed, and elements skipped for lacking an id
    pub failures: Vec<LegacyFailure>,
    pub had_password_hash: bool,
}

/// Import a legacy export at `path` into `store` under `session`.
///
/// A malformed file is a `Format` error. Once parsed, each category is
/// handled on its own and failures are collected in the report.
pub async fn import_legacy_backup(
    path: &Path,
    store: &RecordStore,
    session: &VaultSession,
) -> VaultResult<LegacyImportReport> {
    session.key()?;
    let bytes = tokio::fs::read(path).await?;
    let export: LegacyExport = serde_json::from_slice(&bytes)
        .map_err(|e| VaultError::Format(format!("legacy export {}: {e}", path.display())))?;

    let mut report = LegacyImportReport {
        had_password_hash: export.master_password_hash.is_some(),
        ..Default::default()
    };

    for (category, payload) in export.data {
        match import_category(store, session, &category, payload, &mut report).await {
            Ok(count) => {
                info!(category = %category, records = count, "legacy category imported");
                report.records += count;
                report.keys.push(category);
            }
            Err(e) => {
                warn!(category = %category, "legacy category failed: {e}");
                report.failures.push(LegacyFailure {
                    category,
                    message: e.to_string(),
                });
            }
        }
    }
    Ok(report)
}

async fn import_category(
    store: &RecordStore,
    session: &VaultSession,
    category: &str,
    payload: Value,
    report: &mut LegacyImportReport,
) -> VaultResult<usize> {
    validate_category(category)?;
    let items = match payload {
        Value::String(sealed) => {
            let plaintext = session.open(&sealed)?;
            match serde_json::from_slice::<Value>(&plaintext)? {
                Value::Array(items) => items,
                _ => return Err(VaultError::Format("decrypted category is not an array".into())),
            }
        }
        Value::Array(items) => items,
        _ => {
            return Err(VaultError::Format(
                "category is neither an encrypted string nor an array".into(),
            ))
        }
    };

    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match into_record(category, item) {
            Some(record) => records.push(record),
            None => {
                warn!(category, index, "legacy element has no id, skipped");
                report.failures.push(LegacyFailure {
                    category: category.to_string(),
                    message: format!("element {index} has no id"),
                });
            }
        }
    }

    store.save(session, category, &records).await?;
    Ok(records.len())
}

/// `id` (string or number) becomes the record id; the remaining keys are
/// the fields.
fn into_record(category: &str, item: Value) -> Option<Record> {
    let Value::Object(mut map) = item else {
        return None;
    };
    let id = match map.remove("id")? {
        Value::String(s) if !s.is_empty() => s,
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(Record::new(id, category, Value::Object(map)))
}

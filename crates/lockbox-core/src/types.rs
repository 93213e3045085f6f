use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{VaultError, VaultResult};

/// Longest accepted category name, in bytes
pub const MAX_CATEGORY_LEN: usize = 64;

/// A persisted entity. The store knows nothing about `fields` beyond
/// "serializable".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<F = Value> {
    pub id: String,
    pub category: String,
    pub fields: F,
}

impl<F> Record<F> {
    pub fn new(id: impl Into<String>, category: impl Into<String>, fields: F) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            fields,
        }
    }
}

/// Physical layout of one category under the data root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordLayout {
    /// `<category>.vault`: one envelope holding every sealed record
    Container,
    /// `<category>/<id>.rec`: one sealed file per record (older vaults)
    PerRecord,
}

impl std::fmt::Display for RecordLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordLayout::Container => f.write_str("container"),
            RecordLayout::PerRecord => f.write_str("per_record"),
        }
    }
}

/// Pointer from a record to an out-of-line encrypted attachment.
///
/// Serialized in camelCase so a record's `fields` can embed it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReference {
    #[serde(default)]
    pub id: String,
    /// Path relative to the documents root: `<category>/<id>.enc`
    pub path: String,
    pub filename: String,
    pub mime_type: String,
    #[serde(default)]
    pub uploaded_at: DateTime<Utc>,
}

impl DocumentReference {
    /// Every reference embedded anywhere in `value`, in document order.
    ///
    /// An object counts as a reference when it carries `path`, `filename`
    /// and `mimeType` and deserializes cleanly.
    pub fn collect_from(value: &Value) -> Vec<DocumentReference> {
        let mut found = Vec::new();
        collect_refs(value, &mut found);
        found
    }

    /// Remove every embedded reference whose path equals `path`.
    /// Returns the number of references removed.
    pub fn remove_from(value: &mut Value, path: &str) -> usize {
        match value {
            Value::Array(items) => {
                let before = items.len();
                items.retain(|item| !is_reference_to(item, path));
                let mut removed = before - items.len();
                for item in items.iter_mut() {
                    removed += Self::remove_from(item, path);
                }
                removed
            }
            Value::Object(map) => {
                let doomed: Vec<String> = map
                    .iter()
                    .filter(|(_, v)| is_reference_to(v, path))
                    .map(|(k, _)| k.clone())
                    .collect();
                let mut removed = doomed.len();
                for key in doomed {
                    map.remove(&key);
                }
                for item in map.values_mut() {
                    removed += Self::remove_from(item, path);
                }
                removed
            }
            _ => 0,
        }
    }
}

fn looks_like_reference(map: &serde_json::Map<String, Value>) -> bool {
    map.get("path").is_some_and(Value::is_string)
        && map.get("filename").is_some_and(Value::is_string)
        && map.get("mimeType").is_some_and(Value::is_string)
}

fn is_reference_to(value: &Value, path: &str) -> bool {
    match value {
        Value::Object(map) => {
            looks_like_reference(map) && map.get("path").and_then(Value::as_str) == Some(path)
        }
        _ => false,
    }
}

fn collect_refs(value: &Value, out: &mut Vec<DocumentReference>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_refs(item, out)),
        Value::Object(map) => {
            if looks_like_reference(map) {
                if let Ok(reference) = serde_json::from_value(value.clone()) {
                    out.push(reference);
                    return;
                }
            }
            map.values().for_each(|item| collect_refs(item, out));
        }
        _ => {}
    }
}

/// One physical file, addressed relative to its root
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path with `/` separators
    pub path: String,
    pub size: u64,
    /// BLAKE3 of the file bytes (hex), when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blake3: Option<String>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            blake3: None,
        }
    }
}

/// Reject category names that are empty, too long, or could escape the
/// data root.
pub fn validate_category(name: &str) -> VaultResult<()> {
    if name.is_empty() || name.len() > MAX_CATEGORY_LEN {
        return Err(VaultError::InvalidInput(format!(
            "category name must be 1..={MAX_CATEGORY_LEN} bytes: {name:?}"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(VaultError::InvalidInput(format!(
            "category name may only contain [A-Za-z0-9_-]: {name:?}"
        )));
    }
    Ok(())
}

//! Backup manifest: the index of an archive, written last.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use lockbox_core::{FileEntry, VaultError, VaultResult};
use lockbox_store::category_of_data_path;
use serde::{Deserialize, Serialize};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// Describes exactly what one archive holds. Read-only once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    /// Paths relative to the archive's `data/` directory
    pub data_files: Vec<FileEntry>,
    /// Paths relative to the archive's `documents/` directory
    pub document_files: Vec<FileEntry>,
    /// Whether `keyfile.json` was copied into the archive
    pub has_master_key: bool,
}

impl BackupManifest {
    pub fn from_bytes(data: &[u8]) -> VaultResult<Self> {
        let manifest: BackupManifest = serde_json::from_slice(data)
            .map_err(|e| VaultError::Format(format!("backup manifest: {e}")))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(VaultError::Format(format!(
                "unsupported backup manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> VaultResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn total_bytes(&self) -> u64 {
        self.data_files
            .iter()
            .chain(&self.document_files)
            .map(|f| f.size)
            .sum()
    }

    /// Every category with data or documents in the archive, sorted.
    pub fn categories(&self) -> Vec<String> {
        let data = self
            .data_files
            .iter()
            .filter_map(|f| category_of_data_path(&f.path));
        let documents = self
            .document_files
            .iter()
            .filter_map(|f| f.path.split_once('/').map(|(c, _)| c));
        data.chain(documents)
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

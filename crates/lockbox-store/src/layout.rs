//! Physical category layouts.
//!
//! ```text
//! data/
//!   contacts.vault          container: {"format":"container","version":1,"records":["xc1:..",..]}
//!   pets/                   per-record (older vaults)
//!     FORMAT                {"format":"per_record","version":1}
//!     MTcwMDAwMDAwMDAwMA.rec one sealed record, named by base64url(id)
//! ```
//!
//! Both layouts hold the same thing: a list of independently sealed records.
//! Which one a category uses is read from disk, never from its name.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use lockbox_core::{validate_category, RecordLayout, VaultError, VaultResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fs::{is_dir, is_file, list_names, read_optional, remove_dir_if_exists, write_atomic};

pub const CONTAINER_EXT: &str = "vault";
pub const RECORD_EXT: &str = "rec";
pub const FORMAT_MARKER: &str = "FORMAT";

const LAYOUT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ContainerFile {
    format: RecordLayout,
    version: u32,
    records: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FormatMarker {
    format: RecordLayout,
    version: u32,
}

/// One sealed record as found on disk.
///
/// `name` is the file name for per-record categories and `#<index>` inside
/// a container. It identifies the entry in logs and reports.
#[derive(Debug, Clone)]
pub(crate) struct SealedEntry {
    pub name: String,
    pub sealed: String,
}

pub fn container_path(root: &Path, category: &str) -> PathBuf {
    root.join(format!("{category}.{CONTAINER_EXT}"))
}

pub fn record_dir(root: &Path, category: &str) -> PathBuf {
    root.join(category)
}

/// Longest encoded id used verbatim in a file name. Most filesystems cap a
/// name at 255 bytes.
const MAX_ENCODED_ID: usize = 200;

/// File name of a per-record entry: `base64url(id).rec`, or `~<blake3>.rec`
/// when the encoded id would not fit in a file name. The id itself lives in
/// the sealed record, so the name only has to be unique.
pub fn record_file_name(id: &str) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(id.as_bytes());
    if encoded.len() <= MAX_ENCODED_ID {
        format!("{encoded}.{RECORD_EXT}")
    } else {
        format!("~{}.{RECORD_EXT}", blake3::hash(id.as_bytes()).to_hex())
    }
}

/// Category owning a data file, from its path relative to the data root.
///
/// `contacts.vault` and `pets/<x>.rec` map to `contacts` and `pets`.
pub fn category_of_data_path(path: &str) -> Option<&str> {
    match path.split_once('/') {
        Some((dir, _)) => Some(dir),
        None => path.strip_suffix(&format!(".{CONTAINER_EXT}")),
    }
}

fn staging_dir(root: &Path, category: &str) -> PathBuf {
    root.join(format!(".{category}.staging"))
}

fn retired_dir(root: &Path, category: &str) -> PathBuf {
    root.join(format!(".{category}.old"))
}

/// Layout of `category` on disk, or `None` if it has never been written.
///
/// Only reads. An interrupted swap is repaired by [`recover_interrupted_swap`]
/// on the write paths and when a vault is opened.
pub(crate) async fn detect(root: &Path, category: &str) -> VaultResult<Option<RecordLayout>> {
    let container = is_file(&container_path(root, category)).await;
    let per_record = is_file(&record_dir(root, category).join(FORMAT_MARKER)).await;
    match (container, per_record) {
        (true, true) => {
            warn!(category, "category has both layouts on disk, using the container");
            Ok(Some(RecordLayout::Container))
        }
        (true, false) => Ok(Some(RecordLayout::Container)),
        (false, true) => Ok(Some(RecordLayout::PerRecord)),
        (false, false) => Ok(None),
    }
}

/// A crash between the two renames of a directory swap leaves only the
/// retired copy. Put it back. Returns whether anything was moved.
pub(crate) async fn recover_interrupted_swap(root: &Path, category: &str) -> VaultResult<bool> {
    let dir = record_dir(root, category);
    let retired = retired_dir(root, category);
    if is_dir(&retired).await && !is_dir(&dir).await {
        warn!(category, "restoring record directory from interrupted swap");
        tokio::fs::rename(&retired, &dir).await?;
        return Ok(true);
    }
    Ok(false)
}

/// Categories with a retired `.<category>.old` directory under `root`.
pub(crate) async fn retired_categories(root: &Path) -> VaultResult<Vec<String>> {
    let mut reader = match tokio::fs::read_dir(root).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut found = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(category) = name.strip_prefix('.').and_then(|n| n.strip_suffix(".old")) {
            if validate_category(category).is_ok() {
                found.push(category.to_string());
            }
        }
    }
    found.sort();
    Ok(found)
}

pub(crate) async fn read_entries(
    root: &Path,
    category: &str,
    layout: RecordLayout,
) -> VaultResult<Vec<SealedEntry>> {
    match layout {
        RecordLayout::Container => read_container(root, category).await,
        RecordLayout::PerRecord => read_record_dir(root, category).await,
    }
}

async fn read_container(root: &Path, category: &str) -> VaultResult<Vec<SealedEntry>> {
    let path = container_path(root, category);
    let Some(bytes) = read_optional(&path).await? else {
        return Ok(Vec::new());
    };
    let container: ContainerFile = serde_json::from_slice(&bytes)
        .map_err(|e| VaultError::Format(format!("{}: {e}", path.display())))?;
    if container.format != RecordLayout::Container || container.version != LAYOUT_VERSION {
        return Err(VaultError::Format(format!(
            "{}: unsupported format {} v{}",
            path.display(),
            container.format,
            container.version
        )));
    }
    Ok(container
        .records
        .into_iter()
        .enumerate()
        .map(|(i, sealed)| SealedEntry {
            name: format!("#{i}"),
            sealed,
        })
        .collect())
}

async fn read_record_dir(root: &Path, category: &str) -> VaultResult<Vec<SealedEntry>> {
    let dir = record_dir(root, category);
    let marker_path = dir.join(FORMAT_MARKER);
    if let Some(bytes) = read_optional(&marker_path).await? {
        let marker: FormatMarker = serde_json::from_slice(&bytes)
            .map_err(|e| VaultError::Format(format!("{}: {e}", marker_path.display())))?;
        if marker.format != RecordLayout::PerRecord || marker.version != LAYOUT_VERSION {
            return Err(VaultError::Format(format!(
                "{}: unsupported format {} v{}",
                marker_path.display(),
                marker.format,
                marker.version
            )));
        }
    }

    let mut entries = Vec::new();
    for name in list_names(&dir).await? {
        if !name.ends_with(&format!(".{RECORD_EXT}")) {
            continue;
        }
        let bytes = tokio::fs::read(dir.join(&name)).await?;
        entries.push(SealedEntry {
            name,
            sealed: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(entries)
}

/// Atomically replace a container file with `sealed`.
pub(crate) async fn write_container(
    root: &Path,
    category: &str,
    sealed: Vec<String>,
) -> VaultResult<()> {
    let container = ContainerFile {
        format: RecordLayout::Container,
        version: LAYOUT_VERSION,
        records: sealed,
    };
    let bytes = serde_json::to_vec(&container)?;
    write_atomic(&container_path(root, category), &bytes).await?;
    debug!(category, records = container.records.len(), "container written");
    Ok(())
}

fn marker_bytes() -> VaultResult<Vec<u8>> {
    Ok(serde_json::to_vec(&FormatMarker {
        format: RecordLayout::PerRecord,
        version: LAYOUT_VERSION,
    })?)
}

/// Write or replace one per-record file, creating the directory and marker
/// for a new category.
pub(crate) async fn write_record_file(
    root: &Path,
    category: &str,
    name: &str,
    sealed: &str,
) -> VaultResult<()> {
    let dir = record_dir(root, category);
    let marker = dir.join(FORMAT_MARKER);
    if !is_file(&marker).await {
        write_atomic(&marker, &marker_bytes()?).await?;
    }
    write_atomic(&dir.join(name), sealed.as_bytes()).await
}

/// Replace a whole per-record directory: build the new one beside it, then
/// swap it in with two renames.
pub(crate) async fn replace_record_dir(
    root: &Path,
    category: &str,
    entries: &[SealedEntry],
) -> VaultResult<()> {
    let dir = record_dir(root, category);
    let staging = staging_dir(root, category);
    let retired = retired_dir(root, category);

    remove_dir_if_exists(&staging).await?;
    tokio::fs::create_dir_all(&staging).await?;
    write_atomic(&staging.join(FORMAT_MARKER), &marker_bytes()?).await?;
    for entry in entries {
        write_atomic(&staging.join(&entry.name), entry.sealed.as_bytes()).await?;
    }

    remove_dir_if_exists(&retired).await?;
    if is_dir(&dir).await {
        tokio::fs::rename(&dir, &retired).await?;
    }
    tokio::fs::rename(&staging, &dir).await?;
    remove_dir_if_exists(&retired).await?;
    debug!(category, records = entries.len(), "record directory swapped");
    Ok(())
}

/// Remove every file belonging to `category`, in both layouts.
pub(crate) async fn remove_category(root: &Path, category: &str) -> VaultResult<()> {
    crate::fs::remove_file_if_exists(&container_path(root, category)).await?;
    remove_dir_if_exists(&record_dir(root, category)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_file_name_is_path_safe() {
        let name = record_file_name("../../etc/passwd");
        assert!(name.ends_with(".rec"));
        assert!(!name.contains('/'));
    }

    #[test]
    fn test_category_of_data_path() {
        assert_eq!(category_of_data_path("contacts.vault"), Some("contacts"));
        assert_eq!(category_of_data_path("pets/FORMAT"), Some("pets"));
        assert_eq!(category_of_data_path("pets/abc.rec"), Some("pets"));
        assert_eq!(category_of_data_path("stray.txt"), None);
    }

    #[tokio::test]
    async fn test_detect_from_marker() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        assert_eq!(detect(root, "contacts").await.unwrap(), None);

        write_container(root, "contacts", vec!["xc1:a".into()]).await.unwrap();
        write_record_file(root, "pets", "x.rec", "xc1:b").await.unwrap();

        assert_eq!(detect(root, "contacts").await.unwrap(), Some(RecordLayout::Container));
        assert_eq!(detect(root, "pets").await.unwrap(), Some(RecordLayout::PerRecord));

        // a bare directory without a marker is not a category
        tokio::fs::create_dir_all(root.join("stray")).await.unwrap();
        assert_eq!(detect(root, "stray").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_container_version_checked() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            container_path(dir.path(), "contacts"),
            br#"{"format":"container","version":7,"records":[]}"#,
        )
        .await
        .unwrap();

        let result = read_entries(dir.path(), "contacts", RecordLayout::Container).await;
        assert!(matches!(result, Err(VaultError::Format(_))));
    }

    #[tokio::test]
    async fn test_replace_record_dir_swaps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_record_file(root, "pets", "old.rec", "xc1:old").await.unwrap();

        let entries = vec![SealedEntry {
            name: "new.rec".into(),
            sealed: "xc1:new".into(),
        }];
        replace_record_dir(root, "pets", &entries).await.unwrap();

        let read = read_entries(root, "pets", RecordLayout::PerRecord).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].name, "new.rec");
        assert!(!staging_dir(root, "pets").exists());
        assert!(!retired_dir(root, "pets").exists());
    }

    #[tokio::test]
    async fn test_interrupted_swap_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_record_file(root, "pets", "a.rec", "xc1:a").await.unwrap();
        tokio::fs::rename(record_dir(root, "pets"), retired_dir(root, "pets"))
            .await
            .unwrap();

        // detection leaves the disk alone
        assert_eq!(detect(root, "pets").await.unwrap(), None);
        assert!(retired_dir(root, "pets").exists());
        assert_eq!(retired_categories(root).await.unwrap(), vec!["pets"]);

        assert!(recover_interrupted_swap(root, "pets").await.unwrap());
        assert_eq!(detect(root, "pets").await.unwrap(), Some(RecordLayout::PerRecord));
        assert!(record_dir(root, "pets").join("a.rec").exists());
        assert!(!recover_interrupted_swap(root, "pets").await.unwrap());
    }

    #[test]
    fn test_long_ids_get_hashed_file_names() {
        let long = "x".repeat(400);
        let name = record_file_name(&long);
        assert!(name.starts_with('~'));
        assert!(name.len() < 255);
        assert_eq!(name, record_file_name(&long));
        assert_ne!(name, record_file_name(&"y".repeat(400)));
        assert!(!record_file_name("short").starts_with('~'));
    }
}

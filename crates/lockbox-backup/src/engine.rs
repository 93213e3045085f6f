//! Backup engine: copy ciphertext out, read an archive back, restore it.
//!
//! Archive layout:
//!
//! ```text
//! <archive>/
//!   data/...          verbatim copies of the record store files
//!   documents/...     verbatim copies of the document files
//!   keyfile.json      optional, makes the archive restorable on its own
//!   manifest.json     written last; an archive without it is incomplete
//! ```
//!
//! Nothing here decrypts. Files are copied byte for byte and checked
//! against the BLAKE3 hash recorded in the manifest.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lockbox_core::{validate_category, FileEntry, VaultError, VaultResult};
use lockbox_crypto::KeyFile;
use lockbox_store::fs::{join_relative, list_names, remove_dir_if_exists, write_atomic};
use lockbox_store::{category_of_data_path, Vault, DATA_DIR, DOCUMENTS_DIR, KEYFILE_NAME};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manifest::{BackupManifest, MANIFEST_FILE, MANIFEST_VERSION};

/// Progress callback type (files_done, files_total, path)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

#[derive(Default)]
pub struct BackupOptions<'a> {
    /// Copy `keyfile.json` into the archive
    pub include_master_key: bool,
    pub progress: Option<&'a ProgressFn>,
    pub cancel: Option<&'a CancellationToken>,
}

/// What to restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSelection {
    /// Replace the whole vault. Refused unless `acknowledged`.
    Full { acknowledged: bool },
    /// Replace only these categories' data and add their documents
    Categories(Vec<String>),
}

#[derive(Default)]
pub struct RestoreOptions<'a> {
    /// Take a full backup of the live vault here before deleting anything
    pub safety_backup: Option<PathBuf>,
    pub progress: Option<&'a ProgressFn>,
    pub cancel: Option<&'a CancellationToken>,
}

/// One file that could not be restored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreFailure {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub restored_count: usize,
    pub errors: Vec<RestoreFailure>,
    /// The live files changed underneath any open `Vault`; reopen before use
    pub requires_restart: bool,
    pub safety_backup: Option<PathBuf>,
}

/// Problem found while comparing an archive to its manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ArchiveProblem {
    Missing { path: String },
    SizeMismatch { path: String, expected: u64, actual: u64 },
}

/// How the key file inside an archive relates to the live vault's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ArchiveKey {
    /// Same salt as the live key file; its records open with the current password
    Current,
    /// A salt the live vault retired in a password change
    Retired,
    /// A salt the live vault has never used
    Foreign,
    /// The archive carries no key file
    NotIncluded,
}

impl ArchiveKey {
    /// Records from such an archive would be unreadable in the live vault.
    pub fn blocks_category_restore(self) -> bool {
        matches!(self, ArchiveKey::Retired | ArchiveKey::Foreign)
    }
}

/// What an archive holds, read without touching the live vault
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub data_file_count: usize,
    pub document_file_count: usize,
    pub total_bytes: u64,
    pub categories: Vec<String>,
    pub has_master_key: bool,
    pub problems: Vec<ArchiveProblem>,
    /// Set when the report was made against a live vault
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_match: Option<ArchiveKey>,
}

impl ReconciliationReport {
    pub fn is_complete(&self) -> bool {
        self.problems.is_empty()
    }
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> VaultResult<()> {
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(VaultError::Cancelled);
    }
    Ok(())
}

fn report_progress(progress: Option<&ProgressFn>, done: u64, total: u64, path: &str) {
    if let Some(cb) = progress {
        cb(done, total, path);
    }
}

fn hash_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn archive_path(root: &Path, rel: &str) -> VaultResult<PathBuf> {
    join_relative(root, rel)
        .ok_or_else(|| VaultError::Format(format!("unsafe path in archive: {rel:?}")))
}

/// Copy one file byte for byte, returning its entry with size and hash.
async fn copy_verbatim(src: &Path, dst: &Path, rel: &str) -> VaultResult<FileEntry> {
    let bytes = tokio::fs::read(src).await?;
    write_atomic(dst, &bytes).await?;
    Ok(FileEntry {
        path: rel.to_string(),
        size: bytes.len() as u64,
        blake3: Some(hash_hex(&bytes)),
    })
}

/// Snapshot the vault into `target`, which must not exist or be empty.
///
/// Needs no session: ciphertext is copied as is.
pub async fn create_backup(
    vault: &Vault,
    target: &Path,
    options: BackupOptions<'_>,
) -> VaultResult<BackupManifest> {
    if let Ok(meta) = tokio::fs::metadata(target).await {
        if !meta.is_dir() {
            return Err(VaultError::InvalidInput(format!(
                "backup target {} is not a directory",
                target.display()
            )));
        }
        if !list_names(target).await?.is_empty() {
            return Err(VaultError::InvalidInput(format!(
                "backup target {} is not empty",
                target.display()
            )));
        }
    }
    tokio::fs::create_dir_all(target).await?;

    let data_src = vault.records().data_files().await?;
    let doc_src = vault.documents().list_files().await?;
    let total = (data_src.len() + doc_src.len()) as u64;
    let mut done = 0u64;

    let data_root = vault.root().join(DATA_DIR);
    let mut data_files = Vec::with_capacity(data_src.len());
    for file in &data_src {
        check_cancelled(options.cancel)?;
        let src = archive_path(&data_root, &file.path)?;
        let dst = archive_path(&target.join(DATA_DIR), &file.path)?;
        data_files.push(copy_verbatim(&src, &dst, &file.path).await?);
        done += 1;
        report_progress(options.progress, done, total, &file.path);
    }

    let docs_root = vault.root().join(DOCUMENTS_DIR);
    let mut document_files = Vec::with_capacity(doc_src.len());
    for doc in &doc_src {
        check_cancelled(options.cancel)?;
        let src = archive_path(&docs_root, &doc.file.path)?;
        let dst = archive_path(&target.join(DOCUMENTS_DIR), &doc.file.path)?;
        document_files.push(copy_verbatim(&src, &dst, &doc.file.path).await?);
        done += 1;
        report_progress(options.progress, done, total, &doc.file.path);
    }

    if options.include_master_key {
        copy_verbatim(
            &Vault::keyfile_path(vault.root()),
            &target.join(KEYFILE_NAME),
            KEYFILE_NAME,
        )
        .await?;
    }

    let manifest = BackupManifest {
        version: MANIFEST_VERSION,
        timestamp: Utc::now(),
        data_files,
        document_files,
        has_master_key: options.include_master_key,
    };
    write_atomic(&target.join(MANIFEST_FILE), &manifest.to_bytes()?).await?;

    info!(
        target = %target.display(),
        data = manifest.data_files.len(),
        documents = manifest.document_files.len(),
        bytes = manifest.total_bytes(),
        "backup created"
    );
    Ok(manifest)
}

/// Read an archive's manifest.
pub async fn read_manifest(archive: &Path) -> VaultResult<BackupManifest> {
    let path = archive.join(MANIFEST_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => BackupManifest::from_bytes(&bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(VaultError::Format(format!(
            "{} has no {MANIFEST_FILE}: not a backup, or an incomplete one",
            archive.display()
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Describe an archive before restoring it. Only the archive is read.
pub async fn get_reconciliation_report(archive: &Path) -> VaultResult<ReconciliationReport> {
    let manifest = read_manifest(archive).await?;
    let mut problems = Vec::new();

    let listed = [
        (DATA_DIR, &manifest.data_files),
        (DOCUMENTS_DIR, &manifest.document_files),
    ];
    for (dir, files) in listed {
        for file in files {
            let shown = format!("{dir}/{}", file.path);
            let path = archive_path(&archive.join(dir), &file.path)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.len() == file.size => {}
                Ok(meta) => problems.push(ArchiveProblem::SizeMismatch {
                    path: shown,
                    expected: file.size,
                    actual: meta.len(),
                }),
                Err(_) => problems.push(ArchiveProblem::Missing { path: shown }),
            }
        }
    }
    if manifest.has_master_key && tokio::fs::metadata(archive.join(KEYFILE_NAME)).await.is_err() {
        problems.push(ArchiveProblem::Missing {
            path: KEYFILE_NAME.to_string(),
        });
    }

    Ok(ReconciliationReport {
        version: manifest.version,
        timestamp: manifest.timestamp,
        data_file_count: manifest.data_files.len(),
        document_file_count: manifest.document_files.len(),
        total_bytes: manifest.total_bytes(),
        categories: manifest.categories(),
        has_master_key: manifest.has_master_key,
        problems,
        key_match: None,
    })
}

/// [`get_reconciliation_report`] plus how the archive's key file compares
/// with `vault`'s.
pub async fn reconcile_with_vault(vault: &Vault, archive: &Path) -> VaultResult<ReconciliationReport> {
    let mut report = get_reconciliation_report(archive).await?;
    let manifest = read_manifest(archive).await?;
    report.key_match = Some(compare_archive_key(vault, archive, &manifest).await?);
    Ok(report)
}

async fn compare_archive_key(
    vault: &Vault,
    archive: &Path,
    manifest: &BackupManifest,
) -> VaultResult<ArchiveKey> {
    if !manifest.has_master_key {
        return Ok(ArchiveKey::NotIncluded);
    }
    let bytes = match tokio::fs::read(archive.join(KEYFILE_NAME)).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ArchiveKey::NotIncluded),
        Err(e) => return Err(e.into()),
    };
    let archived = KeyFile::from_bytes(&bytes)?;
    let live = vault.keyfile();
    if archived.salt == live.salt {
        Ok(ArchiveKey::Current)
    } else if live.history.iter().any(|r| r.salt == archived.salt) {
        Ok(ArchiveKey::Retired)
    } else {
        Ok(ArchiveKey::Foreign)
    }
}

/// Restore one archived file over the live one after checking it against
/// the manifest.
async fn restore_file(src_root: &Path, dst_root: &Path, entry: &FileEntry) -> VaultResult<()> {
    let src = archive_path(src_root, &entry.path)?;
    let dst = archive_path(dst_root, &entry.path)?;
    let bytes = tokio::fs::read(&src).await?;
    if bytes.len() as u64 != entry.size {
        return Err(VaultError::Format(format!(
            "size {} does not match manifest size {}",
            bytes.len(),
            entry.size
        )));
    }
    if let Some(expected) = &entry.blake3 {
        let actual = hash_hex(&bytes);
        if &actual != expected {
            return Err(VaultError::Format(format!(
                "BLAKE3 {actual} does not match manifest {expected}"
            )));
        }
    }
    write_atomic(&dst, &bytes).await
}

/// Restore `archive` into `vault`.
///
/// A full restore deletes the live data and documents first and is refused
/// unless acknowledged. A category restore replaces only those categories'
/// data and copies their documents in without deleting any. It is refused
/// when the archive's key file differs from the live one, since the live
/// key file is kept. Per-file failures are collected; the rest still
/// restores.
pub async fn restore_backup(
    vault: &Vault,
    archive: &Path,
    selection: RestoreSelection,
    options: RestoreOptions<'_>,
) -> VaultResult<RestoreOutcome> {
    let selected: Option<BTreeSet<String>> = match &selection {
        RestoreSelection::Full { acknowledged: false } => {
            return Err(VaultError::InvalidInput(
                "full restore deletes the current vault and must be acknowledged".into(),
            ));
        }
        RestoreSelection::Full { acknowledged: true } => None,
        RestoreSelection::Categories(names) => {
            if names.is_empty() {
                return Err(VaultError::InvalidInput("no categories selected".into()));
            }
            for name in names {
                validate_category(name)?;
            }
            Some(names.iter().cloned().collect())
        }
    };

    let manifest = read_manifest(archive).await?;
    if let Some(selected) = &selected {
        let available = manifest.categories();
        if let Some(unknown) = selected.iter().find(|c| !available.contains(c)) {
            return Err(VaultError::InvalidInput(format!(
                "category {unknown:?} is not in the backup"
            )));
        }
        match compare_archive_key(vault, archive, &manifest).await? {
            ArchiveKey::Current => {}
            ArchiveKey::NotIncluded => {
                warn!("backup has no key file; restored records may not open with the current password");
            }
            key @ (ArchiveKey::Retired | ArchiveKey::Foreign) => {
                return Err(VaultError::InvalidInput(format!(
                    "backup was sealed under a {} key; restore it in full or into a separate vault",
                    if key == ArchiveKey::Retired { "retired" } else { "different" }
                )));
            }
        }
    }

    let safety_backup = match options.safety_backup {
        Some(dir) => {
            let safety = BackupOptions {
                include_master_key: true,
                progress: None,
                cancel: options.cancel,
            };
            create_backup(vault, &dir, safety).await.map_err(|e| {
                warn!(target = %dir.display(), "safety backup failed, nothing restored: {e}");
                e
            })?;
            info!(target = %dir.display(), "safety backup taken");
            Some(dir)
        }
        None => None,
    };
    check_cancelled(options.cancel)?;

    let data_root = vault.root().join(DATA_DIR);
    let docs_root = vault.root().join(DOCUMENTS_DIR);
    let in_selection = |category: Option<&str>| match &selected {
        None => true,
        Some(set) => category.is_some_and(|c| set.contains(c)),
    };

    match &selected {
        None => {
            remove_dir_if_exists(&data_root).await?;
            remove_dir_if_exists(&docs_root).await?;
            tokio::fs::create_dir_all(&data_root).await?;
            tokio::fs::create_dir_all(&docs_root).await?;
            info!(root = %vault.root().display(), "live vault cleared for full restore");
        }
        Some(set) => {
            for category in set {
                vault.records().remove_category(category).await?;
            }
        }
    }

    let data: Vec<&FileEntry> = manifest
        .data_files
        .iter()
        .filter(|f| in_selection(category_of_data_path(&f.path)))
        .collect();
    let documents: Vec<&FileEntry> = manifest
        .document_files
        .iter()
        .filter(|f| in_selection(f.path.split_once('/').map(|(c, _)| c)))
        .collect();
    let jobs: Vec<(&str, &PathBuf, &FileEntry)> = data
        .into_iter()
        .map(|f| (DATA_DIR, &data_root, f))
        .chain(documents.into_iter().map(|f| (DOCUMENTS_DIR, &docs_root, f)))
        .collect();

    let mut outcome = RestoreOutcome {
        restored_count: 0,
        errors: Vec::new(),
        requires_restart: true,
        safety_backup,
    };
    let total = jobs.len() as u64;
    let mut done = 0u64;

    for (dir, dst_root, entry) in jobs {
        check_cancelled(options.cancel)?;
        let shown = format!("{dir}/{}", entry.path);
        match restore_file(&archive.join(dir), dst_root, entry).await {
            Ok(()) => {
                outcome.restored_count += 1;
                debug!(path = %shown, "restored");
            }
            Err(e) => {
                warn!(path = %shown, "restore failed: {e}");
                outcome.errors.push(RestoreFailure {
                    path: shown.clone(),
                    message: e.to_string(),
                });
            }
        }
        done += 1;
        report_progress(options.progress, done, total, &shown);
    }

    if selected.is_none() && manifest.has_master_key {
        let src = archive.join(KEYFILE_NAME);
        let copied = match tokio::fs::read(&src).await {
            Ok(bytes) => write_atomic(&Vault::keyfile_path(vault.root()), &bytes).await,
            Err(e) => Err(e.into()),
        };
        match copied {
            Ok(()) => outcome.restored_count += 1,
            Err(e) => {
                warn!("key file restore failed: {e}");
                outcome.errors.push(RestoreFailure {
                    path: KEYFILE_NAME.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    info!(
        restored = outcome.restored_count,
        failed = outcome.errors.len(),
        "restore finished, reopen the vault before further use"
    );
    Ok(outcome)
}

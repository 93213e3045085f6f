//! Repair actions. Each one is explicit, idempotent and safe to re-run;
//! none runs automatically.

use lockbox_core::{DocumentReference, Record, VaultResult};
use lockbox_crypto::{KeyFile, VaultSession};
use lockbox_store::{DocumentStore, RecordStore};
use secrecy::SecretString;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::report::{OrphanedFile, ReferenceEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanView {
    /// Decrypted contents
    Readable(Vec<u8>),
    /// The current key cannot open it; it probably predates a password change
    NeedsAlternatePassword,
    /// No key tried could open it. It can still be deleted.
    Unrecoverable,
}

/// Try to open an orphan under the session key.
pub async fn view_orphan(
    documents: &DocumentStore,
    session: &VaultSession,
    orphan: &OrphanedFile,
) -> VaultResult<OrphanView> {
    match documents.open_file(session, &orphan.file.path).await {
        Ok(bytes) => Ok(OrphanView::Readable(bytes)),
        Err(e) if e.is_decryption() => {
            debug!(path = %orphan.file.path, "orphan not readable with the current key");
            Ok(OrphanView::NeedsAlternatePassword)
        }
        Err(e) => Err(e),
    }
}

/// Try to open an orphan with a historical password, under the current salt
/// and every salt retired by earlier password changes.
pub async fn view_orphan_with_password(
    documents: &DocumentStore,
    keyfile: &KeyFile,
    password: &SecretString,
    orphan: &OrphanedFile,
) -> VaultResult<OrphanView> {
    for key in keyfile.candidate_keys(password)? {
        match documents.open_file_with_key(&orphan.file.path, &key).await {
            Ok(bytes) => return Ok(OrphanView::Readable(bytes)),
            Err(e) if e.is_decryption() => continue,
            Err(e) => return Err(e),
        }
    }
    warn!(path = %orphan.file.path, "orphan unrecoverable with the given password");
    Ok(OrphanView::Unrecoverable)
}

/// Delete an orphaned file. No record is touched; none refers to it.
pub async fn delete_orphan(documents: &DocumentStore, orphan: &OrphanedFile) -> VaultResult<bool> {
    let removed = documents.delete_file(&orphan.file.path).await?;
    if removed {
        info!(path = %orphan.file.path, "orphaned document deleted");
    }
    Ok(removed)
}

/// Remove a dangling reference from the record that holds it.
///
/// Returns how many references were removed; 0 once already detached.
pub async fn detach_missing_reference(
    store: &RecordStore,
    session: &VaultSession,
    missing: &ReferenceEntry,
) -> VaultResult<usize> {
    let records: Vec<Record<Value>> = store.get(session, &missing.category).await?;
    let Some(mut record) = records.into_iter().find(|r| r.id == missing.record_id) else {
        return Ok(0);
    };
    let removed = DocumentReference::remove_from(&mut record.fields, &missing.file.path);
    if removed > 0 {
        store
            .update(session, &missing.category, &missing.record_id, &record)
            .await?;
        info!(
            category = %missing.category,
            id = %missing.record_id,
            path = %missing.file.path,
            "dangling document reference detached"
        );
    }
    Ok(removed)
}

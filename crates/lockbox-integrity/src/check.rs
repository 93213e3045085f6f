//! The reconciliation pass: every reference in every record against every
//! document file on disk.

use std::collections::{BTreeMap, BTreeSet};

use lockbox_core::{DocumentReference, FileEntry, VaultError, VaultResult};
use lockbox_crypto::VaultSession;
use lockbox_store::{DocumentStore, RecordStore};
use tracing::{info, warn};

use crate::report::{IntegrityReport, OrphanedFile, ReferenceEntry};

/// Partition references and files into matched, missing and orphaned.
///
/// Read-only. Nothing is repaired here; see [`crate::orphan`].
pub async fn run_integrity_check(
    store: &RecordStore,
    documents: &DocumentStore,
    session: &VaultSession,
) -> VaultResult<IntegrityReport> {
    session.key()?;
    let mut report = IntegrityReport {
        data_files: store.data_files().await?,
        ..Default::default()
    };

    let mut references = Vec::new();
    for category in store.categories().await? {
        let scan = match store.scan(session, &category).await {
            Ok(scan) => scan,
            Err(VaultError::Format(e)) => {
                warn!(category = %category, "category unreadable: {e}");
                report.unreadable_categories.push(category);
                continue;
            }
            Err(e) => return Err(e),
        };
        report.total_data_records += scan.records.len();
        report.unreadable_records += scan.unreadable.len();
        for record in scan.records {
            for reference in DocumentReference::collect_from(&record.fields) {
                references.push(ReferenceEntry {
                    category: category.clone(),
                    record_id: record.id.clone(),
                    filename: reference.filename,
                    file: FileEntry::new(reference.path, 0),
                });
            }
        }
    }

    let files: BTreeMap<String, (String, FileEntry)> = documents
        .list_files()
        .await?
        .into_iter()
        .map(|doc| (doc.file.path.clone(), (doc.category, doc.file)))
        .collect();

    let mut referenced = BTreeSet::new();
    for mut entry in references {
        match files.get(&entry.file.path) {
            Some((_, file)) => {
                entry.file.size = file.size;
                referenced.insert(entry.file.path.clone());
                report.matched.push(entry);
            }
            None => report.missing_files.push(entry),
        }
    }
    report.orphaned_files = files
        .into_iter()
        .filter(|(path, _)| !referenced.contains(path))
        .map(|(_, (category, file))| OrphanedFile { category, file })
        .collect();

    info!(
        records = report.total_data_records,
        matched = report.matched.len(),
        missing = report.missing_files.len(),
        orphaned = report.orphaned_files.len(),
        unreadable = report.unreadable_records,
        "integrity check complete"
    );
    Ok(report)
}

//! lockbox-backup: manifest-described archives of the vault's ciphertext,
//! plus the one-shot legacy importer.
//!
//! Depends on the stores, never on the integrity checker.

pub mod engine;
pub mod legacy;
pub mod manifest;

pub use engine::{
    create_backup, get_reconciliation_report, read_manifest, reconcile_with_vault, restore_backup,
    ArchiveKey, ArchiveProblem, BackupOptions, ProgressFn, ReconciliationReport, RestoreFailure, RestoreOptions,
    RestoreOutcome, RestoreSelection,
};
pub use legacy::{import_legacy_backup, LegacyFailure, LegacyImportReport};
pub use manifest::{BackupManifest, MANIFEST_FILE};

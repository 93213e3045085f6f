//! lockbox-integrity: detects drift between the document references held in
//! records and the document files actually on disk.
//!
//! Records and documents are owned by separate stores linked only by path,
//! so this crate detects and offers repairs instead of enforcing the link.
//! Depends on the stores, never on the backup engine.

pub mod check;
pub mod orphan;
pub mod report;

pub use check::run_integrity_check;
pub use orphan::{
    delete_orphan, detach_missing_reference, view_orphan, view_orphan_with_password, OrphanView,
};
pub use report::{IntegrityReport, OrphanedFile, ReferenceEntry};

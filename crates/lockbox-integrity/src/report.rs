use lockbox_core::FileEntry;
use serde::Serialize;

/// A document reference found in a record, with the file it names
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceEntry {
    /// Category of the owning record
    pub category: String,
    pub record_id: String,
    pub filename: String,
    /// `path` is the reference's path; `size` is the file's size, or 0 when
    /// the file is missing
    pub file: FileEntry,
}

/// A document file no record points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedFile {
    /// Category directory the file sits in
    pub category: String,
    pub file: FileEntry,
}

/// Snapshot of record/document consistency. Computed on demand, never stored.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub total_data_records: usize,
    pub data_files: Vec<FileEntry>,
    /// One entry per reference whose file exists
    pub matched: Vec<ReferenceEntry>,
    /// One entry per reference whose file does not exist
    pub missing_files: Vec<ReferenceEntry>,
    /// One entry per file that no reference names
    pub orphaned_files: Vec<OrphanedFile>,
    /// Records skipped because they could not be decrypted or parsed
    pub unreadable_records: usize,
    /// Categories whose container could not be read at all
    pub unreadable_categories: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.missing_files.is_empty()
            && self.orphaned_files.is_empty()
            && self.unreadable_records == 0
            && self.unreadable_categories.is_empty()
    }
}

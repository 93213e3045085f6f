//! lockbox-store: the encrypted record store and document blob store.
//!
//! Both stores take the unlocked [`VaultSession`](lockbox_crypto::VaultSession)
//! explicitly on every call and share nothing but the vault root. Records
//! reference documents by path; neither store enforces that link. The
//! integrity checker polices it.

pub mod documents;
pub mod fs;
pub mod layout;
pub mod records;
pub mod vault;

pub use documents::{DocumentFile, DocumentStore};
pub use layout::category_of_data_path;
pub use records::{CategoryScan, RecordStore};
pub use vault::{PasswordChange, Vault, DATA_DIR, DOCUMENTS_DIR, KEYFILE_NAME, PENDING_KEYFILE_NAME};

/// Items re-sealed by a key change, and the ones left under the old key
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RekeyReport {
    pub resealed: usize,
    /// Paths or entry names that could not be opened with the old key
    pub skipped: Vec<String>,
}

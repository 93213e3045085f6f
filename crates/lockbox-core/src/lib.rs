//! lockbox-core: shared types, config schema, and the error taxonomy used by
//! every lockbox crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::LockboxConfig;
pub use error::{VaultError, VaultResult};
pub use types::{validate_category, DocumentReference, FileEntry, Record, RecordLayout};

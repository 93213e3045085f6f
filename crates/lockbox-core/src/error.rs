use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    /// Secret was empty or the KDF rejected its parameters.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Wrong key, or ciphertext that is truncated, corrupted, or tampered with.
    ///
    /// This is the only variant that may be read as "wrong password".
    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("duplicate record id {id:?} in category {category:?}")]
    DuplicateId { category: String, id: String },

    #[error("record {id:?} not found in category {category:?}")]
    NotFound { category: String, id: String },

    #[error("document not found: {path}")]
    DocumentNotFound { path: String },

    /// Malformed manifest, key file, category envelope, or legacy export.
    #[error("format error: {0}")]
    Format(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("vault is locked")]
    Locked,

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Format(err.to_string())
    }
}

impl VaultError {
    /// True for failures that mean "this key cannot open this ciphertext".
    pub fn is_decryption(&self) -> bool {
        matches!(self, VaultError::Decryption(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_error_maps_to_format() {
        let err: VaultError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, VaultError::Format(_)));
    }

    #[test]
    fn test_io_error_maps_to_io() {
        let err: VaultError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, VaultError::Io(_)));
        assert!(!err.is_decryption());
    }

    #[test]
    fn test_display_includes_identifiers() {
        let err = VaultError::DuplicateId {
            category: "contacts".into(),
            id: "1700000000000".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("contacts"));
        assert!(msg.contains("1700000000000"));
    }
}

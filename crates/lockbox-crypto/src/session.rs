//! Unlocked-session context.
//!
//! A `VaultSession` is passed explicitly to every store, backup and
//! integrity call. `lock()` drops the key, which zeroizes it.

use lockbox_core::{VaultError, VaultResult};

use crate::cipher::{open, seal};
use crate::kdf::MasterKey;

#[derive(Debug)]
pub struct VaultSession {
    key: Option<MasterKey>,
}

impl VaultSession {
    pub fn new(key: MasterKey) -> Self {
        Self { key: Some(key) }
    }

    pub fn key(&self) -> VaultResult<&MasterKey> {
        self.key.as_ref().ok_or(VaultError::Locked)
    }

    pub fn is_locked(&self) -> bool {
        self.key.is_none()
    }

    /// Discard the key material. Every later call fails with `Locked`.
    pub fn lock(&mut self) {
        if self.key.take().is_some() {
            tracing::debug!("session locked");
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> VaultResult<String> {
        seal(plaintext, self.key()?)
    }

    pub fn open(&self, text: &str) -> VaultResult<Vec<u8>> {
        open(text, self.key()?)
    }
}

//! Key file: everything needed to re-derive and verify the master key.
//!
//! Stored as `keyfile.json` in the vault root and optionally embedded in
//! backups. It never contains the key itself: only the salt, the KDF
//! parameters, and a verifier sealed under the key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use lockbox_core::{VaultError, VaultResult};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::cipher::{open, seal};
use crate::kdf::{derive_master_key, generate_salt, KdfParams, MasterKey};

/// Current key file format version
pub const KEYFILE_VERSION: u32 = 1;

const VERIFIER_PLAINTEXT: &[u8] = b"lockbox-key-check-v1";

/// Salt and params retired by a password change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredKey {
    /// Base64 salt
    pub salt: String,
    pub kdf: KdfParams,
    pub retired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub version: u32,
    /// Base64 salt
    pub salt: String,
    pub kdf: KdfParams,
    /// Fixed constant sealed under the master key
    pub verifier: String,
    pub created_at: DateTime<Utc>,
    /// Oldest first
    #[serde(default)]
    pub history: Vec<RetiredKey>,
}

impl KeyFile {
    /// Create a key file for a new vault and return the derived key with it.
    pub fn create(secret: &SecretString, params: &KdfParams) -> VaultResult<(Self, MasterKey)> {
        let salt = generate_salt();
        let key = derive_master_key(secret, &salt, params)?;
        let keyfile = Self {
            version: KEYFILE_VERSION,
            salt: STANDARD.encode(salt),
            kdf: params.clone(),
            verifier: seal(VERIFIER_PLAINTEXT, &key)?,
            created_at: Utc::now(),
            history: Vec::new(),
        };
        Ok((keyfile, key))
    }

    /// Derive the key for `secret` and check it against the verifier.
    ///
    /// A wrong secret fails with `Decryption`.
    pub fn unlock(&self, secret: &SecretString) -> VaultResult<MasterKey> {
        let salt = decode_salt(&self.salt)?;
        let key = derive_master_key(secret, &salt, &self.kdf)?;
        self.verify(&key)?;
        Ok(key)
    }

    pub fn verify(&self, key: &MasterKey) -> VaultResult<()> {
        let plaintext = open(&self.verifier, key)?;
        if plaintext != VERIFIER_PLAINTEXT {
            return Err(VaultError::Decryption("key verifier mismatch".into()));
        }
        Ok(())
    }

    /// Key file for a new secret under a fresh salt. The current salt moves
    /// to `history` so files sealed under the old secret stay recoverable.
    pub fn rotate(
        &self,
        new_secret: &SecretString,
        params: &KdfParams,
    ) -> VaultResult<(Self, MasterKey)> {
        let (mut next, key) = Self::create(new_secret, params)?;
        next.created_at = self.created_at;
        next.history = self.history.clone();
        next.history.push(RetiredKey {
            salt: self.salt.clone(),
            kdf: self.kdf.clone(),
            retired_at: Utc::now(),
        });
        Ok((next, key))
    }

    /// Keys `secret` would have produced under the current salt and every
    /// retired salt, newest first. Used to open files sealed before a
    /// password change.
    pub fn candidate_keys(&self, secret: &SecretString) -> VaultResult<Vec<MasterKey>> {
        let mut keys = Vec::with_capacity(self.history.len() + 1);
        keys.push(derive_master_key(secret, &decode_salt(&self.salt)?, &self.kdf)?);
        for retired in self.history.iter().rev() {
            keys.push(derive_master_key(
                secret,
                &decode_salt(&retired.salt)?,
                &retired.kdf,
            )?);
        }
        Ok(keys)
    }

    pub fn to_bytes(&self) -> VaultResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> VaultResult<Self> {
        let keyfile: KeyFile = serde_json::from_slice(data)
            .map_err(|e| VaultError::Format(format!("key file: {e}")))?;
        if keyfile.version != KEYFILE_VERSION {
            return Err(VaultError::Format(format!(
                "unsupported key file version {}",
                keyfile.version
            )));
        }
        Ok(keyfile)
    }
}

fn decode_salt(salt: &str) -> VaultResult<Vec<u8>> {
    STANDARD
        .decode(salt)
        .map_err(|e| VaultError::Format(format!("key file salt is not base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::seal;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn test_create_then_unlock() {
        let (keyfile, key) = KeyFile::create(&secret("correct horse"), &KdfParams::insecure_fast()).unwrap();
        let unlocked = keyfile.unlock(&secret("correct horse")).unwrap();
        assert_eq!(key.as_bytes(), unlocked.as_bytes());
    }

    #[test]
    fn test_wrong_secret_is_decryption_error() {
        let (keyfile, _) = KeyFile::create(&secret("correct horse"), &KdfParams::insecure_fast()).unwrap();
        let result = keyfile.unlock(&secret("battery staple"));
        assert!(matches!(result, Err(VaultError::Decryption(_))));
    }

    #[test]
    fn test_empty_secret_is_key_derivation_error() {
        let result = KeyFile::create(&secret(""), &KdfParams::insecure_fast());
        assert!(matches!(result, Err(VaultError::KeyDerivation(_))));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let (keyfile, key) = KeyFile::create(&secret("pw-roundtrip"), &KdfParams::insecure_fast()).unwrap();
        let parsed = KeyFile::from_bytes(&keyfile.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.salt, keyfile.salt);
        parsed.verify(&key).unwrap();
    }

    #[test]
    fn test_rejects_unknown_version() {
        let (mut keyfile, _) = KeyFile::create(&secret("pw"), &KdfParams::insecure_fast()).unwrap();
        keyfile.version = 99;
        let bytes = serde_json::to_vec(&keyfile).unwrap();
        assert!(matches!(KeyFile::from_bytes(&bytes), Err(VaultError::Format(_))));
    }

    #[test]
    fn test_rotate_keeps_history_for_old_secret() {
        let params = KdfParams::insecure_fast();
        let (original, old_key) = KeyFile::create(&secret("old-secret"), &params).unwrap();
        let sealed_before = seal(b"scan.pdf bytes", &old_key).unwrap();

        let (rotated, new_key) = original.rotate(&secret("new-secret"), &params).unwrap();
        assert_eq!(rotated.history.len(), 1);
        assert_ne!(rotated.salt, original.salt);
        assert!(rotated.unlock(&secret("old-secret")).is_err());
        assert_eq!(
            rotated.unlock(&secret("new-secret")).unwrap().as_bytes(),
            new_key.as_bytes()
        );

        let candidates = rotated.candidate_keys(&secret("old-secret")).unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().any(|k| open(&sealed_before, k).is_ok()));
    }
}

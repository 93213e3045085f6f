//! Key derivation: Argon2id secret → master key

use argon2::{Algorithm, Argon2, Params, Version};
use lockbox_core::config::CryptoConfig;
use lockbox_core::{VaultError, VaultResult};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit master key derived from the user's secret via Argon2id.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters, persisted in the key file next to the salt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Minimal cost. Only for tests and throwaway vaults.
    pub fn insecure_fast() -> Self {
        Self {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(cfg: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

/// Generate a random salt for a new key file.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit master key from a secret and salt using Argon2id.
///
/// Deterministic: the same secret, salt and params always yield the same key.
/// The salt is not secret; it lives in the key file.
pub fn derive_master_key(
    secret: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> VaultResult<MasterKey> {
    if secret.expose_secret().trim().is_empty() {
        return Err(VaultError::KeyDerivation("secret cannot be empty".into()));
    }
    if salt.len() < SALT_SIZE {
        return Err(VaultError::KeyDerivation(format!(
            "salt must be at least {SALT_SIZE} bytes (got {})",
            salt.len()
        )));
    }

    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| VaultError::KeyDerivation(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(secret.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| VaultError::KeyDerivation(format!("Argon2id KDF failed: {e}")))?;

    Ok(MasterKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_deterministic() {
        let secret = SecretString::from("test-passphrase-123");
        let salt = [1u8; SALT_SIZE];
        let params = KdfParams::insecure_fast();

        let key1 = derive_master_key(&secret, &salt, &params).unwrap();
        let key2 = derive_master_key(&secret, &salt, &params).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_secrets() {
        let salt = [1u8; SALT_SIZE];
        let params = KdfParams::insecure_fast();

        let key1 = derive_master_key(&SecretString::from("secret-a"), &salt, &params).unwrap();
        let key2 = derive_master_key(&SecretString::from("secret-b"), &salt, &params).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_different_salts() {
        let secret = SecretString::from("same-secret");
        let params = KdfParams::insecure_fast();

        let key1 = derive_master_key(&secret, &[1u8; SALT_SIZE], &params).unwrap();
        let key2 = derive_master_key(&secret, &[2u8; SALT_SIZE], &params).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let params = KdfParams::insecure_fast();
        for secret in ["", "   ", "\n\t"] {
            let result = derive_master_key(&SecretString::from(secret), &[0u8; SALT_SIZE], &params);
            assert!(matches!(result, Err(VaultError::KeyDerivation(_))));
        }
    }

    #[test]
    fn test_short_salt_rejected() {
        let result = derive_master_key(
            &SecretString::from("secret"),
            b"short",
            &KdfParams::insecure_fast(),
        );
        assert!(matches!(result, Err(VaultError::KeyDerivation(_))));
    }

    #[test]
    fn test_generated_salts_differ() {
        assert_ne!(generate_salt(), generate_salt());
    }

    #[test]
    fn test_debug_redacts() {
        let key = MasterKey::from_bytes([0xAB; KEY_SIZE]);
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("171"));
    }
}

//! XChaCha20-Poly1305 sealing of opaque byte blobs
//!
//! Text encoding (one line, safe to store next to ordinary files):
//! ```text
//! xc1:<base64( [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag] )>
//! ```
//!
//! Every failure to open a blob (bad prefix, bad base64, truncation, wrong
//! key, flipped bit) is reported as `VaultError::Decryption`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use lockbox_core::{VaultError, VaultResult};
use rand::RngCore;

use crate::kdf::MasterKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Version prefix of the text encoding
pub const BLOB_PREFIX: &str = "xc1:";

/// Nonce plus authenticated ciphertext (the tag is the last 16 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// `[nonce][ciphertext + tag]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(VaultError::Decryption(format!(
                "blob too short: {} bytes (minimum {})",
                bytes.len(),
                NONCE_SIZE + TAG_SIZE
            )));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        Ok(Self {
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }

    pub fn encode(&self) -> String {
        format!("{BLOB_PREFIX}{}", STANDARD.encode(self.to_bytes()))
    }

    pub fn decode(text: &str) -> VaultResult<Self> {
        let body = text
            .trim()
            .strip_prefix(BLOB_PREFIX)
            .ok_or_else(|| VaultError::Decryption("blob is missing the xc1: prefix".into()))?;
        let bytes = STANDARD
            .decode(body)
            .map_err(|e| VaultError::Decryption(format!("blob is not valid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

/// Encrypt with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &MasterKey) -> VaultResult<EncryptedBlob> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| VaultError::Other(anyhow::anyhow!("encryption failed: {e}")))?;

    Ok(EncryptedBlob { nonce, ciphertext })
}

/// Decrypt and authenticate. Returns the exact plaintext or `Decryption`.
pub fn decrypt(blob: &EncryptedBlob, key: &MasterKey) -> VaultResult<Vec<u8>> {
    if blob.ciphertext.len() < TAG_SIZE {
        return Err(VaultError::Decryption(format!(
            "ciphertext too short: {} bytes",
            blob.ciphertext.len()
        )));
    }
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(XNonce::from_slice(&blob.nonce), blob.ciphertext.as_slice())
        .map_err(|_| {
            VaultError::Decryption("wrong key, or corrupted or tampered ciphertext".into())
        })
}

/// Encrypt and text-encode in one step.
pub fn seal(plaintext: &[u8], key: &MasterKey) -> VaultResult<String> {
    Ok(encrypt(plaintext, key)?.encode())
}

/// Decode and decrypt in one step.
pub fn open(text: &str, key: &MasterKey) -> VaultResult<Vec<u8>> {
    decrypt(&EncryptedBlob::decode(text)?, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_SIZE;
    use proptest::prelude::*;

    fn key(byte: u8) -> MasterKey {
        MasterKey::from_bytes([byte; KEY_SIZE])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let k = key(42);
        let blob = encrypt(b"hello, sealed world!", &k).unwrap();
        assert_eq!(decrypt(&blob, &k).unwrap(), b"hello, sealed world!");
    }

    #[test]
    fn test_encrypt_decrypt_empty() {
        let k = key(1);
        let text = seal(b"", &k).unwrap();
        assert_eq!(open(&text, &k).unwrap(), b"");
    }

    #[test]
    fn test_nonce_fresh_per_call() {
        let k = key(7);
        let a = encrypt(b"same", &k).unwrap();
        let b = encrypt(b"same", &k).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_encrypted_size() {
        let blob = encrypt(&[0u8; 1000], &key(3)).unwrap();
        assert_eq!(blob.to_bytes().len(), NONCE_SIZE + 1000 + TAG_SIZE);
    }

    #[test]
    fn test_tampered_ciphertext() {
        let k = key(9);
        let mut blob = encrypt(b"secret data", &k).unwrap();
        blob.ciphertext[0] ^= 0xFF;
        assert!(matches!(decrypt(&blob, &k), Err(VaultError::Decryption(_))));
    }

    #[test]
    fn test_truncated_text_is_decryption_error() {
        let k = key(5);
        let text = seal(b"{\"id\":\"1\"}", &k).unwrap();
        let truncated = &text[..text.len() / 2];
        assert!(matches!(open(truncated, &k), Err(VaultError::Decryption(_))));
        assert!(matches!(open("xc1:", &k), Err(VaultError::Decryption(_))));
    }

    #[test]
    fn test_garbage_text_is_decryption_error() {
        let k = key(5);
        assert!(matches!(open("not a blob", &k), Err(VaultError::Decryption(_))));
        assert!(matches!(open("xc1:!!!", &k), Err(VaultError::Decryption(_))));
    }

    #[test]
    fn test_decode_tolerates_trailing_newline() {
        let k = key(8);
        let text = format!("{}\n", seal(b"line", &k).unwrap());
        assert_eq!(open(&text, &k).unwrap(), b"line");
    }

    proptest! {
        #[test]
        fn prop_roundtrip(plaintext in proptest::collection::vec(any::<u8>(), 0..2048), k in any::<u8>()) {
            let master = key(k);
            let text = seal(&plaintext, &master).unwrap();
            prop_assert_eq!(open(&text, &master).unwrap(), plaintext);
        }

        #[test]
        fn prop_wrong_key_rejected(
            plaintext in proptest::collection::vec(any::<u8>(), 0..512),
            k1 in any::<u8>(),
            k2 in any::<u8>(),
        ) {
            prop_assume!(k1 != k2);
            let text = seal(&plaintext, &key(k1)).unwrap();
            let result = open(&text, &key(k2));
            prop_assert!(matches!(result, Err(VaultError::Decryption(_))));
        }
    }
}

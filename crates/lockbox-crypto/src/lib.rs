//! lockbox-crypto: everything that touches key material.
//!
//! ```text
//! secret + salt ──Argon2id──▶ MasterKey (held by VaultSession while unlocked)
//!                                 │
//!                                 ├── seal/open records   (XChaCha20-Poly1305, random nonce)
//!                                 ├── seal/open documents (same cipher)
//!                                 └── key file verifier   (wrong password → Decryption)
//! ```
//!
//! No other crate holds raw key bytes; they go through `VaultSession`.

pub mod cipher;
pub mod kdf;
pub mod keyfile;
pub mod session;

pub use cipher::{decrypt, encrypt, open, seal, EncryptedBlob};
pub use kdf::{derive_master_key, generate_salt, KdfParams, MasterKey};
pub use keyfile::{KeyFile, RetiredKey};
pub use session::VaultSession;

/// Size of a master key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a freshly generated KDF salt
pub const SALT_SIZE: usize = 16;

//! Vault facade: the directory layout, the key file, and password changes.
//!
//! ```text
//! <root>/
//!   keyfile.json     salt, KDF params, verifier, retired salts
//!   keyfile.next.json  only while a password change is in flight
//!   data/            record store
//!   documents/       document blob store
//! ```

use std::path::{Path, PathBuf};

use lockbox_core::{RecordLayout, VaultError, VaultResult};
use lockbox_crypto::{KdfParams, KeyFile, MasterKey, VaultSession};
use secrecy::SecretString;
use tracing::{error, info, warn};

use crate::documents::DocumentStore;
use crate::fs::{is_file, read_optional, remove_file_if_exists, write_atomic};
use crate::records::RecordStore;
use crate::RekeyReport;

pub const KEYFILE_NAME: &str = "keyfile.json";
pub const PENDING_KEYFILE_NAME: &str = "keyfile.next.json";
pub const DATA_DIR: &str = "data";
pub const DOCUMENTS_DIR: &str = "documents";

/// Outcome of a password change
#[derive(Debug, Default)]
pub struct PasswordChange {
    pub records: RekeyReport,
    pub documents: RekeyReport,
}

#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
    keyfile: KeyFile,
    /// Key file of a password change that neither finished nor rolled back
    pending: Option<KeyFile>,
    records: RecordStore,
    documents: DocumentStore,
}

impl Vault {
    pub fn keyfile_path(root: &Path) -> PathBuf {
        root.join(KEYFILE_NAME)
    }

    pub fn pending_keyfile_path(root: &Path) -> PathBuf {
        root.join(PENDING_KEYFILE_NAME)
    }

    /// Create a new vault at `root` and return it unlocked.
    ///
    /// Fails if `root` already holds a key file.
    pub async fn init(
        root: &Path,
        secret: &SecretString,
        params: &KdfParams,
        default_layout: RecordLayout,
    ) -> VaultResult<(Self, VaultSession)> {
        let keyfile_path = Self::keyfile_path(root);
        if is_file(&keyfile_path).await {
            return Err(VaultError::InvalidInput(format!(
                "a vault already exists at {}",
                root.display()
            )));
        }

        let (keyfile, key) = KeyFile::create(secret, params)?;
        tokio::fs::create_dir_all(root.join(DATA_DIR)).await?;
        tokio::fs::create_dir_all(root.join(DOCUMENTS_DIR)).await?;
        write_atomic(&keyfile_path, &keyfile.to_bytes()?).await?;
        info!(root = %root.display(), "vault initialised");

        Ok((
            Self::assemble(root, keyfile, None, default_layout),
            VaultSession::new(key),
        ))
    }

    /// Open an existing vault. Nothing is decrypted until [`Vault::unlock`].
    ///
    /// Repairs per-record directories left mid-swap by a crash.
    pub async fn open(root: &Path, default_layout: RecordLayout) -> VaultResult<Self> {
        let keyfile_path = Self::keyfile_path(root);
        let bytes = read_optional(&keyfile_path).await?.ok_or_else(|| {
            VaultError::InvalidInput(format!(
                "no vault at {} (missing {KEYFILE_NAME})",
                root.display()
            ))
        })?;
        let keyfile = KeyFile::from_bytes(&bytes)?;

        let pending = match read_optional(&Self::pending_keyfile_path(root)).await? {
            Some(bytes) => {
                warn!(
                    root = %root.display(),
                    "an earlier password change did not finish; recover with the other password"
                );
                Some(KeyFile::from_bytes(&bytes)?)
            }
            None => None,
        };

        let vault = Self::assemble(root, keyfile, pending, default_layout);
        let repaired = vault.records.recover_interrupted_swaps().await?;
        if !repaired.is_empty() {
            info!(categories = ?repaired, "interrupted record directory swaps repaired");
        }
        Ok(vault)
    }

    fn assemble(
        root: &Path,
        keyfile: KeyFile,
        pending: Option<KeyFile>,
        default_layout: RecordLayout,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            keyfile,
            pending,
            records: RecordStore::new(root.join(DATA_DIR), default_layout),
            documents: DocumentStore::new(root.join(DOCUMENTS_DIR)),
        }
    }

    /// Derive the key for `secret`. A wrong password is `Decryption`.
    pub fn unlock(&self, secret: &SecretString) -> VaultResult<VaultSession> {
        let key = self.keyfile.unlock(secret)?;
        info!("vault unlocked");
        Ok(VaultSession::new(key))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keyfile(&self) -> &KeyFile {
        &self.keyfile
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    /// True while a failed password change left its key file behind.
    pub fn has_pending_change(&self) -> bool {
        self.pending.is_some()
    }

    /// Keys `secret` yields under every salt this vault has used, including
    /// one from an unfinished password change.
    pub fn candidate_keys(&self, secret: &SecretString) -> VaultResult<Vec<MasterKey>> {
        let mut keys = self.keyfile.candidate_keys(secret)?;
        if let Some(pending) = &self.pending {
            match pending.unlock(secret) {
                Ok(key) => keys.insert(0, key),
                Err(e) if e.is_decryption() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(keys)
    }

    /// Switch to `new_secret` under a fresh salt and re-seal everything.
    ///
    /// The rotated key file is staged as `keyfile.next.json`, everything is
    /// re-sealed, then the staged file replaces `keyfile.json`. If re-sealing
    /// fails, whatever was re-sealed is moved back under the current key and
    /// the staged file removed, so the current password keeps working. If
    /// that also fails the staged file stays, and
    /// [`Vault::recover_with_password`] with the other password finishes
    /// the job. Returns the session for the new key.
    pub async fn change_password(
        &mut self,
        session: &VaultSession,
        new_secret: &SecretString,
        params: &KdfParams,
    ) -> VaultResult<(VaultSession, PasswordChange)> {
        self.keyfile.verify(session.key()?)?;
        let pending_path = Self::pending_keyfile_path(&self.root);
        if self.pending.is_some() || is_file(&pending_path).await {
            return Err(VaultError::InvalidInput(
                "an earlier password change did not finish; recover with its password first".into(),
            ));
        }

        let (keyfile, key) = self.keyfile.rotate(new_secret, params)?;
        write_atomic(&pending_path, &keyfile.to_bytes()?).await?;
        let next = VaultSession::new(key);

        let change = match self.reseal(session, &next).await {
            Ok(change) => change,
            Err(e) => {
                warn!("password change failed, moving re-sealed items back: {e}");
                match self.reseal(&next, session).await {
                    Ok(_) => {
                        if let Err(cleanup) = remove_file_if_exists(&pending_path).await {
                            warn!("could not remove {}: {cleanup}", pending_path.display());
                            self.pending = Some(keyfile);
                        }
                    }
                    Err(rollback) => {
                        error!(
                            "rollback failed, keeping {} for recovery: {rollback}",
                            pending_path.display()
                        );
                        self.pending = Some(keyfile);
                    }
                }
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&pending_path, Self::keyfile_path(&self.root)).await {
            error!("re-sealed under the new key but could not install its key file: {e}");
            self.pending = Some(keyfile);
            return Err(e.into());
        }
        self.keyfile = keyfile;
        info!(
            records = change.records.resealed,
            documents = change.documents.resealed,
            skipped = change.records.skipped.len() + change.documents.skipped.len(),
            "password changed"
        );
        Ok((next, change))
    }

    async fn reseal(&self, from: &VaultSession, to: &VaultSession) -> VaultResult<PasswordChange> {
        Ok(PasswordChange {
            records: self.records.rekey(from, to).await?,
            documents: self.documents.rekey(from, to).await?,
        })
    }

    /// Re-seal under `session` every record and document that `secret`
    /// opens under any salt the vault has used. Clears an unfinished
    /// password change once nothing is left behind.
    pub async fn recover_with_password(
        &mut self,
        session: &VaultSession,
        secret: &SecretString,
    ) -> VaultResult<PasswordChange> {
        self.keyfile.verify(session.key()?)?;
        let keys = self.candidate_keys(secret)?;
        let change = PasswordChange {
            records: self.records.recover_with_keys(session, &keys).await?,
            documents: self.documents.recover_with_keys(session, &keys).await?,
        };
        if change.records.skipped.is_empty() && change.documents.skipped.is_empty() {
            if remove_file_if_exists(&Self::pending_keyfile_path(&self.root)).await? {
                info!("unfinished password change cleared");
            }
            self.pending = None;
        }
        info!(
            records = change.records.resealed,
            documents = change.documents.resealed,
            "recovered items sealed under an earlier key"
        );
        Ok(change)
    }
}

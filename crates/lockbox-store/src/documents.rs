//! Document blob store: one encrypted file per attachment.
//!
//! Files live at `<root>/<category>/<uuid>.enc` and hold `nonce || ciphertext`.
//! Records point at them through a [`DocumentReference`]; this store never
//! reads or writes records, so keeping references in sync is the caller's job.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use lockbox_core::{validate_category, DocumentReference, FileEntry, VaultError, VaultResult};
use lockbox_crypto::{decrypt, encrypt, EncryptedBlob, MasterKey, VaultSession};
use tracing::{debug, info, warn};

use crate::fs::{join_relative, read_optional, remove_file_if_exists, walk_files, write_atomic};
use crate::RekeyReport;

pub const DOCUMENT_EXT: &str = "enc";
const FALLBACK_MIME: &str = "application/octet-stream";

/// A physical document file and the category directory it sits in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFile {
    pub category: String,
    /// `path` is relative to the documents root: `<category>/<file>`
    pub file: FileEntry,
}

#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Encrypt an attachment and write it under `category`.
    ///
    /// `payload` is either a `data:<mime>;base64,<data>` URL or bare base64.
    /// The returned reference must be embedded in a record by the caller.
    pub async fn save_document(
        &self,
        session: &VaultSession,
        category: &str,
        filename: &str,
        payload: &str,
        uploaded_at: DateTime<Utc>,
    ) -> VaultResult<DocumentReference> {
        validate_category(category)?;
        let (mime_type, bytes) = decode_payload(filename, payload)?;
        let blob = encrypt(&bytes, session.key()?)?;

        let id = uuid::Uuid::new_v4().to_string();
        let path = format!("{category}/{id}.{DOCUMENT_EXT}");
        write_atomic(&self.root.join(category).join(format!("{id}.{DOCUMENT_EXT}")), &blob.to_bytes())
            .await?;
        debug!(category, %path, size = bytes.len(), "document saved");

        Ok(DocumentReference {
            id,
            path,
            filename: filename.to_string(),
            mime_type,
            uploaded_at,
        })
    }

    /// Decrypt an attachment and return it as a `data:` URL.
    pub async fn load_document(
        &self,
        session: &VaultSession,
        category: &str,
        reference: &DocumentReference,
    ) -> VaultResult<String> {
        let bytes = self.load_document_bytes(session, category, reference).await?;
        Ok(format!(
            "data:{};base64,{}",
            reference.mime_type,
            STANDARD.encode(bytes)
        ))
    }

    pub async fn load_document_bytes(
        &self,
        session: &VaultSession,
        category: &str,
        reference: &DocumentReference,
    ) -> VaultResult<Vec<u8>> {
        self.resolve(category, &reference.path)?;
        self.open_file(session, &reference.path).await
    }

    /// Remove an attachment. Returns `false` if it was already gone.
    pub async fn delete_document(
        &self,
        category: &str,
        reference: &DocumentReference,
    ) -> VaultResult<bool> {
        let path = self.resolve(category, &reference.path)?;
        let removed = remove_file_if_exists(&path).await?;
        if removed {
            debug!(category, path = %reference.path, "document deleted");
        }
        Ok(removed)
    }

    /// Remove several attachments. Returns how many files existed.
    pub async fn delete_documents(
        &self,
        category: &str,
        references: &[DocumentReference],
    ) -> VaultResult<usize> {
        let mut removed = 0;
        for reference in references {
            if self.delete_document(category, reference).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove a file by its path relative to the documents root.
    pub async fn delete_file(&self, path: &str) -> VaultResult<bool> {
        let category = category_of(path)?;
        remove_file_if_exists(&self.resolve(category, path)?).await
    }

    /// Every document file on disk, sorted by path.
    pub async fn list_files(&self) -> VaultResult<Vec<DocumentFile>> {
        let files = walk_files(&self.root).await?;
        Ok(files
            .into_iter()
            .filter_map(|file| {
                let (category, name) = file.path.split_once('/')?;
                if name.contains('/') || validate_category(category).is_err() {
                    return None;
                }
                Some(DocumentFile {
                    category: category.to_string(),
                    file,
                })
            })
            .collect())
    }

    /// Decrypt a file by relative path under the session key.
    pub async fn open_file(&self, session: &VaultSession, path: &str) -> VaultResult<Vec<u8>> {
        self.open_file_with_key(path, session.key()?).await
    }

    /// Decrypt a file by relative path under an explicit key, such as one
    /// derived from a historical password.
    pub async fn open_file_with_key(&self, path: &str, key: &MasterKey) -> VaultResult<Vec<u8>> {
        let category = category_of(path)?;
        let full = self.resolve(category, path)?;
        let bytes = read_optional(&full)
            .await?
            .ok_or_else(|| VaultError::DocumentNotFound {
                path: path.to_string(),
            })?;
        decrypt(&EncryptedBlob::from_bytes(&bytes)?, key)
    }

    /// Re-encrypt every document under `new`. Files `old` cannot open are
    /// left as they are and reported.
    pub async fn rekey(&self, old: &VaultSession, new: &VaultSession) -> VaultResult<RekeyReport> {
        let new_key = new.key()?;
        let mut report = RekeyReport::default();
        for doc in self.list_files().await? {
            let plaintext = match self.open_file(old, &doc.file.path).await {
                Ok(plaintext) => plaintext,
                Err(e) if e.is_decryption() => {
                    warn!(path = %doc.file.path, "leaving document sealed under another key: {e}");
                    report.skipped.push(doc.file.path);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let blob = encrypt(&plaintext, new_key)?;
            write_atomic(&self.resolve(&doc.category, &doc.file.path)?, &blob.to_bytes()).await?;
            report.resealed += 1;
        }
        Ok(report)
    }

    /// Re-encrypt under `session` every document it cannot open but one of
    /// `keys` can. Files no key opens are left as they are and reported.
    pub async fn recover_with_keys(
        &self,
        session: &VaultSession,
        keys: &[MasterKey],
    ) -> VaultResult<RekeyReport> {
        let current = session.key()?;
        let mut report = RekeyReport::default();
        for doc in self.list_files().await? {
            match self.open_file(session, &doc.file.path).await {
                Ok(_) => continue,
                Err(e) if e.is_decryption() => {}
                Err(e) => return Err(e),
            }
            let mut recovered = None;
            for key in keys {
                match self.open_file_with_key(&doc.file.path, key).await {
                    Ok(plaintext) => {
                        recovered = Some(plaintext);
                        break;
                    }
                    Err(e) if e.is_decryption() => continue,
                    Err(e) => return Err(e),
                }
            }
            let Some(plaintext) = recovered else {
                report.skipped.push(doc.file.path);
                continue;
            };
            let blob = encrypt(&plaintext, current)?;
            write_atomic(&self.resolve(&doc.category, &doc.file.path)?, &blob.to_bytes()).await?;
            info!(path = %doc.file.path, "document recovered from an earlier key");
            report.resealed += 1;
        }
        Ok(report)
    }

    /// Absolute path of `rel`, which must sit directly inside `category`.
    fn resolve(&self, category: &str, rel: &str) -> VaultResult<PathBuf> {
        validate_category(category)?;
        let escapes = || VaultError::InvalidInput(format!("document path {rel:?} is outside {category:?}"));
        let (dir, name) = rel.split_once('/').ok_or_else(escapes)?;
        if dir != category || name.contains('/') {
            return Err(escapes());
        }
        join_relative(&self.root, rel).ok_or_else(escapes)
    }
}

fn category_of(path: &str) -> VaultResult<&str> {
    path.split_once('/')
        .map(|(category, _)| category)
        .ok_or_else(|| VaultError::InvalidInput(format!("document path {path:?} has no category")))
}

/// Split a data URL or bare base64 payload into MIME type and bytes.
fn decode_payload(filename: &str, payload: &str) -> VaultResult<(String, Vec<u8>)> {
    let (mime, data) = match payload.strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest
                .split_once(',')
                .ok_or_else(|| VaultError::InvalidInput("data URL has no payload".into()))?;
            let mime = header.strip_suffix(";base64").ok_or_else(|| {
                VaultError::InvalidInput("only base64 data URLs are supported".into())
            })?;
            let mime = if mime.is_empty() {
                mime_from_filename(filename)
            } else {
                mime.to_string()
            };
            (mime, data)
        }
        None => (mime_from_filename(filename), payload),
    };

    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| VaultError::InvalidInput(format!("document payload is not base64: {e}")))?;
    Ok((mime, bytes))
}

fn mime_from_filename(filename: &str) -> String {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => FALLBACK_MIME,
    }
    .to_string()
}

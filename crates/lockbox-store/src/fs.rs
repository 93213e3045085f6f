//! Filesystem helpers shared by the record and document stores.
//!
//! Every write that replaces existing state goes through [`write_atomic`]:
//! write a sibling temp file, fsync it, then rename it over the target.
//! A crash leaves either the complete old file or the complete new one.

use std::path::{Path, PathBuf};

use lockbox_core::{FileEntry, VaultResult};
use tokio::io::AsyncWriteExt;

/// Sibling temp path used while `path` is being replaced.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new("."));
    parent.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ))
}

/// Atomically replace `path` with `bytes`, creating parent directories.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> VaultResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = temp_path_for(path);

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    sync_dir(path.parent()).await;
    Ok(())
}

/// Best-effort fsync of a directory so a completed rename survives a crash.
#[cfg(unix)]
async fn sync_dir(dir: Option<&Path>) {
    if let Some(dir) = dir {
        if let Ok(handle) = tokio::fs::File::open(dir).await {
            let _ = handle.sync_all().await;
        }
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: Option<&Path>) {}

/// Read a file, mapping "not found" to `None`.
pub async fn read_optional(path: &Path) -> VaultResult<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove a file. Returns `false` if it was already gone.
pub async fn remove_file_if_exists(path: &Path) -> VaultResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove a directory tree. Returns `false` if it was already gone.
pub async fn remove_dir_if_exists(path: &Path) -> VaultResult<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

pub async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Names of the visible entries of `dir`, sorted. A missing directory is empty.
///
/// Dot-prefixed names (temp files, staging directories) are skipped.
pub async fn list_names(dir: &Path) -> VaultResult<Vec<String>> {
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Every visible regular file below `root`, as `/`-separated relative paths
/// with sizes, sorted by path.
pub async fn walk_files(root: &Path) -> VaultResult<Vec<FileEntry>> {
    let mut files = Vec::new();
    let mut pending = vec![(root.to_path_buf(), String::new())];
    while let Some((dir, prefix)) = pending.pop() {
        for name in list_names(&dir).await? {
            let path = dir.join(&name);
            let rel = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            let meta = tokio::fs::metadata(&path).await?;
            if meta.is_dir() {
                pending.push((path, rel));
            } else if meta.is_file() {
                files.push(FileEntry::new(rel, meta.len()));
            }
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Join a `/`-separated relative path onto `root`, rejecting anything that
/// could leave it.
pub fn join_relative(root: &Path, rel: &str) -> Option<PathBuf> {
    if rel.is_empty() || rel.starts_with('/') || rel.contains('\\') {
        return None;
    }
    let mut path = root.to_path_buf();
    for part in rel.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return None;
        }
        path.push(part);
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces_and_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/contacts.vault");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");
        assert!(!temp_path_for(&path).exists());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.enc");
        tokio::fs::write(&path, b"x").await.unwrap();

        assert!(remove_file_if_exists(&path).await.unwrap());
        assert!(!remove_file_if_exists(&path).await.unwrap());
        assert!(!remove_dir_if_exists(&dir.path().join("nope")).await.unwrap());
    }

    #[tokio::test]
    async fn test_walk_files_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("pets")).await.unwrap();
        tokio::fs::write(dir.path().join("contacts.vault"), b"12345").await.unwrap();
        tokio::fs::write(dir.path().join("pets/a.rec"), b"ab").await.unwrap();
        tokio::fs::write(dir.path().join(".contacts.vault.tmp"), b"junk").await.unwrap();

        let files = walk_files(dir.path()).await.unwrap();
        assert_eq!(
            files,
            vec![FileEntry::new("contacts.vault", 5), FileEntry::new("pets/a.rec", 2)]
        );
    }

    #[test]
    fn test_join_relative_rejects_escapes() {
        let root = Path::new("/vault/documents");
        assert_eq!(
            join_relative(root, "pets/a.enc"),
            Some(PathBuf::from("/vault/documents/pets/a.enc"))
        );
        assert!(join_relative(root, "../keyfile.json").is_none());
        assert!(join_relative(root, "/etc/passwd").is_none());
        assert!(join_relative(root, "pets//a.enc").is_none());
        assert!(join_relative(root, "").is_none());
    }
}

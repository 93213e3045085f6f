//! Record store: per-category lists of opaque records, sealed one by one.
//!
//! Reads are forgiving: a record that fails to decrypt or parse is logged and
//! skipped, never fatal for its category. Writes are all-or-nothing per
//! category and keep every entry the session cannot read byte-for-byte.

use std::path::{Path, PathBuf};

use lockbox_core::{validate_category, FileEntry, Record, RecordLayout, VaultError, VaultResult};
use lockbox_crypto::{MasterKey, VaultSession};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::fs::{list_names, walk_files};
use crate::layout::{self, SealedEntry, CONTAINER_EXT};
use crate::RekeyReport;

/// One loaded entry: the ciphertext as stored, plus the record when the
/// session could open it.
#[derive(Debug)]
struct Entry {
    name: String,
    sealed: String,
    record: Option<Record<Value>>,
}

#[derive(Debug)]
struct Loaded {
    layout: RecordLayout,
    entries: Vec<Entry>,
}

impl Loaded {
    fn position(&self, id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.record.as_ref().is_some_and(|r| r.id == id))
    }
}

/// Result of reading one category
#[derive(Debug, Default)]
pub struct CategoryScan {
    pub records: Vec<Record<Value>>,
    /// Entries skipped because they did not decrypt or parse
    pub unreadable: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
    default_layout: RecordLayout,
}

impl RecordStore {
    /// `root` is the data directory; `default_layout` applies to categories
    /// that have never been written.
    pub fn new(root: impl Into<PathBuf>, default_layout: RecordLayout) -> Self {
        Self {
            root: root.into(),
            default_layout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every category present on disk, sorted.
    pub async fn categories(&self) -> VaultResult<Vec<String>> {
        let suffix = format!(".{CONTAINER_EXT}");
        let mut found = Vec::new();
        for name in list_names(&self.root).await? {
            let candidate = match name.strip_suffix(&suffix) {
                Some(stem) => stem.to_string(),
                None => name,
            };
            if validate_category(&candidate).is_err() || found.contains(&candidate) {
                continue;
            }
            if layout::detect(&self.root, &candidate).await?.is_some() {
                found.push(candidate);
            }
        }
        found.sort();
        Ok(found)
    }

    pub async fn layout_of(&self, category: &str) -> VaultResult<Option<RecordLayout>> {
        validate_category(category)?;
        layout::detect(&self.root, category).await
    }

    /// Every physical data file with its size, relative to the data root.
    pub async fn data_files(&self) -> VaultResult<Vec<FileEntry>> {
        let categories = self.categories().await?;
        let files = walk_files(&self.root).await?;
        Ok(files
            .into_iter()
            .filter(|f| {
                layout::category_of_data_path(&f.path)
                    .is_some_and(|c| categories.iter().any(|known| known == c))
            })
            .collect())
    }

    /// Put back every per-record directory left retired by an interrupted
    /// swap. Returns the categories repaired.
    pub async fn recover_interrupted_swaps(&self) -> VaultResult<Vec<String>> {
        let mut repaired = Vec::new();
        for category in layout::retired_categories(&self.root).await? {
            if layout::recover_interrupted_swap(&self.root, &category).await? {
                repaired.push(category);
            }
        }
        Ok(repaired)
    }

    async fn load(&self, session: &VaultSession, category: &str) -> VaultResult<Option<Loaded>> {
        self.load_with_key(session.key()?, category).await
    }

    /// `load` for a mutation: repairs an interrupted swap first.
    async fn load_for_write(
        &self,
        session: &VaultSession,
        category: &str,
    ) -> VaultResult<Option<Loaded>> {
        validate_category(category)?;
        layout::recover_interrupted_swap(&self.root, category).await?;
        self.load(session, category).await
    }

    async fn load_with_key(&self, key: &MasterKey, category: &str) -> VaultResult<Option<Loaded>> {
        validate_category(category)?;
        let Some(layout) = layout::detect(&self.root, category).await? else {
            return Ok(None);
        };

        let raw = layout::read_entries(&self.root, category, layout).await?;
        let mut entries = Vec::with_capacity(raw.len());
        for SealedEntry { name, sealed } in raw {
            let record = match open_record(key, &sealed) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(category, entry = %name, "skipping unreadable record: {e}");
                    None
                }
            };
            entries.push(Entry {
                name,
                sealed,
                record,
            });
        }
        Ok(Some(Loaded { layout, entries }))
    }

    /// All readable records of `category` plus the names of skipped entries.
    pub async fn scan(&self, session: &VaultSession, category: &str) -> VaultResult<CategoryScan> {
        let loaded = self.load(session, category).await?;
        Ok(scan_of(loaded))
    }

    /// `scan` under an explicit key, such as one derived from a password
    /// the vault used before. Only reads.
    pub async fn scan_with_key(&self, key: &MasterKey, category: &str) -> VaultResult<CategoryScan> {
        let loaded = self.load_with_key(key, category).await?;
        Ok(scan_of(loaded))
    }

    /// Records of `category` decoded as `F`.
    ///
    /// A category that was never written is empty. Entries that fail to
    /// decrypt, or whose fields do not decode as `F`, are skipped.
    pub async fn get<F: DeserializeOwned>(
        &self,
        session: &VaultSession,
        category: &str,
    ) -> VaultResult<Vec<Record<F>>> {
        let scan = self.scan(session, category).await?;
        let mut out = Vec::with_capacity(scan.records.len());
        for record in scan.records {
            match serde_json::from_value::<F>(record.fields) {
                Ok(fields) => out.push(Record {
                    id: record.id,
                    category: record.category,
                    fields,
                }),
                Err(e) => warn!(category, id = %record.id, "skipping record with unexpected fields: {e}"),
            }
        }
        Ok(out)
    }

    /// Append a record. Its id must be new within the category.
    pub async fn add<F: Serialize>(
        &self,
        session: &VaultSession,
        category: &str,
        record: &Record<F>,
    ) -> VaultResult<()> {
        check_category(category, &record.category)?;
        let sealed = seal_record(session, record)?;
        let loaded = self.load_for_write(session, category).await?;
        let layout = loaded.as_ref().map_or(self.default_layout, |l| l.layout);
        let file_name = layout::record_file_name(&record.id);

        if let Some(loaded) = &loaded {
            let name_taken =
                layout == RecordLayout::PerRecord && loaded.entries.iter().any(|e| e.name == file_name);
            if loaded.position(&record.id).is_some() || name_taken {
                return Err(VaultError::DuplicateId {
                    category: category.to_string(),
                    id: record.id.clone(),
                });
            }
        }

        match layout {
            RecordLayout::Container => {
                let mut all = sealed_list(loaded);
                all.push(sealed);
                layout::write_container(&self.root, category, all).await?;
            }
            RecordLayout::PerRecord => {
                layout::write_record_file(&self.root, category, &file_name, &sealed).await?;
            }
        }
        debug!(category, id = %record.id, "record added");
        Ok(())
    }

    /// Replace the record whose id is `id` with `record` (whole record, not a
    /// field patch).
    pub async fn update<F: Serialize>(
        &self,
        session: &VaultSession,
        category: &str,
        id: &str,
        record: &Record<F>,
    ) -> VaultResult<()> {
        check_category(category, &record.category)?;
        if record.id != id {
            return Err(VaultError::InvalidInput(format!(
                "record id {:?} does not match {id:?}",
                record.id
            )));
        }
        let sealed = seal_record(session, record)?;
        let not_found = || VaultError::NotFound {
            category: category.to_string(),
            id: id.to_string(),
        };
        let mut loaded = self.load_for_write(session, category).await?.ok_or_else(not_found)?;
        let index = loaded.position(id).ok_or_else(not_found)?;

        match loaded.layout {
            RecordLayout::Container => {
                loaded.entries[index].sealed = sealed;
                layout::write_container(&self.root, category, sealed_list(Some(loaded))).await?;
            }
            RecordLayout::PerRecord => {
                let name = &loaded.entries[index].name;
                layout::write_record_file(&self.root, category, name, &sealed).await?;
            }
        }
        debug!(category, id, "record updated");
        Ok(())
    }

    /// Remove the record whose id is `id`. Returns `false` if there was none;
    /// that is not an error.
    pub async fn delete(&self, session: &VaultSession, category: &str, id: &str) -> VaultResult<bool> {
        let Some(mut loaded) = self.load_for_write(session, category).await? else {
            return Ok(false);
        };
        let Some(index) = loaded.position(id) else {
            return Ok(false);
        };

        match loaded.layout {
            RecordLayout::Container => {
                loaded.entries.remove(index);
                layout::write_container(&self.root, category, sealed_list(Some(loaded))).await?;
            }
            RecordLayout::PerRecord => {
                let path = layout::record_dir(&self.root, category).join(&loaded.entries[index].name);
                crate::fs::remove_file_if_exists(&path).await?;
            }
        }
        debug!(category, id, "record deleted");
        Ok(true)
    }

    /// Replace every readable record of `category` with `records`.
    ///
    /// Entries the session cannot open are kept; [`RecordStore::purge_unreadable`]
    /// is the explicit way to drop them. Ids within `records` must be unique.
    pub async fn save<F: Serialize>(
        &self,
        session: &VaultSession,
        category: &str,
        records: &[Record<F>],
    ) -> VaultResult<()> {
        let mut fresh = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            check_category(category, &record.category)?;
            if records[..i].iter().any(|r| r.id == record.id) {
                return Err(VaultError::DuplicateId {
                    category: category.to_string(),
                    id: record.id.clone(),
                });
            }
            fresh.push(SealedEntry {
                name: layout::record_file_name(&record.id),
                sealed: seal_record(session, record)?,
            });
        }

        let loaded = self.load_for_write(session, category).await?;
        let layout = loaded.as_ref().map_or(self.default_layout, |l| l.layout);
        let kept = loaded
            .map(|l| l.entries)
            .unwrap_or_default()
            .into_iter()
            .filter(|e| e.record.is_none())
            .map(|e| SealedEntry {
                name: e.name,
                sealed: e.sealed,
            });
        let mut entries: Vec<SealedEntry> = kept.collect();
        if !entries.is_empty() {
            info!(category, kept = entries.len(), "save keeps unreadable entries");
        }
        entries.retain(|kept| !fresh.iter().any(|f| f.name == kept.name));
        entries.extend(fresh);

        self.write_all(category, layout, entries).await?;
        debug!(category, records = records.len(), "category saved");
        Ok(())
    }

    async fn write_all(
        &self,
        category: &str,
        layout: RecordLayout,
        entries: Vec<SealedEntry>,
    ) -> VaultResult<()> {
        match layout {
            RecordLayout::Container => {
                let sealed = entries.into_iter().map(|e| e.sealed).collect();
                layout::write_container(&self.root, category, sealed).await
            }
            RecordLayout::PerRecord => layout::replace_record_dir(&self.root, category, &entries).await,
        }
    }

    /// Move `category` to another physical layout. Ciphertext is carried over
    /// unchanged, including entries the session cannot open.
    pub async fn convert_layout(
        &self,
        session: &VaultSession,
        category: &str,
        target: RecordLayout,
    ) -> VaultResult<()> {
        let loaded = self.load_for_write(session, category).await?.ok_or_else(|| {
            VaultError::InvalidInput(format!("category {category:?} does not exist"))
        })?;
        if loaded.layout == target {
            return Ok(());
        }

        let entries: Vec<SealedEntry> = loaded
            .entries
            .into_iter()
            .enumerate()
            .map(|(i, e)| SealedEntry {
                name: match &e.record {
                    Some(record) => layout::record_file_name(&record.id),
                    None => format!("unreadable-{i}.{}", layout::RECORD_EXT),
                },
                sealed: e.sealed,
            })
            .collect();

        self.write_all(category, target, entries).await?;
        match loaded.layout {
            RecordLayout::Container => {
                crate::fs::remove_file_if_exists(&layout::container_path(&self.root, category)).await?;
            }
            RecordLayout::PerRecord => {
                crate::fs::remove_dir_if_exists(&layout::record_dir(&self.root, category)).await?;
            }
        }
        info!(category, from = %loaded.layout, to = %target, "category layout converted");
        Ok(())
    }

    /// Re-seal every record under `new`. Entries `old` cannot open are left
    /// as they are and reported.
    ///
    /// A category is rewritten only if something in it was re-sealed, so
    /// running it again with the sessions swapped undoes a partial run.
    pub async fn rekey(&self, old: &VaultSession, new: &VaultSession) -> VaultResult<RekeyReport> {
        new.key()?;
        self.recover_interrupted_swaps().await?;
        let mut report = RekeyReport::default();
        for category in self.categories().await? {
            let loaded = match self.load(old, &category).await {
                Ok(Some(loaded)) => loaded,
                Ok(None) => continue,
                Err(VaultError::Format(e)) => {
                    warn!(category = %category, "leaving malformed category as is: {e}");
                    report.skipped.push(category);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut resealed = 0;
            let mut entries = Vec::with_capacity(loaded.entries.len());
            for entry in loaded.entries {
                let sealed = match &entry.record {
                    Some(record) => {
                        resealed += 1;
                        seal_record(new, record)?
                    }
                    None => {
                        report.skipped.push(format!("{category}/{}", entry.name));
                        entry.sealed
                    }
                };
                entries.push(SealedEntry {
                    name: entry.name,
                    sealed,
                });
            }
            if resealed > 0 {
                self.write_all(&category, loaded.layout, entries).await?;
                report.resealed += resealed;
            }
        }
        Ok(report)
    }

    /// Re-seal under `session` every entry it cannot open but one of `keys`
    /// can. Entries no key opens are left as they are and reported.
    pub async fn recover_with_keys(
        &self,
        session: &VaultSession,
        keys: &[MasterKey],
    ) -> VaultResult<RekeyReport> {
        session.key()?;
        self.recover_interrupted_swaps().await?;
        let mut report = RekeyReport::default();
        for category in self.categories().await? {
            let loaded = match self.load(session, &category).await {
                Ok(Some(loaded)) => loaded,
                Ok(None) => continue,
                Err(VaultError::Format(e)) => {
                    warn!(category = %category, "leaving malformed category as is: {e}");
                    report.skipped.push(category);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut resealed = 0;
            let mut entries = Vec::with_capacity(loaded.entries.len());
            for entry in loaded.entries {
                let sealed = if entry.record.is_some() {
                    entry.sealed
                } else if let Some(record) = open_with_any(keys, &entry.sealed) {
                    resealed += 1;
                    seal_record(session, &record)?
                } else {
                    report.skipped.push(format!("{category}/{}", entry.name));
                    entry.sealed
                };
                entries.push(SealedEntry {
                    name: entry.name,
                    sealed,
                });
            }
            if resealed > 0 {
                self.write_all(&category, loaded.layout, entries).await?;
                report.resealed += resealed;
                info!(category = %category, resealed, "records recovered from an earlier key");
            }
        }
        Ok(report)
    }

    /// Drop every entry of `category` that neither `session` nor any of
    /// `keys` can open, such as truncated or corrupted ciphertext. Returns
    /// the names of the dropped entries.
    ///
    /// This is the only operation that discards ciphertext the vault cannot
    /// read. Callers confirm with the user first.
    pub async fn purge_unreadable(
        &self,
        session: &VaultSession,
        category: &str,
        keys: &[MasterKey],
    ) -> VaultResult<Vec<String>> {
        let Some(loaded) = self.load_for_write(session, category).await? else {
            return Ok(Vec::new());
        };
        let (dropped, kept): (Vec<Entry>, Vec<Entry>) = loaded
            .entries
            .into_iter()
            .partition(|e| e.record.is_none() && open_with_any(keys, &e.sealed).is_none());
        if dropped.is_empty() {
            return Ok(Vec::new());
        }

        match loaded.layout {
            RecordLayout::Container => {
                let sealed = kept.into_iter().map(|e| e.sealed).collect();
                layout::write_container(&self.root, category, sealed).await?;
            }
            RecordLayout::PerRecord => {
                let dir = layout::record_dir(&self.root, category);
                for entry in &dropped {
                    crate::fs::remove_file_if_exists(&dir.join(&entry.name)).await?;
                }
            }
        }
        let names: Vec<String> = dropped.into_iter().map(|e| e.name).collect();
        for name in &names {
            warn!(category, entry = %name, "unreadable record purged");
        }
        Ok(names)
    }

    /// Delete every file of `category`. Used by restore.
    pub async fn remove_category(&self, category: &str) -> VaultResult<()> {
        validate_category(category)?;
        layout::remove_category(&self.root, category).await
    }
}

fn check_category(category: &str, record_category: &str) -> VaultResult<()> {
    validate_category(category)?;
    if record_category != category {
        return Err(VaultError::InvalidInput(format!(
            "record belongs to {record_category:?}, not {category:?}"
        )));
    }
    Ok(())
}

fn seal_record<F: Serialize>(session: &VaultSession, record: &Record<F>) -> VaultResult<String> {
    let plaintext = serde_json::to_vec(record)?;
    session.seal(&plaintext)
}

fn open_record(key: &MasterKey, sealed: &str) -> VaultResult<Record<Value>> {
    let plaintext = lockbox_crypto::open(sealed, key)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

fn open_with_any(keys: &[MasterKey], sealed: &str) -> Option<Record<Value>> {
    keys.iter().find_map(|key| open_record(key, sealed).ok())
}

fn scan_of(loaded: Option<Loaded>) -> CategoryScan {
    let mut scan = CategoryScan::default();
    for entry in loaded.map(|l| l.entries).unwrap_or_default() {
        match entry.record {
            Some(record) => scan.records.push(record),
            None => scan.unreadable.push(entry.name),
        }
    }
    scan
}

fn sealed_list(loaded: Option<Loaded>) -> Vec<String> {
    loaded
        .map(|l| l.entries.into_iter().map(|e| e.sealed).collect())
        .unwrap_or_default()
}

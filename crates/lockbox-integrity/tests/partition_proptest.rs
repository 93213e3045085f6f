//! Every reference and every file lands in exactly one bucket.

use std::collections::BTreeSet;

use lockbox_core::{Record, RecordLayout};
use lockbox_crypto::{MasterKey, VaultSession, KEY_SIZE};
use lockbox_integrity::run_integrity_check;
use lockbox_store::{DocumentStore, RecordStore};
use proptest::prelude::*;
use serde_json::json;

fn reference(path: &str) -> serde_json::Value {
    json!({ "path": path, "filename": "f.bin", "mimeType": "application/octet-stream" })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn partition_is_complete(
        file_count in 0usize..8,
        records in prop::collection::vec(prop::collection::vec(0usize..12, 0..4), 0..6),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = RecordStore::new(dir.path().join("data"), RecordLayout::Container);
            let documents = DocumentStore::new(dir.path().join("documents"));
            let session = VaultSession::new(MasterKey::from_bytes([3; KEY_SIZE]));

            std::fs::create_dir_all(dir.path().join("documents/pets")).unwrap();
            let files: BTreeSet<String> = (0..file_count).map(|i| format!("pets/{i}.enc")).collect();
            for path in &files {
                std::fs::write(dir.path().join("documents").join(path), b"blob").unwrap();
            }

            let mut total_refs = 0;
            for (n, refs) in records.iter().enumerate() {
                total_refs += refs.len();
                let docs: Vec<_> = refs.iter().map(|i| reference(&format!("pets/{i}.enc"))).collect();
                store
                    .add(&session, "pets", &Record::new(n.to_string(), "pets", json!({ "documents": docs })))
                    .await
                    .unwrap();
            }

            let report = run_integrity_check(&store, &documents, &session).await.unwrap();

            prop_assert_eq!(report.matched.len() + report.missing_files.len(), total_refs);
            prop_assert!(report.matched.iter().all(|m| files.contains(&m.file.path)));
            prop_assert!(report.missing_files.iter().all(|m| !files.contains(&m.file.path)));

            let matched: BTreeSet<String> = report.matched.iter().map(|m| m.file.path.clone()).collect();
            let orphaned: Vec<String> = report.orphaned_files.iter().map(|o| o.file.path.clone()).collect();
            let orphan_set: BTreeSet<String> = orphaned.iter().cloned().collect();
            prop_assert_eq!(orphaned.len(), orphan_set.len());
            prop_assert!(matched.is_disjoint(&orphan_set));
            let covered: BTreeSet<String> = matched.union(&orphan_set).cloned().collect();
            prop_assert_eq!(covered, files);
            Ok(())
        })?;
    }
}

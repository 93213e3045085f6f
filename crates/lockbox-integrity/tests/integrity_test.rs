//! Integrity scenarios on real vault directories.

use chrono::Utc;
use lockbox_core::{DocumentReference, Record, RecordLayout};
use lockbox_crypto::{KdfParams, VaultSession};
use lockbox_integrity::{
    delete_orphan, detach_missing_reference, run_integrity_check, view_orphan,
    view_orphan_with_password, OrphanView,
};
use lockbox_store::{Vault, DOCUMENTS_DIR};
use secrecy::SecretString;
use serde_json::json;

async fn vault(dir: &tempfile::TempDir) -> (Vault, VaultSession) {
    Vault::init(
        dir.path(),
        &SecretString::from("first-password"),
        &KdfParams::insecure_fast(),
        RecordLayout::Container,
    )
    .await
    .unwrap()
}

async fn attach(vault: &Vault, session: &VaultSession, category: &str, name: &str) -> DocumentReference {
    vault
        .documents()
        .save_document(session, category, name, "ZG9jdW1lbnQ=", Utc::now())
        .await
        .unwrap()
}

#[tokio::test]
async fn manually_deleted_file_is_reported_missing() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, session) = vault(&dir).await;
    let kept = attach(&vault, &session, "contacts", "id-card.png").await;
    let lost = attach(&vault, &session, "contacts", "passport.pdf").await;

    let records = vault.records();
    records
        .add(
            &session,
            "contacts",
            &Record::new("1", "contacts", json!({ "name": "Ana", "documents": [kept, lost] })),
        )
        .await
        .unwrap();
    records
        .add(&session, "contacts", &Record::new("2", "contacts", json!({ "name": "Bo" })))
        .await
        .unwrap();

    std::fs::remove_file(dir.path().join(DOCUMENTS_DIR).join(&lost.path)).unwrap();

    let report = run_integrity_check(records, vault.documents(), &session).await.unwrap();
    assert_eq!(report.total_data_records, 2);
    assert_eq!(report.missing_files.len(), 1);
    assert_eq!(report.missing_files[0].file.path, lost.path);
    assert_eq!(report.missing_files[0].record_id, "1");
    assert_eq!(report.matched.len(), 1);
    assert_eq!(report.matched[0].file.path, kept.path);
    assert!(report.matched[0].file.size > 0);
    assert!(report.orphaned_files.is_empty());
    assert_eq!(report.data_files.len(), 1);

    // Detaching is idempotent and clears the defect
    assert_eq!(
        detach_missing_reference(records, &session, &report.missing_files[0]).await.unwrap(),
        1
    );
    assert_eq!(
        detach_missing_reference(records, &session, &report.missing_files[0]).await.unwrap(),
        0
    );
    let report = run_integrity_check(records, vault.documents(), &session).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.matched.len(), 1);
}

#[tokio::test]
async fn unreferenced_file_is_an_orphan_and_deletable() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, session) = vault(&dir).await;
    let used = attach(&vault, &session, "pets", "rex.png").await;
    let stray = attach(&vault, &session, "medical", "xray.png").await;
    vault
        .records()
        .add(&session, "pets", &Record::new("1", "pets", json!({ "photo": used })))
        .await
        .unwrap();

    let report = run_integrity_check(vault.records(), vault.documents(), &session)
        .await
        .unwrap();
    assert_eq!(report.orphaned_files.len(), 1);
    let orphan = &report.orphaned_files[0];
    assert_eq!(orphan.category, "medical");
    assert_eq!(orphan.file.path, stray.path);
    let on_disk = std::fs::metadata(dir.path().join(DOCUMENTS_DIR).join(&stray.path)).unwrap();
    assert_eq!(orphan.file.size, on_disk.len());

    assert_eq!(
        view_orphan(vault.documents(), &session, orphan).await.unwrap(),
        OrphanView::Readable(b"document".to_vec())
    );

    let records_before = std::fs::read(dir.path().join("data/pets.vault")).unwrap();
    assert!(delete_orphan(vault.documents(), orphan).await.unwrap());
    assert!(!delete_orphan(vault.documents(), orphan).await.unwrap());
    assert_eq!(std::fs::read(dir.path().join("data/pets.vault")).unwrap(), records_before);

    let report = run_integrity_check(vault.records(), vault.documents(), &session)
        .await
        .unwrap();
    assert!(report.is_clean());
}

#[tokio::test]
async fn orphan_from_before_password_change_needs_old_password() {
    let dir = tempfile::tempdir().unwrap();
    let (mut vault, session) = vault(&dir).await;
    let stray = attach(&vault, &session, "medical", "old-scan.pdf").await;

    let (next, change) = vault
        .change_password(&session, &SecretString::from("second-password"), &KdfParams::insecure_fast())
        .await
        .unwrap();
    assert_eq!(change.documents.resealed, 1);

    // Simulate a file that missed the re-seal: write one under the old key
    let left_behind = attach(&vault, &session, "medical", "missed.pdf").await;

    let report = run_integrity_check(vault.records(), vault.documents(), &next)
        .await
        .unwrap();
    let orphan = report
        .orphaned_files
        .iter()
        .find(|o| o.file.path == left_behind.path)
        .unwrap();
    let resealed = report
        .orphaned_files
        .iter()
        .find(|o| o.file.path == stray.path)
        .unwrap();

    assert_eq!(
        view_orphan(vault.documents(), &next, resealed).await.unwrap(),
        OrphanView::Readable(b"document".to_vec())
    );
    assert_eq!(
        view_orphan(vault.documents(), &next, orphan).await.unwrap(),
        OrphanView::NeedsAlternatePassword
    );
    assert_eq!(
        view_orphan_with_password(
            vault.documents(),
            vault.keyfile(),
            &SecretString::from("first-password"),
            orphan
        )
        .await
        .unwrap(),
        OrphanView::Readable(b"document".to_vec())
    );
    assert_eq!(
        view_orphan_with_password(
            vault.documents(),
            vault.keyfile(),
            &SecretString::from("never-used"),
            orphan
        )
        .await
        .unwrap(),
        OrphanView::Unrecoverable
    );
    assert!(delete_orphan(vault.documents(), orphan).await.unwrap());
}

#[tokio::test]
async fn unreadable_records_are_counted() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, session) = vault(&dir).await;
    vault
        .records()
        .add(&session, "pets", &Record::new("1", "pets", json!({})))
        .await
        .unwrap();
    let other = VaultSession::new(lockbox_crypto::MasterKey::from_bytes([7; lockbox_crypto::KEY_SIZE]));
    vault
        .records()
        .add(&other, "pets", &Record::new("2", "pets", json!({})))
        .await
        .unwrap();

    let report = run_integrity_check(vault.records(), vault.documents(), &session)
        .await
        .unwrap();
    assert_eq!(report.total_data_records, 1);
    assert_eq!(report.unreadable_records, 1);
    assert!(!report.is_clean());
}

#[tokio::test]
async fn purging_unreadable_records_makes_the_vault_clean() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, session) = vault(&dir).await;
    vault
        .records()
        .add(&session, "pets", &Record::new("1", "pets", json!({})))
        .await
        .unwrap();
    vault
        .records()
        .add(&session, "pets", &Record::new("2", "pets", json!({})))
        .await
        .unwrap();

    // Truncate the second record's ciphertext
    let path = dir.path().join(lockbox_store::DATA_DIR).join("pets.vault");
    let mut container: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    let sealed = container["records"][1].as_str().unwrap().to_string();
    container["records"][1] = serde_json::Value::String(sealed[..sealed.len() / 2].to_string());
    std::fs::write(&path, serde_json::to_vec(&container).unwrap()).unwrap();

    let before = run_integrity_check(vault.records(), vault.documents(), &session)
        .await
        .unwrap();
    assert!(!before.is_clean());

    let keys = vault.candidate_keys(&SecretString::from("first-password")).unwrap();
    let purged = vault.records().purge_unreadable(&session, "pets", &keys).await.unwrap();
    assert_eq!(purged, vec!["#1"]);

    let after = run_integrity_check(vault.records(), vault.documents(), &session)
        .await
        .unwrap();
    assert_eq!(after.total_data_records, 1);
    assert_eq!(after.unreadable_records, 0);
    assert!(after.is_clean());
}

//! Legacy export import.

use lockbox_backup::import_legacy_backup;
use lockbox_core::{Record, RecordLayout, VaultError};
use lockbox_crypto::KdfParams;
use lockbox_store::Vault;
use secrecy::SecretString;
use serde_json::json;

#[tokio::test]
async fn imports_sealed_and_plain_categories() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, session) = Vault::init(
        &dir.path().join("vault"),
        &SecretString::from("legacy-pass"),
        &KdfParams::insecure_fast(),
        RecordLayout::Container,
    )
    .await
    .unwrap();

    let sealed_contacts = session
        .seal(
            serde_json::to_vec(&json!([
                { "id": "1", "name": "Ana" },
                { "id": 2, "name": "Bo" }
            ]))
            .unwrap()
            .as_slice(),
        )
        .unwrap();
    let export = json!({
        "data": {
            "contacts": sealed_contacts,
            "pets": [{ "id": 10, "name": "Rex" }, { "name": "no id" }],
            "finance_items": "xc1:not-really-a-blob",
            "bad/name": []
        },
        "master_password_hash": "$argon2id$v=19$..."
    });
    let path = dir.path().join("export.json");
    std::fs::write(&path, serde_json::to_vec(&export).unwrap()).unwrap();

    let report = import_legacy_backup(&path, vault.records(), &session).await.unwrap();
    assert!(report.had_password_hash);
    assert_eq!(report.records, 3);
    assert_eq!(report.keys, vec!["contacts", "pets"]);

    let failed: Vec<&str> = report.failures.iter().map(|f| f.category.as_str()).collect();
    assert_eq!(failed, vec!["bad/name", "finance_items", "pets"]);

    let contacts: Vec<Record> = vault.records().get(&session, "contacts").await.unwrap();
    assert_eq!(contacts[1].id, "2");
    assert_eq!(contacts[1].fields, json!({ "name": "Bo" }));
    let pets: Vec<Record> = vault.records().get(&session, "pets").await.unwrap();
    assert_eq!(pets.len(), 1);
    assert_eq!(pets[0].id, "10");
}

#[tokio::test]
async fn malformed_export_is_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, session) = Vault::init(
        dir.path(),
        &SecretString::from("legacy-pass"),
        &KdfParams::insecure_fast(),
        RecordLayout::Container,
    )
    .await
    .unwrap();
    let path = dir.path().join("export.json");
    std::fs::write(&path, br#"{"categories": {}}"#).unwrap();

    let result = import_legacy_backup(&path, vault.records(), &session).await;
    assert!(matches!(result, Err(VaultError::Format(_))));
}

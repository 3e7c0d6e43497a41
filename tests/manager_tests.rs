use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;

use attachment_manager::config::Config;
use attachment_manager::manager::{AttachmentError, AttachmentManager};
use attachment_manager::object_store::{LocalStore, ObjectStore};
use attachment_manager::storage::Database;
use attachment_manager::validation::{RuleRegistry, SizeLimits, ValidationError};

fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.path().join("data").to_string_lossy().to_string();
    config.storage.public_path = dir.path().join("public").to_string_lossy().to_string();
    config.storage.private_path = dir.path().join("private").to_string_lossy().to_string();
    config
}

fn build_manager(config: Config) -> (Database, AttachmentManager, Arc<dyn ObjectStore>) {
    let db = Database::open(&config.data_dir).unwrap();
    let public: Arc<dyn ObjectStore> =
        Arc::new(LocalStore::new(&config.storage.public_path).unwrap());
    let private: Arc<dyn ObjectStore> =
        Arc::new(LocalStore::new(&config.storage.private_path).unwrap());
    let manager = AttachmentManager::new(config, db.clone(), Arc::clone(&public), private);
    (db, manager, public)
}

#[tokio::test]
async fn upload_stores_blob_under_content_hash_name() {
    let dir = tempfile::tempdir().unwrap();
    let (db, manager, store) = build_manager(test_config(&dir));

    let record = manager
        .create_from_bytes(Bytes::from("hello"), "Photo.JPG", Some("posts"), false, Some(9))
        .await
        .unwrap();

    assert_eq!(record.name.len(), 40 + 4);
    assert!(record.name.ends_with(".jpg"));
    assert_eq!(record.name_original, "Photo.JPG");
    assert_eq!(record.group.as_deref(), Some("posts"));
    assert_eq!(record.creator_id, Some(9));
    assert_eq!(record.mime_type(), "image/jpeg");

    assert_eq!(
        store.get(&record.storage_key()).await.unwrap(),
        Bytes::from("hello")
    );
    assert_eq!(
        db.get_attachment_by_path(false, &record.storage_key()).unwrap().unwrap().id,
        record.id
    );
}

#[tokio::test]
async fn duplicate_content_resolves_to_the_same_attachment() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, manager, store) = build_manager(test_config(&dir));

    let first = manager
        .create_from_bytes(Bytes::from("same"), "a.txt", Some("docs"), false, None)
        .await
        .unwrap();
    let second = manager
        .create_from_bytes(Bytes::from("same"), "b.txt", Some("docs"), false, None)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert!(store.exists(&first.storage_key()).await.unwrap());

    // Same content in a different group is a separate attachment
    let elsewhere = manager
        .create_from_bytes(Bytes::from("same"), "a.txt", None, false, None)
        .await
        .unwrap();
    assert_ne!(first.id, elsewhere.id);
}

#[tokio::test]
async fn rejected_uploads_leave_no_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.size_limits = SizeLimits::parse("txt=4").unwrap();
    let public_root = std::path::PathBuf::from(&config.storage.public_path);
    let (db, manager, _store) = build_manager(config);

    let err = manager
        .create_from_bytes(Bytes::from("12345"), "big.txt", Some("docs"), false, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AttachmentError::Validation(ValidationError::SizeExceeded { .. })
    ));

    // Validation runs before any write
    assert!(!public_root.join("docs").exists());
    assert!(db.get_attachment(1).unwrap().is_none());
}

#[tokio::test]
async fn hard_upload_cap_applies_to_all_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.max_upload_size = 3;
    let (_db, manager, _store) = build_manager(config);

    let err = manager
        .create_from_bytes(Bytes::from("toolong"), "a.bin", None, false, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AttachmentError::Validation(ValidationError::SizeExceeded { .. })
    ));
}

#[tokio::test]
async fn group_names_are_validated() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, manager, _store) = build_manager(test_config(&dir));

    let err = manager
        .create_from_bytes(Bytes::from("x"), "a.txt", Some("../escape"), false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AttachmentError::InvalidGroup(_)));
}

#[tokio::test]
async fn group_rules_gate_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.group_rules = RuleRegistry::default()
        .build_group_rules(&json!({
            "docs": [{ "rule": "extension", "ext": ["pdf"] }]
        }))
        .unwrap();
    let (_db, manager, _store) = build_manager(config);

    let err = manager
        .create_from_bytes(Bytes::from("x"), "a.jpg", Some("docs"), false, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AttachmentError::Validation(ValidationError::ExtensionNotPermitted(_))
    ));

    manager
        .create_from_bytes(Bytes::from("x"), "a.pdf", Some("docs"), false, None)
        .await
        .unwrap();
    // Groups without rules accept anything
    manager
        .create_from_bytes(Bytes::from("x"), "a.jpg", Some("misc"), false, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn urls_differ_for_public_and_private() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let public_root = config.storage.public_path.clone();
    let (_db, manager, _store) = build_manager(config);

    let public = manager
        .create_from_bytes(Bytes::from("pub"), "a.txt", Some("posts"), false, None)
        .await
        .unwrap();
    let private = manager
        .create_from_bytes(Bytes::from("priv"), "b.txt", None, true, None)
        .await
        .unwrap();

    let url = manager.url(&public, false);
    assert_eq!(url, format!("/storage/attachments/{}", public.storage_key()));
    assert_eq!(
        manager.url(&public, true),
        format!("https://localhost{url}")
    );

    // Private files route through the token-gated obtain endpoint
    assert_eq!(
        manager.url(&private, false),
        format!("/attachments/{}/url", private.id)
    );

    // Filesystem paths resolve under the visibility root
    assert_eq!(
        manager.relative_path(&public),
        format!("{public_root}/{}", public.storage_key())
    );
    let absolute = manager.absolute_path(&public).unwrap();
    assert!(absolute.is_absolute());
    assert!(absolute.ends_with(public.storage_key()));
}

#[tokio::test]
async fn create_from_file_adopts_managed_files_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let public_root = std::path::PathBuf::from(&config.storage.public_path);
    let (_db, manager, store) = build_manager(config);

    // A file that already sits inside the public root keeps its name
    std::fs::create_dir_all(public_root.join("imports")).unwrap();
    let managed = public_root.join("imports/existing.txt");
    std::fs::write(&managed, "managed").unwrap();

    let adopted = manager
        .create_from_file(&managed, None, false, None)
        .await
        .unwrap();
    assert_eq!(adopted.name, "existing.txt");
    assert_eq!(adopted.group.as_deref(), Some("imports"));
    assert_eq!(adopted.storage_key(), "imports/existing.txt");

    // A file elsewhere is copied in under a hashed name
    let outside = dir.path().join("outside.txt");
    std::fs::write(&outside, "outside").unwrap();

    let copied = manager
        .create_from_file(&outside, Some("uploads"), false, None)
        .await
        .unwrap();
    assert_eq!(copied.name_original, "outside.txt");
    assert_ne!(copied.name, "outside.txt");
    assert!(store.exists(&copied.storage_key()).await.unwrap());
}

#[tokio::test]
async fn reingesting_a_stored_file_reuses_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let public_root = std::path::PathBuf::from(&config.storage.public_path);
    let (_db, manager, _store) = build_manager(config);

    let record = manager
        .create_from_bytes(Bytes::from("hello"), "photo.jpg", Some("posts"), false, None)
        .await
        .unwrap();

    // Pointing create_from_file at the managed blob resolves to the row
    // that already describes it
    let blob_path = public_root.join(record.storage_key());
    let again = manager
        .create_from_file(&blob_path, None, false, None)
        .await
        .unwrap();
    assert_eq!(again.id, record.id);
    assert_eq!(again.name, record.name);

    // Adopting it twice is just as idempotent
    let adopted = manager
        .create_from_file(&blob_path, None, false, None)
        .await
        .unwrap();
    assert_eq!(adopted.id, record.id);
}

#[tokio::test]
async fn delete_removes_blob_and_row() {
    let dir = tempfile::tempdir().unwrap();
    let (db, manager, store) = build_manager(test_config(&dir));

    let record = manager
        .create_from_bytes(Bytes::from("bye"), "a.txt", None, false, None)
        .await
        .unwrap();

    assert!(manager.delete(record.id).await.unwrap());
    assert!(!store.exists(&record.storage_key()).await.unwrap());
    assert!(db.get_attachment(record.id).unwrap().is_none());

    assert!(!manager.delete(record.id).await.unwrap());
}

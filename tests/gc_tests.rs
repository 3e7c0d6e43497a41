use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};

use attachment_manager::config::Config;
use attachment_manager::manager::AttachmentManager;
use attachment_manager::object_store::{LocalStore, ObjectStore};
use attachment_manager::storage::models::{AttachmentRecord, OwnerRef};
use attachment_manager::storage::{Database, NewAttachment};

fn test_manager(dir: &tempfile::TempDir) -> (Database, AttachmentManager, Arc<dyn ObjectStore>) {
    let mut config = Config::default();
    config.data_dir = dir.path().join("data").to_string_lossy().to_string();
    config.storage.public_path = dir.path().join("public").to_string_lossy().to_string();
    config.storage.private_path = dir.path().join("private").to_string_lossy().to_string();

    let db = Database::open(&config.data_dir).unwrap();
    let public: Arc<dyn ObjectStore> =
        Arc::new(LocalStore::new(&config.storage.public_path).unwrap());
    let private: Arc<dyn ObjectStore> =
        Arc::new(LocalStore::new(&config.storage.private_path).unwrap());
    let manager = AttachmentManager::new(config, db.clone(), Arc::clone(&public), private);
    (db, manager, public)
}

/// Insert a public attachment row backdated by `age_seconds`, with a blob.
async fn aged_attachment(
    db: &Database,
    store: &Arc<dyn ObjectStore>,
    name: &str,
    age_seconds: i64,
) -> AttachmentRecord {
    let record = db
        .insert_attachment(NewAttachment {
            name: name.to_string(),
            name_original: name.to_string(),
            group: None,
            private: false,
            creator_id: None,
            created_at: Utc::now() - Duration::seconds(age_seconds),
        })
        .unwrap();
    store.put(name, Bytes::from("content")).await.unwrap();
    record
}

#[tokio::test]
async fn fresh_attachment_is_never_collected() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, manager, _store) = test_manager(&dir);

    manager
        .create_from_bytes(Bytes::from("data"), "fresh.txt", None, false, None)
        .await
        .unwrap();

    assert_eq!(manager.cleanup(Some(3600), false, None).await.unwrap(), 0);
}

#[tokio::test]
async fn orphan_inside_window_is_kept_outside_is_swept() {
    let dir = tempfile::tempdir().unwrap();
    let (db, manager, store) = test_manager(&dir);

    // With a 3600s window: 1800s old survives, 3601s old is collected
    let young = aged_attachment(&db, &store, "young.txt", 1800).await;
    let old = aged_attachment(&db, &store, "old.txt", 3601).await;

    assert_eq!(manager.cleanup(Some(3600), false, None).await.unwrap(), 1);

    assert!(db.get_attachment(young.id).unwrap().is_some());
    assert!(store.exists("young.txt").await.unwrap());
    assert!(db.get_attachment(old.id).unwrap().is_none());
    assert!(!store.exists("old.txt").await.unwrap());
}

#[tokio::test]
async fn referenced_attachment_outlives_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let (db, manager, store) = test_manager(&dir);

    let used = aged_attachment(&db, &store, "used.txt", 7200).await;
    db.add_usage(used.id, &OwnerRef::new("post", "1"), "default").unwrap();

    assert_eq!(manager.cleanup(Some(3600), false, None).await.unwrap(), 0);
    assert!(db.get_attachment(used.id).unwrap().is_some());

    // Dropping the last edge makes it collectable again
    db.remove_usage(used.id, &OwnerRef::new("post", "1")).unwrap();
    assert_eq!(manager.cleanup(Some(3600), false, None).await.unwrap(), 1);
}

#[tokio::test]
async fn default_window_applies_when_unset() {
    let dir = tempfile::tempdir().unwrap();
    let (db, manager, store) = test_manager(&dir);

    // Default expiry is 10800 seconds
    let kept = aged_attachment(&db, &store, "kept.txt", 10_000).await;
    let swept = aged_attachment(&db, &store, "swept.txt", 11_000).await;

    assert_eq!(manager.cleanup(None, false, None).await.unwrap(), 1);
    assert!(db.get_attachment(kept.id).unwrap().is_some());
    assert!(db.get_attachment(swept.id).unwrap().is_none());
}

#[tokio::test]
async fn only_metadata_leaves_blobs_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let (db, manager, store) = test_manager(&dir);

    let record = aged_attachment(&db, &store, "meta.txt", 4000).await;

    assert_eq!(manager.cleanup(Some(3600), true, None).await.unwrap(), 1);
    assert!(db.get_attachment(record.id).unwrap().is_none());
    assert!(store.exists("meta.txt").await.unwrap());
}

#[tokio::test]
async fn sweep_spans_multiple_batches() {
    let dir = tempfile::tempdir().unwrap();
    let (db, manager, store) = test_manager(&dir);

    for i in 0..5 {
        aged_attachment(&db, &store, &format!("orphan-{i}.txt"), 5000).await;
    }

    assert_eq!(manager.cleanup(Some(3600), false, Some(2)).await.unwrap(), 5);
    assert_eq!(manager.cleanup(Some(3600), false, Some(2)).await.unwrap(), 0);
}

#[tokio::test]
async fn missing_blob_does_not_stop_the_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let (db, manager, store) = test_manager(&dir);

    let record = aged_attachment(&db, &store, "gone.txt", 4000).await;
    store.delete("gone.txt").await.unwrap();

    assert_eq!(manager.cleanup(Some(3600), false, None).await.unwrap(), 1);
    assert!(db.get_attachment(record.id).unwrap().is_none());
}

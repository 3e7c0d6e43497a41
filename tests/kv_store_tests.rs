use std::time::Duration;

use attachment_manager::kv_store::{KvStore, MemoryKvStore, RedbKvStore};
use attachment_manager::storage::Database;

const TTL: Duration = Duration::from_secs(60);

fn redb_store(dir: &tempfile::TempDir) -> RedbKvStore {
    let db = Database::open(dir.path().join("data")).unwrap();
    RedbKvStore::new(db)
}

async fn set_get_roundtrip(store: &dyn KvStore) {
    store.set_ex("att:abc", "1:2", TTL).await.unwrap();
    assert_eq!(store.get("att:abc").await.unwrap().as_deref(), Some("1:2"));
    assert!(store.get("att:missing").await.unwrap().is_none());

    // Overwrite replaces the value
    store.set_ex("att:abc", "3:4", TTL).await.unwrap();
    assert_eq!(store.get("att:abc").await.unwrap().as_deref(), Some("3:4"));
}

async fn zero_ttl_reads_as_absent(store: &dyn KvStore) {
    store.set_ex("gone", "x", Duration::ZERO).await.unwrap();
    assert!(store.get("gone").await.unwrap().is_none());
    assert!(store.keys("gone*").await.unwrap().is_empty());
    assert!(!store.expire("gone", TTL).await.unwrap());
}

async fn expire_touches_only_live_keys(store: &dyn KvStore) {
    store.set_ex("live", "x", TTL).await.unwrap();
    assert!(store.expire("live", TTL).await.unwrap());
    assert!(!store.expire("absent", TTL).await.unwrap());

    // A refreshed zero TTL expires the key
    assert!(store.expire("live", Duration::ZERO).await.unwrap());
    assert!(store.get("live").await.unwrap().is_none());
}

async fn del_and_mget(store: &dyn KvStore) {
    store.set_ex("a", "1", TTL).await.unwrap();
    store.set_ex("b", "2", TTL).await.unwrap();

    let values = store
        .mget(&["a".to_string(), "missing".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(
        values,
        vec![Some("1".to_string()), None, Some("2".to_string())]
    );

    store.del(&["a".to_string(), "b".to_string()]).await.unwrap();
    assert!(store.get("a").await.unwrap().is_none());
    assert!(store.get("b").await.unwrap().is_none());
}

async fn keys_filter_by_glob(store: &dyn KvStore) {
    store.set_ex("att:5:1", "t1", TTL).await.unwrap();
    store.set_ex("att:5:2", "t2", TTL).await.unwrap();
    store.set_ex("att:6:1", "t3", TTL).await.unwrap();
    store.set_ex("att:sometoken", "5:1", TTL).await.unwrap();

    let mut keys = store.keys("att:5:*").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["att:5:1".to_string(), "att:5:2".to_string()]);

    let mut keys = store.keys("att:*:1").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["att:5:1".to_string(), "att:6:1".to_string()]);

    assert!(store.keys("other:*").await.unwrap().is_empty());
}

#[tokio::test]
async fn memory_store_behaviour() {
    let store = MemoryKvStore::new();
    set_get_roundtrip(&store).await;
    zero_ttl_reads_as_absent(&store).await;
    expire_touches_only_live_keys(&store).await;
    del_and_mget(&store).await;
    keys_filter_by_glob(&store).await;
}

#[tokio::test]
async fn redb_store_behaviour() {
    let dir = tempfile::tempdir().unwrap();
    let store = redb_store(&dir);
    set_get_roundtrip(&store).await;
    zero_ttl_reads_as_absent(&store).await;
    expire_touches_only_live_keys(&store).await;
    del_and_mget(&store).await;
    keys_filter_by_glob(&store).await;
}

#[tokio::test]
async fn redb_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = redb_store(&dir);
        store.set_ex("att:persist", "1:2", TTL).await.unwrap();
    }

    // Deadlines are wall-clock, so the entry is still live after a restart
    let store = redb_store(&dir);
    assert_eq!(
        store.get("att:persist").await.unwrap().as_deref(),
        Some("1:2")
    );
}

use std::sync::Arc;

use attachment_manager::kv_store::MemoryKvStore;
use attachment_manager::storage::models::OwnerRef;
use attachment_manager::storage::Database;
use attachment_manager::token::{AccessPolicy, AccessPolicyRegistry, TokenManager};

const TOKEN_LENGTH: usize = 60;

fn test_tokens(policies: AccessPolicyRegistry) -> (tempfile::TempDir, Database, TokenManager) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let tokens = TokenManager::new(
        Arc::new(MemoryKvStore::new()),
        db.clone(),
        3600,
        TOKEN_LENGTH,
        policies,
    );
    (dir, db, tokens)
}

/// Grants access to exactly one principal id.
struct SinglePrincipal(u64);

impl AccessPolicy for SinglePrincipal {
    fn allows(&self, _owner: &OwnerRef, principal_id: u64) -> bool {
        principal_id == self.0
    }
}

#[tokio::test]
async fn obtain_reuses_the_existing_token() {
    let (_dir, _db, tokens) = test_tokens(AccessPolicyRegistry::default());

    let first = tokens.obtain(1, 10).await.unwrap().expect("token issued");
    let second = tokens.obtain(1, 10).await.unwrap().expect("token issued");
    assert_eq!(first, second);

    // A different pair gets its own token
    let other = tokens.obtain(1, 11).await.unwrap().expect("token issued");
    assert_ne!(first, other);
}

#[tokio::test]
async fn issued_tokens_resolve_in_both_directions() {
    let (_dir, _db, tokens) = test_tokens(AccessPolicyRegistry::default());

    let token = tokens.obtain(42, 7).await.unwrap().unwrap();
    assert!(tokens.validate_token_str(&token));
    assert_eq!(tokens.get(&token).await.unwrap(), (Some(42), Some(7)));
    assert_eq!(tokens.get_token(42, 7).await.unwrap(), Some(token));
    assert!(tokens.has(42, 7).await.unwrap());

    assert_eq!(tokens.get("nonsense").await.unwrap(), (None, None));
    assert!(!tokens.has(42, 8).await.unwrap());
}

#[tokio::test]
async fn store_succeeds_at_most_once_per_pair() {
    let (_dir, _db, tokens) = test_tokens(AccessPolicyRegistry::default());

    let token = tokens.generate_token_str();
    assert!(tokens.store(1, 2, &token).await.unwrap());

    // Same pair, fresh token: refused while the first is live
    let other = tokens.generate_token_str();
    assert!(!tokens.store(1, 2, &other).await.unwrap());

    // Same token, different pair: refused, the token is taken
    assert!(!tokens.store(3, 4, &token).await.unwrap());
}

#[tokio::test]
async fn refresh_only_touches_live_tokens() {
    let (_dir, _db, tokens) = test_tokens(AccessPolicyRegistry::default());

    let token = tokens.obtain(1, 2).await.unwrap().unwrap();
    assert!(tokens.refresh(&token).await.unwrap());
    assert!(!tokens.refresh("unknown-token").await.unwrap());
}

#[tokio::test]
async fn destroy_pair_removes_both_entries() {
    let (_dir, _db, tokens) = test_tokens(AccessPolicyRegistry::default());

    let token = tokens.obtain(1, 2).await.unwrap().unwrap();
    tokens.destroy(Some(1), Some(2)).await.unwrap();

    assert_eq!(tokens.get(&token).await.unwrap(), (None, None));
    assert!(tokens.get_token(1, 2).await.unwrap().is_none());
}

#[tokio::test]
async fn destroy_by_attachment_revokes_every_principal() {
    let (_dir, _db, tokens) = test_tokens(AccessPolicyRegistry::default());

    let t1 = tokens.obtain(5, 1).await.unwrap().unwrap();
    let t2 = tokens.obtain(5, 2).await.unwrap().unwrap();
    let unrelated = tokens.obtain(6, 1).await.unwrap().unwrap();

    tokens.destroy(Some(5), None).await.unwrap();

    assert_eq!(tokens.get(&t1).await.unwrap(), (None, None));
    assert_eq!(tokens.get(&t2).await.unwrap(), (None, None));
    assert!(tokens.get_token(5, 1).await.unwrap().is_none());
    assert!(tokens.get_token(5, 2).await.unwrap().is_none());
    // Other attachments are untouched
    assert_eq!(tokens.get(&unrelated).await.unwrap(), (Some(6), Some(1)));
}

#[tokio::test]
async fn destroy_by_principal_revokes_reverse_entries() {
    let (_dir, _db, tokens) = test_tokens(AccessPolicyRegistry::default());

    tokens.obtain(5, 1).await.unwrap().unwrap();
    tokens.obtain(6, 1).await.unwrap().unwrap();
    let unrelated = tokens.obtain(5, 2).await.unwrap().unwrap();

    tokens.destroy(None, Some(1)).await.unwrap();

    assert!(tokens.get_token(5, 1).await.unwrap().is_none());
    assert!(tokens.get_token(6, 1).await.unwrap().is_none());
    assert_eq!(tokens.get(&unrelated).await.unwrap(), (Some(5), Some(2)));
}

#[tokio::test]
async fn destroy_str_removes_the_pair() {
    let (_dir, _db, tokens) = test_tokens(AccessPolicyRegistry::default());

    let token = tokens.obtain(9, 3).await.unwrap().unwrap();
    tokens.destroy_str(&token).await.unwrap();

    assert_eq!(tokens.get(&token).await.unwrap(), (None, None));
    assert!(tokens.get_token(9, 3).await.unwrap().is_none());

    // Unknown tokens are a no-op
    tokens.destroy_str("does-not-exist").await.unwrap();
}

#[tokio::test]
async fn can_download_consults_owner_policies() {
    let mut policies = AccessPolicyRegistry::default();
    policies.register("post", Arc::new(SinglePrincipal(1)));
    let (_dir, db, tokens) = test_tokens(policies);

    use attachment_manager::storage::NewAttachment;
    let record = db
        .insert_attachment(NewAttachment {
            name: "secret.pdf".to_string(),
            name_original: "secret.pdf".to_string(),
            group: None,
            private: true,
            creator_id: None,
            created_at: chrono::Utc::now(),
        })
        .unwrap();

    // No referencing owner: deny
    assert!(!tokens.can_download(record.id, 1).await.unwrap());

    db.add_usage(record.id, &OwnerRef::new("post", "77"), "default").unwrap();
    assert!(tokens.can_download(record.id, 1).await.unwrap());
    assert!(!tokens.can_download(record.id, 2).await.unwrap());

    // Owner type without any registered policy: deny
    db.remove_usage(record.id, &OwnerRef::new("post", "77")).unwrap();
    db.add_usage(record.id, &OwnerRef::new("draft", "77"), "default").unwrap();
    assert!(!tokens.can_download(record.id, 1).await.unwrap());
}

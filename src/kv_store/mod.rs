mod memory;
mod redb_kv;

pub use memory::MemoryKvStore;
pub use redb_kv::RedbKvStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("Store error: {0}")]
    Store(String),
}

impl From<crate::storage::DatabaseError> for KvError {
    fn from(e: crate::storage::DatabaseError) -> Self {
        KvError::Store(e.to_string())
    }
}

/// A key-value store with per-key TTL, the backing for the access token
/// service. Expired entries read as absent.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set a key with a time-to-live, overwriting any existing entry.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, KvError>;
    async fn del(&self, keys: &[String]) -> Result<(), KvError>;
    /// Reset the TTL of an existing, unexpired key. Returns false if the
    /// key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;
    /// List live keys matching a glob pattern (`*` wildcard only).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;
}

/// Match a string against a glob pattern where `*` matches any run of
/// characters (including none). No other metacharacters.
pub fn glob_match(pattern: &str, s: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == s;
    }

    let mut rest = s;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part) && rest.len() >= part.len();
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '*'
    true
}

mod local;

pub use local::LocalStore;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Abstraction over blob storage backends.
///
/// Keys are relative file paths (`{group?}/{name}`, or
/// `{cache}/{preset}/...` for derivatives), so backends must handle nested
/// directories. Prefix operations exist for preset-cache invalidation,
/// which is a directory delete by construction.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;
    /// Remove every object under a prefix (a directory subtree).
    async fn delete_prefix(&self, prefix: &str) -> Result<(), ObjectStoreError>;
    /// List immediate subdirectory names under a prefix.
    async fn list_dirs(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
}

//! attachment-manager - Usage-governed attachment storage
//!
//! This crate stores uploaded files with reference-counted lifetimes:
//! - Attachment metadata in a redb embedded database (ACID, MVCC, crash-safe)
//! - Blobs in swappable object storage (local filesystem)
//! - A usage ledger tying attachments to owning entities; unreferenced
//!   attachments are garbage-collected after an expiry window
//! - TTL'd access tokens for private downloads, over a Redis-like KV seam
//! - A deterministic, lazily-materialized image derivative cache
//! - REST API with multipart upload support

pub mod api;
pub mod config;
pub mod image_preset;
pub mod kv_store;
pub mod manager;
pub mod object_store;
pub mod storage;
pub mod token;
pub mod usage;
pub mod validation;

use std::sync::Arc;

use config::Config;
use image_preset::DerivativeCache;
use manager::AttachmentManager;
use storage::Database;
use token::TokenManager;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub manager: AttachmentManager,
    pub tokens: TokenManager,
    pub derivatives: DerivativeCache,
}

impl AppState {
    /// Wire up the full service over an open database and blob stores.
    pub fn build(
        config: Config,
        db: Database,
        public_store: Arc<dyn object_store::ObjectStore>,
        private_store: Arc<dyn object_store::ObjectStore>,
        kv: Arc<dyn kv_store::KvStore>,
        policies: token::AccessPolicyRegistry,
    ) -> Self {
        let manager = AttachmentManager::new(
            config.clone(),
            db.clone(),
            Arc::clone(&public_store),
            Arc::clone(&private_store),
        );
        let tokens = TokenManager::new(
            kv,
            db.clone(),
            config.token.ttl_seconds,
            config.token.length,
            policies,
        );
        let derivatives = DerivativeCache::new(
            public_store,
            config.storage.image_cache_path.clone(),
            config.max_image_dimension,
        );

        Self {
            config,
            db,
            manager,
            tokens,
            derivatives,
        }
    }
}

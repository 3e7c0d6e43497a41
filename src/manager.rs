//! Attachment lifecycle: ingestion from bytes, local files and remote URLs,
//! path and URL derivation, deletion, and the orphan sweep.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;

use bytes::Bytes;
use chrono::Utc;
use regex::Regex;
use ring::digest;
use thiserror::Error;

use crate::config::Config;
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::storage::models::AttachmentRecord;
use crate::storage::{Database, DatabaseError, NewAttachment};
use crate::validation::{UploadCheck, ValidationError};

/// Content-hash prefix length used for stored file names.
const HASH_NAME_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Storage error: {0}")]
    Store(#[from] ObjectStoreError),
    #[error("Fetch error: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid group name: '{0}'")]
    InvalidGroup(String),
}

pub struct AttachmentManager {
    config: Config,
    db: Database,
    public_store: Arc<dyn ObjectStore>,
    private_store: Arc<dyn ObjectStore>,
}

impl AttachmentManager {
    pub fn new(
        config: Config,
        db: Database,
        public_store: Arc<dyn ObjectStore>,
        private_store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            db,
            public_store,
            private_store,
        }
    }

    pub fn store_for(&self, private: bool) -> &Arc<dyn ObjectStore> {
        if private {
            &self.private_store
        } else {
            &self.public_store
        }
    }

    fn storage_root(&self, private: bool) -> &str {
        if private {
            &self.config.storage.private_path
        } else {
            &self.config.storage.public_path
        }
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Store a new attachment from in-memory bytes.
    ///
    /// Validation (group rules, size limits, hard upload cap) runs before
    /// any write, so a rejected upload leaves no partial state. The stored
    /// name is a truncated content hash with the original extension, which
    /// makes collisions within a group vanishingly unlikely and the name
    /// safe to serve.
    pub async fn create_from_bytes(
        &self,
        data: Bytes,
        original_name: &str,
        group: Option<&str>,
        private: bool,
        creator_id: Option<u64>,
    ) -> Result<AttachmentRecord, AttachmentError> {
        if let Some(group) = group {
            if !group_name_regex().is_match(group) {
                return Err(AttachmentError::InvalidGroup(group.to_string()));
            }
        }

        let extension = extension_of(original_name);
        let mime = mime_of(original_name);
        let size = data.len() as u64;

        if size > self.config.max_upload_size {
            return Err(ValidationError::SizeExceeded {
                size,
                limit: self.config.max_upload_size,
            }
            .into());
        }
        self.config
            .size_limits
            .check(extension.as_deref(), &mime, size)?;
        self.config.group_rules.check(&UploadCheck {
            file_name: original_name,
            extension: extension.as_deref(),
            mime: &mime,
            size,
            group,
        })?;

        let name = hashed_name(&data, extension.as_deref());
        let name_original = if original_name.is_empty() {
            name.clone()
        } else {
            original_name.to_string()
        };

        let storage_key = match group {
            Some(group) => format!("{group}/{name}"),
            None => name.clone(),
        };

        // Hashed names make a path collision mean identical content, so a
        // repeat upload resolves to the existing attachment.
        if let Some(existing) = self.db.get_attachment_by_path(private, &storage_key)? {
            return Ok(existing);
        }

        self.store_for(private).put(&storage_key, data).await?;

        match self.db.insert_attachment(NewAttachment {
            name,
            name_original,
            group: group.map(|g| g.to_string()),
            private,
            creator_id,
            created_at: Utc::now(),
        }) {
            Ok(record) => Ok(record),
            // Lost a race against an identical concurrent upload; the blob
            // content is the same, so adopt the winner's row.
            Err(DatabaseError::Conflict(_)) => Ok(self
                .db
                .get_attachment_by_path(private, &storage_key)?
                .ok_or_else(|| {
                    DatabaseError::Conflict(format!("attachment '{storage_key}' vanished"))
                })?),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a new attachment from a file on disk. A file already inside
    /// the managed root for the target visibility is adopted in place
    /// (row only, no copy); anything else is read and ingested normally.
    pub async fn create_from_file(
        &self,
        path: &Path,
        group: Option<&str>,
        private: bool,
        creator_id: Option<u64>,
    ) -> Result<AttachmentRecord, AttachmentError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if let Some((adopted_group, name)) = self.managed_location(path, private)? {
            // The file may already be registered; re-ingesting it resolves
            // to the existing attachment.
            let storage_key = match adopted_group.as_deref() {
                Some(group) => format!("{group}/{name}"),
                None => name.clone(),
            };
            if let Some(existing) = self.db.get_attachment_by_path(private, &storage_key)? {
                return Ok(existing);
            }

            let metadata = tokio::fs::metadata(path).await?;
            let extension = extension_of(&name);
            let mime = mime_of(&name);
            self.config
                .size_limits
                .check(extension.as_deref(), &mime, metadata.len())?;
            self.config.group_rules.check(&UploadCheck {
                file_name: &name,
                extension: extension.as_deref(),
                mime: &mime,
                size: metadata.len(),
                group: adopted_group.as_deref(),
            })?;

            let record = match self.db.insert_attachment(NewAttachment {
                name: name.clone(),
                name_original: name,
                group: adopted_group,
                private,
                creator_id,
                created_at: Utc::now(),
            }) {
                Ok(record) => record,
                Err(DatabaseError::Conflict(_)) => self
                    .db
                    .get_attachment_by_path(private, &storage_key)?
                    .ok_or_else(|| {
                        DatabaseError::Conflict(format!("attachment '{storage_key}' vanished"))
                    })?,
                Err(e) => return Err(e.into()),
            };
            return Ok(record);
        }

        let data = tokio::fs::read(path).await?;
        self.create_from_bytes(data.into(), &file_name, group, private, creator_id)
            .await
    }

    /// Fetch a remote file and store it as a new attachment.
    ///
    /// Certificate verification is disabled on purpose: ingestion sources
    /// routinely sit behind self-signed or internal CAs, and the payload is
    /// content-addressed rather than trusted. The remote base name is kept
    /// only when it is strictly alphanumeric with a single extension;
    /// anything else is discarded and the content hash names the file.
    pub async fn create_from_url(
        &self,
        url: &str,
        group: Option<&str>,
        private: bool,
        creator_id: Option<u64>,
    ) -> Result<AttachmentRecord, AttachmentError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        let response = client.get(url).send().await?.error_for_status()?;

        let remote_name = url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .filter(|name| remote_name_regex().is_match(name))
            .map(|name| name.to_string())
            .unwrap_or_default();

        let data = response.bytes().await?;
        self.create_from_bytes(data, &remote_name, group, private, creator_id)
            .await
    }

    /// If `path` points inside the managed root for the visibility class,
    /// return its (group, name) within that root.
    fn managed_location(
        &self,
        path: &Path,
        private: bool,
    ) -> Result<Option<(Option<String>, String)>, AttachmentError> {
        let root = match std::fs::canonicalize(self.storage_root(private)) {
            Ok(root) => root,
            // Root not created yet, so nothing can be inside it
            Err(_) => return Ok(None),
        };
        let Ok(canonical) = std::fs::canonicalize(path) else {
            return Ok(None);
        };
        let Ok(rel) = canonical.strip_prefix(&root) else {
            return Ok(None);
        };

        let Some(name) = rel.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return Ok(None);
        };
        let group = rel
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_string_lossy().replace('\\', "/"));
        Ok(Some((group, name)))
    }

    // ========================================================================
    // Lookup, paths and URLs
    // ========================================================================

    pub fn get(&self, id: u64) -> Result<Option<AttachmentRecord>, AttachmentError> {
        Ok(self.db.get_attachment(id)?)
    }

    /// Resolve an attachment from its `{group?}/{name}` path within a
    /// visibility class.
    pub fn find_by_file_path(
        &self,
        private: bool,
        rel_path: &str,
    ) -> Result<Option<AttachmentRecord>, AttachmentError> {
        Ok(self.db.get_attachment_by_path(private, rel_path)?)
    }

    /// Path of the blob relative to the process working directory.
    pub fn relative_path(&self, record: &AttachmentRecord) -> String {
        format!(
            "{}/{}",
            self.storage_root(record.private).trim_end_matches('/'),
            record.storage_key()
        )
    }

    /// Absolute filesystem path of the blob.
    pub fn absolute_path(&self, record: &AttachmentRecord) -> Result<PathBuf, AttachmentError> {
        Ok(std::path::absolute(self.relative_path(record))?)
    }

    /// URL for an attachment. Public files are served directly under the
    /// configured base path; private files point at the obtain route, which
    /// gates access and hands out a download token.
    pub fn url(&self, record: &AttachmentRecord, absolute: bool) -> String {
        let path = if record.private {
            format!("/attachments/{}/url", record.id)
        } else {
            format!(
                "/{}/{}",
                self.config.url.base_path.trim_matches('/'),
                record.storage_key()
            )
        };
        if absolute {
            format!("{}{path}", self.config.absolute_url_base())
        } else {
            path
        }
    }

    // ========================================================================
    // Deletion and garbage collection
    // ========================================================================

    /// Delete an attachment: blob first (missing blob tolerated), then the
    /// row with its usage edges and indexes.
    pub async fn delete(&self, id: u64) -> Result<bool, AttachmentError> {
        let Some(record) = self.db.get_attachment(id)? else {
            return Ok(false);
        };
        if let Err(e) = self.store_for(record.private).delete(&record.storage_key()).await {
            tracing::warn!(id, key = %record.storage_key(), error = %e,
                "Failed to delete attachment blob");
        }
        Ok(self.db.delete_attachment(id)?)
    }

    /// Sweep unreferenced attachments older than the expiry window.
    ///
    /// An attachment is collected only when `created_at` is strictly before
    /// `now - expire_seconds` and it has no usage edges. The window doubles
    /// as the grace period for uploads whose usage edges are still being
    /// wired up, so no locking against in-flight saves is needed. With
    /// `only_metadata` the blobs are left in place and only rows are
    /// removed. Returns the number of rows deleted.
    pub async fn cleanup(
        &self,
        expire_seconds: Option<u64>,
        only_metadata: bool,
        batch_size: Option<usize>,
    ) -> Result<u64, AttachmentError> {
        let expire_seconds = expire_seconds.unwrap_or(self.config.gc.expire_seconds);
        let batch_size = batch_size.unwrap_or(self.config.gc.batch_size).max(1);
        let cutoff = Utc::now() - chrono::Duration::seconds(expire_seconds as i64);

        let mut removed = 0;
        loop {
            let orphans = self.db.list_expired_orphans(cutoff, batch_size)?;
            let exhausted = orphans.len() < batch_size;

            for record in &orphans {
                if !only_metadata {
                    if let Err(e) = self
                        .store_for(record.private)
                        .delete(&record.storage_key())
                        .await
                    {
                        tracing::warn!(id = record.id, key = %record.storage_key(), error = %e,
                            "Failed to delete orphan blob");
                    }
                }
                if self.db.delete_attachment(record.id)? {
                    removed += 1;
                }
            }

            if exhausted {
                break;
            }
        }

        tracing::debug!(removed, expire_seconds, "Attachment cleanup finished");
        Ok(removed)
    }
}

fn hashed_name(data: &[u8], extension: Option<&str>) -> String {
    let digest = hex::encode(digest::digest(&digest::SHA256, data));
    match extension {
        Some(ext) => format!("{}.{ext}", &digest[..HASH_NAME_LEN]),
        None => digest[..HASH_NAME_LEN].to_string(),
    }
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

fn mime_of(name: &str) -> String {
    mime_guess::from_path(name)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

fn group_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid group pattern"))
}

fn remote_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+\.[A-Za-z0-9]+$").expect("valid name pattern"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashed_name_keeps_extension() {
        let name = hashed_name(b"hello", Some("jpg"));
        assert_eq!(name.len(), HASH_NAME_LEN + 4);
        assert!(name.ends_with(".jpg"));
        assert_eq!(hashed_name(b"hello", None).len(), HASH_NAME_LEN);
        // Deterministic for identical content
        assert_eq!(hashed_name(b"hello", Some("jpg")), name);
        assert_ne!(hashed_name(b"other", Some("jpg")), name);
    }

    #[test]
    fn remote_names_are_filtered() {
        let re = remote_name_regex();
        assert!(re.is_match("photo_1.jpg"));
        assert!(re.is_match("a-b.png"));
        assert!(!re.is_match("no-extension"));
        assert!(!re.is_match("two.dots.jpg"));
        assert!(!re.is_match("space name.jpg"));
        assert!(!re.is_match("../escape.jpg"));
    }

    #[test]
    fn group_names_are_filtered() {
        let re = group_name_regex();
        assert!(re.is_match("avatars"));
        assert!(re.is_match("user_uploads-2"));
        assert!(!re.is_match("a/b"));
        assert!(!re.is_match(".."));
        assert!(!re.is_match(""));
    }
}

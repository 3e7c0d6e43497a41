use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tag used for usage edges created without an explicit field tag.
pub const DEFAULT_USAGE_TAG: &str = "default";

/// An attachment metadata record stored in redb.
///
/// The blob itself lives in the object store under
/// `{group?}/{name}` relative to the visibility root. `created_at` is
/// immutable; `name` only changes on format conversion (never
/// `name_original`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: u64,
    /// Stored file name, unique within (group, private).
    pub name: String,
    /// User-facing file name as originally supplied.
    pub name_original: String,
    /// Logical subdirectory/category.
    #[serde(default)]
    pub group: Option<String>,
    pub private: bool,
    #[serde(default)]
    pub creator_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl AttachmentRecord {
    /// Blob key relative to the visibility root: `{group?}/{name}`.
    pub fn storage_key(&self) -> String {
        match &self.group {
            Some(group) => format!("{group}/{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Key into the path index table.
    pub fn path_index_key(&self) -> String {
        path_index_key(self.private, self.group.as_deref(), &self.name)
    }

    /// MIME type guessed from the stored name.
    pub fn mime_type(&self) -> String {
        mime_guess::from_path(&self.name)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string())
    }

    /// Whether the guessed MIME type matches `image/*`.
    pub fn is_image(&self) -> bool {
        self.mime_type().starts_with("image/")
    }

    /// Lowercase file extension of the stored name, if any.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }
}

/// Build a path index key for a (visibility, group, name) triple.
pub fn path_index_key(private: bool, group: Option<&str>, name: &str) -> String {
    let vis = if private { "private" } else { "public" };
    match group {
        Some(group) => format!("{vis}:{group}/{name}"),
        None => format!("{vis}:{name}"),
    }
}

/// A reference edge from an owning entity to an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub owner_id: String,
    /// Stable type discriminator registered by the owner's persistence
    /// layer, not a live type name.
    pub owner_type: String,
    /// Disambiguates multiple attachment slots on one owner.
    #[serde(default = "default_tag")]
    pub tag: String,
}

fn default_tag() -> String {
    DEFAULT_USAGE_TAG.to_string()
}

/// Identifies an owning entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub owner_type: String,
    pub owner_id: String,
}

impl OwnerRef {
    pub fn new(owner_type: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            owner_type: owner_type.into(),
            owner_id: owner_id.into(),
        }
    }

    /// Key into the owner index table.
    pub fn index_key(&self) -> String {
        format!("{}:{}", self.owner_type, self.owner_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, group: Option<&str>, private: bool) -> AttachmentRecord {
        AttachmentRecord {
            id: 1,
            name: name.to_string(),
            name_original: "original.jpg".to_string(),
            group: group.map(|g| g.to_string()),
            private,
            creator_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn storage_key_includes_group() {
        assert_eq!(record("a.jpg", None, false).storage_key(), "a.jpg");
        assert_eq!(
            record("a.jpg", Some("avatars"), false).storage_key(),
            "avatars/a.jpg"
        );
    }

    #[test]
    fn path_index_key_separates_visibility() {
        let public = record("a.jpg", Some("avatars"), false);
        let private = record("a.jpg", Some("avatars"), true);
        assert_ne!(public.path_index_key(), private.path_index_key());
        assert_eq!(public.path_index_key(), "public:avatars/a.jpg");
    }

    #[test]
    fn mime_type_guessed_from_name() {
        assert_eq!(record("a.png", None, false).mime_type(), "image/png");
        assert!(record("a.png", None, false).is_image());
        assert!(!record("a.pdf", None, false).is_image());
        assert_eq!(record("a.PNG", None, false).extension().unwrap(), "png");
    }
}

//! Save-time usage reconciliation.
//!
//! Owning applications describe where attachment ids live on their entities
//! (dotted paths into a JSON snapshot). Around each save, the ledger diffs
//! the old and new snapshots and turns the changes into usage edge removals
//! and additions, keyed by a per-field tag. A separate pass discovers
//! attachments embedded in HTML bodies by their public URL.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::storage::models::OwnerRef;
use crate::storage::{Database, DatabaseError};

/// Tag for edges discovered by scanning HTML content rather than declared
/// fields. The whole tag set is replaced on every save.
pub const HTML_USAGE_TAG: &str = "html-parsed-attachment";

/// One attachment-bearing field on an owner, before and after a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentField {
    /// Usage tag, by convention the field's dotted path.
    pub tag: String,
    pub old: Option<u64>,
    pub new: Option<u64>,
}

impl AttachmentField {
    pub fn changed(&self) -> bool {
        self.old != self.new
    }
}

/// Applies field diffs and HTML scans to the usage edge tables.
pub struct UsageLedger {
    db: Database,
}

impl UsageLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Drop edges for attachment ids a save is about to overwrite. Runs
    /// before the owner is persisted so a failed save at worst orphans an
    /// attachment (recoverable) instead of leaking an edge to nowhere.
    pub fn reconcile_before_save(
        &self,
        owner: &OwnerRef,
        fields: &[AttachmentField],
    ) -> Result<u64, DatabaseError> {
        let mut removed = 0;
        for field in fields.iter().filter(|f| f.changed()) {
            if let Some(old_id) = field.old {
                removed += self.db.remove_usage_tagged(old_id, owner, &field.tag)?;
            }
        }
        Ok(removed)
    }

    /// Add edges for the attachment ids now referenced. With `only_changed`
    /// unchanged fields are skipped; otherwise every present id is
    /// re-asserted, which is free thanks to `add_usage` idempotence.
    pub fn reconcile_after_save(
        &self,
        owner: &OwnerRef,
        fields: &[AttachmentField],
        only_changed: bool,
    ) -> Result<u64, DatabaseError> {
        let mut added = 0;
        for field in fields {
            if only_changed && !field.changed() {
                continue;
            }
            if let Some(new_id) = field.new {
                if self.db.add_usage(new_id, owner, &field.tag)? {
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// Replace the owner's HTML-discovered edge set with whatever public
    /// attachments the given HTML currently embeds. Returns (added,
    /// removed) edge counts. Discovery is best-effort: URLs that do not
    /// resolve to a stored attachment are ignored.
    pub fn reconcile_html_usages(
        &self,
        owner: &OwnerRef,
        html: &str,
        url_base: &str,
    ) -> Result<(u64, u64), DatabaseError> {
        let mut found: Vec<u64> = Vec::new();
        for rel_path in scan_html_for_attachments(html, url_base) {
            if let Some(record) = self.db.get_attachment_by_path(false, &rel_path)? {
                if !found.contains(&record.id) {
                    found.push(record.id);
                }
            }
        }

        let mut removed = 0;
        for attachment_id in self.db.attachments_of(owner)? {
            if found.contains(&attachment_id) {
                continue;
            }
            let has_html_edge = self.db.usages_for(attachment_id)?.iter().any(|u| {
                u.tag == HTML_USAGE_TAG
                    && u.owner_id == owner.owner_id
                    && u.owner_type == owner.owner_type
            });
            if has_html_edge {
                removed += self
                    .db
                    .remove_usage_tagged(attachment_id, owner, HTML_USAGE_TAG)?;
            }
        }

        let mut added = 0;
        for attachment_id in &found {
            if self.db.add_usage(*attachment_id, owner, HTML_USAGE_TAG)? {
                added += 1;
            }
        }
        Ok((added, removed))
    }
}

/// Diff two owner snapshots over the given dotted paths. The path doubles
/// as the field's usage tag.
pub fn collect_fields(old: Option<&Value>, new: &Value, paths: &[&str]) -> Vec<AttachmentField> {
    paths
        .iter()
        .map(|path| AttachmentField {
            tag: (*path).to_string(),
            old: old.and_then(|v| get_nested(v, path)).and_then(value_id),
            new: get_nested(new, path).and_then(value_id),
        })
        .collect()
}

fn value_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Resolve a dotted path against a JSON value. Keys that literally contain
/// dots win over traversal: at each level the exact remaining path is tried
/// as a key first, then the longest literal prefix ending at a dot.
pub fn get_nested<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let obj = value.as_object()?;
    if let Some(v) = obj.get(path) {
        return Some(v);
    }
    let mut end = path.len();
    while let Some(pos) = path[..end].rfind('.') {
        if let Some(v) = obj.get(&path[..pos]) {
            return get_nested(v, &path[pos + 1..]);
        }
        end = pos;
    }
    None
}

fn img_src_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<img\s[^>]*src\s*=\s*["']([^"']+)["']"#).expect("valid img src pattern")
    })
}

/// Extract public attachment paths (`{group?}/{name}`) from `<img src>`
/// URLs under the given base. Query strings and fragments are stripped.
/// Non-matching URLs are skipped silently.
pub fn scan_html_for_attachments(html: &str, url_base: &str) -> Vec<String> {
    let base = url_base.trim_end_matches('/');
    let mut paths = Vec::new();
    for cap in img_src_regex().captures_iter(html) {
        let src = &cap[1];
        let Some(rest) = src.strip_prefix(base) else {
            continue;
        };
        let Some(rest) = rest.strip_prefix('/') else {
            continue;
        };
        let rel = rest
            .split(['?', '#'])
            .next()
            .unwrap_or(rest)
            .trim_end_matches('/');
        if !rel.is_empty() && !paths.contains(&rel.to_string()) {
            paths.push(rel.to_string());
        }
    }
    paths
}

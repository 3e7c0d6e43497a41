//! Upload validation: size-limit parsing, per-extension/MIME limits, and a
//! typed registry of per-group validation rules built at config load.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("File size {size} exceeds limit of {limit} bytes")]
    SizeExceeded { size: u64, limit: u64 },
    #[error("Extension '{0}' is not permitted")]
    ExtensionNotPermitted(String),
    #[error("MIME type '{0}' is not permitted")]
    MimeNotPermitted(String),
    #[error("Invalid size string: '{0}'")]
    InvalidSize(String),
    #[error("Unknown validation rule: '{0}'")]
    UnknownRule(String),
    #[error("Invalid rule parameters for '{rule}': {message}")]
    InvalidRuleParams { rule: String, message: String },
}

/// Parse a human size string into bytes. Integer with an optional
/// power-of-1024 suffix (`K/M/G/T/P/E/Z/Y`, case-insensitive, optional
/// trailing `B`). `Z` and `Y` overflow u64 and are rejected.
pub fn parse_size(input: &str) -> Result<u64, ValidationError> {
    let s = input.trim();
    let invalid = || ValidationError::InvalidSize(input.to_string());

    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(digits_end);
    if digits.is_empty() {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let suffix = suffix.trim().to_ascii_uppercase();
    let suffix = suffix.strip_suffix('B').unwrap_or(&suffix);
    let power = match suffix {
        "" => 0u32,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        "E" => 6,
        "Z" => 7,
        "Y" => 8,
        _ => return Err(invalid()),
    };

    1024u64
        .checked_pow(power)
        .and_then(|mult| value.checked_mul(mult))
        .ok_or_else(invalid)
}

/// Render a byte count with the largest exact power-of-1024 suffix, for
/// error messages.
pub fn format_size(bytes: u64) -> String {
    const SUFFIXES: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    let mut value = bytes;
    let mut idx = 0;
    while idx + 1 < SUFFIXES.len() && value >= 1024 && value % 1024 == 0 {
        value /= 1024;
        idx += 1;
    }
    format!("{value}{}", SUFFIXES[idx])
}

/// Per-extension / per-MIME-pattern upload size limits.
///
/// Lookup is most-specific-match-wins: exact extension, then exact MIME,
/// then `type/*` wildcard, then `*`.
#[derive(Debug, Clone, Default)]
pub struct SizeLimits {
    limits: HashMap<String, u64>,
}

impl SizeLimits {
    /// Parse a `"jpg=5M,image/*=10M,*=20M"` style spec.
    pub fn parse(spec: &str) -> Result<Self, ValidationError> {
        let mut limits = HashMap::new();
        for pair in spec.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ValidationError::InvalidSize(pair.to_string()))?;
            limits.insert(key.trim().to_lowercase(), parse_size(value)?);
        }
        Ok(Self { limits })
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Find the limit for a file, or None when no pattern applies.
    pub fn limit_for(&self, extension: Option<&str>, mime: &str) -> Option<u64> {
        if let Some(ext) = extension {
            if let Some(limit) = self.limits.get(&ext.to_lowercase()) {
                return Some(*limit);
            }
        }
        let mime = mime.to_lowercase();
        if let Some(limit) = self.limits.get(&mime) {
            return Some(*limit);
        }
        if let Some(primary) = mime.split('/').next() {
            if let Some(limit) = self.limits.get(&format!("{primary}/*")) {
                return Some(*limit);
            }
        }
        self.limits.get("*").copied()
    }

    /// Check a file size against the applicable limit, if any.
    pub fn check(
        &self,
        extension: Option<&str>,
        mime: &str,
        size: u64,
    ) -> Result<(), ValidationError> {
        match self.limit_for(extension, mime) {
            Some(limit) if size > limit => Err(ValidationError::SizeExceeded { size, limit }),
            _ => Ok(()),
        }
    }
}

/// What a rule gets to inspect about an inbound file.
#[derive(Debug, Clone, Copy)]
pub struct UploadCheck<'a> {
    pub file_name: &'a str,
    pub extension: Option<&'a str>,
    pub mime: &'a str,
    pub size: u64,
    pub group: Option<&'a str>,
}

pub trait UploadRule: Send + Sync {
    fn check(&self, upload: &UploadCheck<'_>) -> Result<(), ValidationError>;
}

/// Permits only the listed lowercase extensions.
pub struct ExtensionRule {
    extensions: Vec<String>,
}

impl ExtensionRule {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(extensions: I) -> Self {
        Self {
            extensions: extensions.into_iter().map(|e| e.into().to_lowercase()).collect(),
        }
    }
}

impl UploadRule for ExtensionRule {
    fn check(&self, upload: &UploadCheck<'_>) -> Result<(), ValidationError> {
        match upload.extension {
            Some(ext) if self.extensions.iter().any(|e| e == &ext.to_lowercase()) => Ok(()),
            other => Err(ValidationError::ExtensionNotPermitted(
                other.unwrap_or("").to_string(),
            )),
        }
    }
}

/// Caps the file size.
pub struct SizeRule {
    max: u64,
}

impl SizeRule {
    pub fn new(max: u64) -> Self {
        Self { max }
    }
}

impl UploadRule for SizeRule {
    fn check(&self, upload: &UploadCheck<'_>) -> Result<(), ValidationError> {
        if upload.size > self.max {
            return Err(ValidationError::SizeExceeded {
                size: upload.size,
                limit: self.max,
            });
        }
        Ok(())
    }
}

/// Permits MIME types by exact value or `type/*` wildcard.
pub struct MimeRule {
    patterns: Vec<String>,
}

impl MimeRule {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(patterns: I) -> Self {
        Self {
            patterns: patterns.into_iter().map(|p| p.into().to_lowercase()).collect(),
        }
    }

    fn matches(pattern: &str, mime: &str) -> bool {
        if let Some(primary) = pattern.strip_suffix("/*") {
            mime.split('/').next() == Some(primary)
        } else {
            pattern == mime
        }
    }
}

impl UploadRule for MimeRule {
    fn check(&self, upload: &UploadCheck<'_>) -> Result<(), ValidationError> {
        let mime = upload.mime.to_lowercase();
        if self.patterns.iter().any(|p| Self::matches(p, &mime)) {
            Ok(())
        } else {
            Err(ValidationError::MimeNotPermitted(upload.mime.to_string()))
        }
    }
}

type RuleConstructor =
    Box<dyn Fn(&serde_json::Value) -> Result<Arc<dyn UploadRule>, ValidationError> + Send + Sync>;

/// Maps rule identifiers to constructor closures, resolved once at
/// configuration load rather than by reflection at runtime.
pub struct RuleRegistry {
    constructors: HashMap<String, RuleConstructor>,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register("extension", |params| {
            let extensions = string_list(params, "ext", "extension")?;
            Ok(Arc::new(ExtensionRule::new(extensions)) as Arc<dyn UploadRule>)
        });
        registry.register("size", |params| {
            let max = params
                .get("max")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ValidationError::InvalidRuleParams {
                    rule: "size".to_string(),
                    message: "missing 'max'".to_string(),
                })?;
            Ok(Arc::new(SizeRule::new(parse_size(max)?)) as Arc<dyn UploadRule>)
        });
        registry.register("mime", |params| {
            let patterns = string_list(params, "types", "mime")?;
            Ok(Arc::new(MimeRule::new(patterns)) as Arc<dyn UploadRule>)
        });
        registry
    }
}

impl RuleRegistry {
    pub fn register<F>(&mut self, id: &str, constructor: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn UploadRule>, ValidationError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(id.to_string(), Box::new(constructor));
    }

    pub fn build(
        &self,
        id: &str,
        params: &serde_json::Value,
    ) -> Result<Arc<dyn UploadRule>, ValidationError> {
        let constructor = self
            .constructors
            .get(id)
            .ok_or_else(|| ValidationError::UnknownRule(id.to_string()))?;
        constructor(params)
    }

    /// Resolve per-group rule sets from a config JSON object of the form
    /// `{"avatars": [{"rule": "extension", "ext": ["jpg"]}, ...], ...}`.
    pub fn build_group_rules(
        &self,
        config: &serde_json::Value,
    ) -> Result<GroupRules, ValidationError> {
        let mut groups = HashMap::new();
        let object = config
            .as_object()
            .ok_or_else(|| ValidationError::InvalidRuleParams {
                rule: "<group rules>".to_string(),
                message: "expected a JSON object keyed by group".to_string(),
            })?;
        for (group, specs) in object {
            let specs = specs
                .as_array()
                .ok_or_else(|| ValidationError::InvalidRuleParams {
                    rule: group.clone(),
                    message: "expected an array of rule objects".to_string(),
                })?;
            let mut rules = Vec::with_capacity(specs.len());
            for spec in specs {
                let id = spec
                    .get("rule")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ValidationError::InvalidRuleParams {
                        rule: group.clone(),
                        message: "rule object missing 'rule' id".to_string(),
                    })?;
                rules.push(self.build(id, spec)?);
            }
            groups.insert(group.clone(), rules);
        }
        Ok(GroupRules { groups })
    }
}

fn string_list(
    params: &serde_json::Value,
    key: &str,
    rule: &str,
) -> Result<Vec<String>, ValidationError> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .ok_or_else(|| ValidationError::InvalidRuleParams {
            rule: rule.to_string(),
            message: format!("missing '{key}' list"),
        })
}

/// Validation rule sets keyed by attachment group.
#[derive(Default, Clone)]
pub struct GroupRules {
    groups: HashMap<String, Vec<Arc<dyn UploadRule>>>,
}

impl GroupRules {
    /// Run every rule registered for the upload's group. Groups without
    /// rules accept everything.
    pub fn check(&self, upload: &UploadCheck<'_>) -> Result<(), ValidationError> {
        let Some(group) = upload.group else {
            return Ok(());
        };
        if let Some(rules) = self.groups.get(group) {
            for rule in rules {
                rule.check(upload)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload<'a>(name: &'a str, ext: Option<&'a str>, mime: &'a str, size: u64) -> UploadCheck<'a> {
        UploadCheck {
            file_name: name,
            extension: ext,
            mime,
            size,
            group: Some("docs"),
        }
    }

    #[test]
    fn parse_size_suffix_table() {
        assert_eq!(parse_size("20").unwrap(), 20);
        assert_eq!(parse_size("20B").unwrap(), 20);
        assert_eq!(parse_size("20MB").unwrap(), 20 * 1024 * 1024);
        assert_eq!(parse_size("20m").unwrap(), 20 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("3kb").unwrap(), 3 * 1024);
        assert_eq!(parse_size("2E").unwrap(), 2 * 1024u64.pow(6));
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("MB").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("-5M").is_err());
        // 1 ZB does not fit in u64
        assert!(parse_size("1Z").is_err());
    }

    #[test]
    fn format_size_round_values() {
        assert_eq!(format_size(20 * 1024 * 1024), "20MB");
        assert_eq!(format_size(1500), "1500B");
    }

    #[test]
    fn size_limits_most_specific_wins() {
        let limits = SizeLimits::parse("jpg=1M,image/*=2M,image/png=3M,*=4M").unwrap();
        assert_eq!(limits.limit_for(Some("jpg"), "image/jpeg"), Some(1024 * 1024));
        assert_eq!(
            limits.limit_for(Some("png"), "image/png"),
            Some(3 * 1024 * 1024)
        );
        assert_eq!(
            limits.limit_for(Some("gif"), "image/gif"),
            Some(2 * 1024 * 1024)
        );
        assert_eq!(
            limits.limit_for(Some("pdf"), "application/pdf"),
            Some(4 * 1024 * 1024)
        );
    }

    #[test]
    fn size_limits_check_enforces() {
        let limits = SizeLimits::parse("*=1K").unwrap();
        assert!(limits.check(Some("txt"), "text/plain", 1024).is_ok());
        assert!(limits.check(Some("txt"), "text/plain", 1025).is_err());
    }

    #[test]
    fn extension_rule() {
        let rule = ExtensionRule::new(["jpg", "png"]);
        assert!(rule.check(&upload("a.JPG", Some("jpg"), "image/jpeg", 1)).is_ok());
        assert!(rule.check(&upload("a.gif", Some("gif"), "image/gif", 1)).is_err());
        assert!(rule.check(&upload("a", None, "image/gif", 1)).is_err());
    }

    #[test]
    fn mime_rule_wildcards() {
        let rule = MimeRule::new(["image/*", "application/pdf"]);
        assert!(rule.check(&upload("a.png", Some("png"), "image/png", 1)).is_ok());
        assert!(rule.check(&upload("a.pdf", Some("pdf"), "application/pdf", 1)).is_ok());
        assert!(rule.check(&upload("a.txt", Some("txt"), "text/plain", 1)).is_err());
    }

    #[test]
    fn registry_builds_group_rules_from_config() {
        let registry = RuleRegistry::default();
        let config = serde_json::json!({
            "avatars": [
                {"rule": "extension", "ext": ["jpg", "png"]},
                {"rule": "size", "max": "1M"}
            ]
        });
        let rules = registry.build_group_rules(&config).unwrap();

        let ok = UploadCheck {
            file_name: "a.png",
            extension: Some("png"),
            mime: "image/png",
            size: 500,
            group: Some("avatars"),
        };
        assert!(rules.check(&ok).is_ok());

        let too_big = UploadCheck { size: 2 * 1024 * 1024, ..ok };
        assert!(rules.check(&too_big).is_err());

        let wrong_ext = UploadCheck {
            file_name: "a.gif",
            extension: Some("gif"),
            mime: "image/gif",
            ..ok
        };
        assert!(rules.check(&wrong_ext).is_err());

        // Unconfigured groups accept everything
        let other_group = UploadCheck { group: Some("other"), ..wrong_ext };
        assert!(rules.check(&other_group).is_ok());
    }

    #[test]
    fn registry_rejects_unknown_rule() {
        let registry = RuleRegistry::default();
        let config = serde_json::json!({"g": [{"rule": "nope"}]});
        assert!(matches!(
            registry.build_group_rules(&config),
            Err(ValidationError::UnknownRule(_))
        ));
    }
}

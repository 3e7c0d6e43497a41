use thiserror::Error;

use crate::validation::{GroupRules, RuleRegistry, SizeLimits};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub data_dir: String,
    pub storage: StorageConfig,
    pub url: UrlConfig,
    pub gc: GcConfig,
    pub token: TokenConfig,
    /// Upper bound for derivative width/height.
    pub max_image_dimension: u32,
    /// Hard cap on multipart upload size in bytes.
    pub max_upload_size: u64,
    /// Per-extension / per-MIME upload size limits.
    pub size_limits: SizeLimits,
    /// Per-group validation rule sets.
    pub group_rules: GroupRules,
    /// Enables dangerous admin operations. Must never be true in production.
    pub test_mode: bool,
}

/// Blob storage backend selector. Each visibility class picks its own
/// backend; local disk is the only one shipped, others plug in through the
/// `ObjectStore` seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    #[default]
    Local,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(StorageBackend::Local),
            other => Err(format!("unknown storage backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Backend for public attachments.
    pub public_backend: StorageBackend,
    /// Root directory for public attachments.
    pub public_path: String,
    /// Backend for private attachments.
    pub private_backend: StorageBackend,
    /// Root directory for private attachments.
    pub private_path: String,
    /// Derivative cache root, relative to the public storage root.
    pub image_cache_path: String,
}

#[derive(Debug, Clone)]
pub struct UrlConfig {
    /// Scheme override for absolute URLs; falls back to "https".
    pub scheme: Option<String>,
    /// Host override for absolute URLs.
    pub host: Option<String>,
    /// Path prefix under which public attachments are served.
    pub base_path: String,
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Orphans younger than this are never collected. The window doubles as
    /// the grace period for callers still wiring up usage edges after an
    /// upload.
    pub expire_seconds: u64,
    /// Background sweep interval; 0 disables the background task.
    pub interval_seconds: u64,
    /// Page size for orphan scans.
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub ttl_seconds: u64,
    /// Length of the random portion of a token. The full token is this
    /// plus 64 digest characters.
    pub length: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            public_backend: StorageBackend::Local,
            public_path: "./storage/public".to_string(),
            private_backend: StorageBackend::Local,
            private_path: "./storage/private".to_string(),
            image_cache_path: "cache/images".to_string(),
        }
    }
}

impl Default for UrlConfig {
    fn default() -> Self {
        Self {
            scheme: None,
            host: None,
            base_path: "storage/attachments".to_string(),
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            expire_seconds: 10800,
            interval_seconds: 0,
            batch_size: 200,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            length: 60,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            data_dir: "./data".to_string(),
            storage: StorageConfig::default(),
            url: UrlConfig::default(),
            gc: GcConfig::default(),
            token: TokenConfig::default(),
            max_image_dimension: 3000,
            max_upload_size: 50 * 1024 * 1024,
            size_limits: SizeLimits::default(),
            group_rules: GroupRules::default(),
            test_mode: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_backend(name: &str) -> Result<StorageBackend, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| ConfigError::ValidationError(format!("{name}: {e}"))),
        Err(_) => Ok(StorageBackend::default()),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| defaults.bind_address.clone());
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| defaults.data_dir.clone());

        let storage = StorageConfig {
            public_backend: env_backend("PUBLIC_STORAGE_BACKEND")?,
            public_path: std::env::var("PUBLIC_STORAGE_PATH")
                .unwrap_or_else(|_| defaults.storage.public_path.clone()),
            private_backend: env_backend("PRIVATE_STORAGE_BACKEND")?,
            private_path: std::env::var("PRIVATE_STORAGE_PATH")
                .unwrap_or_else(|_| defaults.storage.private_path.clone()),
            image_cache_path: std::env::var("IMAGE_CACHE_PATH")
                .unwrap_or_else(|_| defaults.storage.image_cache_path.clone()),
        };

        let url = UrlConfig {
            scheme: std::env::var("URL_SCHEME").ok(),
            host: std::env::var("URL_HOST").ok(),
            base_path: std::env::var("URL_BASE_PATH")
                .unwrap_or_else(|_| defaults.url.base_path.clone()),
        };

        let gc = GcConfig {
            expire_seconds: env_parse("ATTACHMENT_EXPIRE_SECONDS", defaults.gc.expire_seconds),
            interval_seconds: env_parse("GC_INTERVAL_SECONDS", defaults.gc.interval_seconds),
            batch_size: env_parse("GC_BATCH_SIZE", defaults.gc.batch_size),
        };

        let token = TokenConfig {
            ttl_seconds: env_parse("TOKEN_TTL_SECONDS", defaults.token.ttl_seconds),
            length: env_parse("TOKEN_LENGTH", defaults.token.length),
        };

        let max_image_dimension = env_parse("MAX_IMAGE_DIMENSION", defaults.max_image_dimension);
        let max_upload_size = env_parse("MAX_UPLOAD_SIZE", defaults.max_upload_size);

        let size_limits = match std::env::var("SIZE_LIMITS") {
            Ok(spec) => SizeLimits::parse(&spec)
                .map_err(|e| ConfigError::ValidationError(format!("SIZE_LIMITS: {e}")))?,
            Err(_) => SizeLimits::default(),
        };

        let group_rules = match std::env::var("GROUP_RULES") {
            Ok(json) => {
                let value: serde_json::Value = serde_json::from_str(&json)
                    .map_err(|e| ConfigError::ValidationError(format!("GROUP_RULES: {e}")))?;
                RuleRegistry::default()
                    .build_group_rules(&value)
                    .map_err(|e| ConfigError::ValidationError(format!("GROUP_RULES: {e}")))?
            }
            Err(_) => GroupRules::default(),
        };

        let test_mode = std::env::var("TEST_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let config = Config {
            bind_address,
            data_dir,
            storage,
            url,
            gc,
            token,
            max_image_dimension,
            max_upload_size,
            size_limits,
            group_rules,
            test_mode,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.public_path.is_empty() || self.storage.private_path.is_empty() {
            return Err(ConfigError::ValidationError(
                "storage paths cannot be empty".to_string(),
            ));
        }
        if self.storage.image_cache_path.is_empty()
            || self.storage.image_cache_path.starts_with('/')
        {
            return Err(ConfigError::ValidationError(
                "IMAGE_CACHE_PATH must be a non-empty relative path".to_string(),
            ));
        }
        if self.token.length < 8 {
            return Err(ConfigError::ValidationError(
                "TOKEN_LENGTH must be at least 8".to_string(),
            ));
        }
        if self.max_image_dimension == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_IMAGE_DIMENSION must be greater than 0".to_string(),
            ));
        }
        if self.gc.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "GC_BATCH_SIZE must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Base URL for absolute attachment URLs.
    pub fn absolute_url_base(&self) -> String {
        let scheme = self.url.scheme.as_deref().unwrap_or("https");
        let host = self.url.host.as_deref().unwrap_or("localhost");
        format!("{scheme}://{host}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_backend_parses_known_names() {
        assert_eq!("local".parse::<StorageBackend>(), Ok(StorageBackend::Local));
        assert_eq!("Local".parse::<StorageBackend>(), Ok(StorageBackend::Local));
        assert!("s3".parse::<StorageBackend>().is_err());
        assert!("".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn storage_backend_defaults_to_local() {
        assert_eq!(StorageBackend::default(), StorageBackend::Local);
        assert_eq!(StorageConfig::default().public_backend, StorageBackend::Local);
        assert_eq!(StorageConfig::default().private_backend, StorageBackend::Local);
    }
}

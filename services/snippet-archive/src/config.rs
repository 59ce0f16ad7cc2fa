use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating configuration
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the snippet archive service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Upload ingestion configuration
    #[serde(default)]
    pub uploads: UploadConfig,
    /// Upload orchestrator (HTTP client) configuration
    #[serde(default)]
    pub client: ClientConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
///
/// The credential fields, region, bucket and signature version have no
/// defaults. They deserialize to empty strings when absent so that
/// [`S3Config::validate`] can name the missing key.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS access key id
    #[serde(default)]
    pub access_key_id: String,
    /// AWS secret access key
    #[serde(default)]
    pub secret_access_key: String,
    /// AWS region
    #[serde(default)]
    pub region: String,
    /// S3 bucket name for snippet images
    #[serde(default)]
    pub bucket: String,
    /// Request signing scheme, only "v4" is supported
    #[serde(default)]
    pub signature_version: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Base URL objects are publicly served from (CDN, website endpoint)
    pub public_base_url: Option<String>,
    /// Upper bound for a whole S3 operation in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// TCP connect timeout in seconds
    #[serde(default = "default_s3_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Request body limit for the upload endpoint
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// How object keys are derived for uploaded files
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// `snippets/{yyyy}/{mm}/{dd}/{uuid}.{ext}`
    #[default]
    Generated,
    /// The uploaded file's own name, sanitized
    FileName,
}

/// Multipart ingestion configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Directory file parts are spooled to (OS temp dir when unset)
    pub spool_dir: Option<PathBuf>,
    /// File parts up to this size stay in memory
    #[serde(default)]
    pub spool_threshold_bytes: usize,
    /// Largest accepted file part
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    /// Accepted file content types (empty = all)
    #[serde(default)]
    pub allowed_content_types: Vec<String>,
    /// Object key derivation
    #[serde(default)]
    pub key_strategy: KeyStrategy,
}

/// Configuration for [`crate::client::SnippetClient`]
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base URL the upload and record endpoints are served under
    pub api_base_url: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_client_timeout_secs")]
    pub timeout_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "snippet-archive".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_s3_connect_timeout_secs() -> u64 {
    5
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    12 * 1024 * 1024
}

fn default_max_file_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_client_timeout_secs() -> u64 {
    30
}

/// Legacy environment variable names mapped to their configuration keys.
/// They act as defaults below files and `SNIPPETS__*`.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("PCS_AWS_ACCESS_KEY", "s3.access_key_id"),
    ("PCS_AWS_SECRET_KEY", "s3.secret_access_key"),
    ("PCS_AWS_REGION", "s3.region"),
    ("PCS_AWS_BUCKET_NAME", "s3.bucket"),
    ("DATABASE_URL", "database.url"),
    ("NEXT_PUBLIC_API_URL", "client.api_base_url"),
];

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            // Start with default values
            .set_default("service.name", "snippet-archive")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?;

        for (var, key) in LEGACY_ENV {
            if let Ok(value) = std::env::var(var) {
                builder = builder.set_default(*key, value)?;
            }
        }

        let config = builder
            // Add config file if present
            .add_source(config::File::with_name("config/snippets").required(false))
            .add_source(config::File::with_name("/etc/snippets/snippets").required(false))
            // Override with environment variables
            // SNIPPETS__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("SNIPPETS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-section invariants that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.s3.validate()?;
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("database.url".to_string()));
        }
        if self.uploads.max_file_bytes > self.api.max_upload_bytes {
            return Err(ConfigError::InvalidValue {
                key: "uploads.max_file_bytes".to_string(),
                message: "must not exceed api.max_upload_bytes".to_string(),
            });
        }
        Ok(())
    }
}

impl DatabaseConfig {
    /// How long to wait for a pooled connection
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// How long an unused connection stays in the pool
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl S3Config {
    /// Fail fast when any required option is absent or unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("s3.access_key_id", &self.access_key_id),
            ("s3.secret_access_key", &self.secret_access_key),
            ("s3.region", &self.region),
            ("s3.bucket", &self.bucket),
            ("s3.signature_version", &self.signature_version),
        ];

        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingRequired(key.to_string()));
            }
        }

        if !self.signature_version.eq_ignore_ascii_case("v4") {
            return Err(ConfigError::InvalidValue {
                key: "s3.signature_version".to_string(),
                message: format!("unsupported '{}', expected v4", self.signature_version),
            });
        }

        if self.part_size_bytes < 5 * 1024 * 1024 {
            return Err(ConfigError::InvalidValue {
                key: "s3.part_size_bytes".to_string(),
                message: "S3 parts must be at least 5MB".to_string(),
            });
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            spool_dir: None,
            spool_threshold_bytes: 0,
            max_file_bytes: default_max_file_bytes(),
            allowed_content_types: Vec::new(),
            key_strategy: KeyStrategy::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            timeout_secs: default_client_timeout_secs(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn s3_config() -> S3Config {
        S3Config {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            region: "eu-west-1".to_string(),
            bucket: "snippets".to_string(),
            signature_version: "v4".to_string(),
            endpoint_url: None,
            force_path_style: false,
            public_base_url: None,
            request_timeout_secs: 30,
            connect_timeout_secs: 5,
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_file_bytes(), 10 * 1024 * 1024);
        assert_eq!(default_request_timeout_secs(), 30);
        assert_eq!(UploadConfig::default().key_strategy, KeyStrategy::Generated);
    }

    #[test]
    fn test_complete_s3_config_is_valid() {
        assert_eq!(s3_config().validate(), Ok(()));
    }

    #[test]
    fn test_each_required_s3_option_fails_fast() {
        let cases: [(&str, fn(&mut S3Config)); 5] = [
            ("s3.access_key_id", |c| c.access_key_id.clear()),
            ("s3.secret_access_key", |c| c.secret_access_key.clear()),
            ("s3.region", |c| c.region = "  ".to_string()),
            ("s3.bucket", |c| c.bucket.clear()),
            ("s3.signature_version", |c| c.signature_version.clear()),
        ];

        for (key, clear) in cases {
            let mut config = s3_config();
            clear(&mut config);
            assert_eq!(
                config.validate(),
                Err(ConfigError::MissingRequired(key.to_string()))
            );
        }
    }

    #[test]
    fn test_signature_version_must_be_v4() {
        let mut config = s3_config();
        config.signature_version = "v2".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "s3.signature_version"
        ));

        config.signature_version = "V4".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_database_timeouts_from_seconds() {
        let database: DatabaseConfig =
            serde_json::from_str(r#"{"url": "postgres://localhost/snippets", "idle_timeout_secs": 60}"#)
                .unwrap();
        assert_eq!(database.acquire_timeout(), Duration::from_secs(30));
        assert_eq!(database.idle_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_key_strategy_deserializes_snake_case() {
        let uploads: UploadConfig =
            serde_json::from_str(r#"{"key_strategy": "file_name"}"#).unwrap();
        assert_eq!(uploads.key_strategy, KeyStrategy::FileName);
        assert_eq!(uploads.max_file_bytes, default_max_file_bytes());
    }
}

//! Configuration management for the security gateway

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use secrecy::{Secret, ExposeSecret};

pub mod loader;
pub mod validation;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub rate_limit: RateLimitSettings,
    pub cors: CorsConfig,
    pub csrf: CsrfConfig,
    pub identity: IdentityConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    pub logging: LoggingConfig,
}

/// Deployment environment; decides whether error messages are redacted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server port
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Server host
    #[serde(default = "default_server_host")]
    pub host: String,

    /// Maximum request body size in MB (0 = unlimited)
    #[serde(default = "default_max_body_size")]
    pub max_body_size_mb: usize,

    /// Deployment environment
    #[serde(default)]
    pub environment: Environment,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Whether to enable rate limiting
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum requests per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Client keys that skip the counter entirely
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxies: Vec<String>,

    /// Token accepted in `X-Rate-Limit-Bypass` (secured)
    #[serde(
        default,
        serialize_with = "serialize_optional_secret",
        deserialize_with = "deserialize_optional_secret"
    )]
    pub bypass_token: Option<Secret<String>>,

    /// How often expired records are purged, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,

    #[serde(default = "default_allowed_headers")]
    pub allowed_headers: Vec<String>,

    #[serde(default = "default_exposed_headers")]
    pub exposed_headers: Vec<String>,

    #[serde(default = "default_true")]
    pub allow_credentials: bool,

    /// Preflight cache lifetime in seconds
    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

/// CSRF configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Server-held signing secret (secured)
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret")]
    pub secret: Secret<String>,

    #[serde(default = "default_csrf_cookie")]
    pub cookie_name: String,

    #[serde(default = "default_csrf_header")]
    pub header_name: String,

    /// Token lifetime in seconds; 0 (the default) means tokens never expire
    #[serde(default = "default_csrf_ttl")]
    pub token_ttl_secs: u64,
}

/// External identity service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Base URL of the hosted auth platform
    pub url: String,

    /// Platform API key sent as `apikey` (secured)
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret")]
    pub api_key: Secret<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Paths containing this prefix require a bearer token
    #[serde(default = "default_protected_prefix")]
    pub protected_path_prefix: String,
}

/// Input validation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Maximum length of a single string field
    #[serde(default = "default_max_string_length")]
    pub max_string_length: usize,

    /// Content types accepted for uploads
    #[serde(default = "default_allowed_file_types")]
    pub allowed_file_types: Vec<String>,

    /// Maximum upload size in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_string_length: default_max_string_length(),
            allowed_file_types: default_allowed_file_types(),
            max_file_size_bytes: default_max_file_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl ServerConfig {
    /// Body limit in bytes, saturating at `usize::MAX`
    pub fn max_body_size_bytes(&self) -> usize {
        self.max_body_size_mb.saturating_mul(1024 * 1024)
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_server_port() -> u16 { 8080 }
fn default_server_host() -> String { "0.0.0.0".to_string() }
fn default_max_body_size() -> usize { 10 } // 10 MB
fn default_max_requests() -> u64 { 100 }
fn default_window_secs() -> u64 { 15 * 60 }
fn default_trusted_proxies() -> Vec<String> { vec!["127.0.0.1".to_string()] }
fn default_cleanup_interval() -> u64 { 60 }
fn default_allowed_origins() -> Vec<String> { vec!["http://localhost:5173".to_string()] }
fn default_allowed_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "OPTIONS"].iter().map(|s| s.to_string()).collect()
}
fn default_allowed_headers() -> Vec<String> {
    ["Content-Type", "Authorization", "X-CSRF-Token"].iter().map(|s| s.to_string()).collect()
}
fn default_exposed_headers() -> Vec<String> {
    ["Content-Range", "X-Content-Range"].iter().map(|s| s.to_string()).collect()
}
fn default_cors_max_age() -> u64 { 86400 }
fn default_csrf_cookie() -> String { "csrf-token".to_string() }
fn default_csrf_header() -> String { "X-CSRF-Token".to_string() }
fn default_csrf_ttl() -> u64 { 0 }
fn default_timeout() -> u64 { 10 }
fn default_protected_prefix() -> String { "/api/".to_string() }
fn default_max_string_length() -> usize { 1000 }
fn default_allowed_file_types() -> Vec<String> {
    ["image/jpeg", "image/png", "image/gif"].iter().map(|s| s.to_string()).collect()
}
fn default_max_file_size() -> u64 { 5 * 1024 * 1024 } // 5 MB
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::error::Result<Self> {
        let config = loader::load_config(path)?;
        validation::validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> crate::error::Result<Self> {
        let config = loader::load_config_with_env(path)?;
        validation::validate_config(&config)?;
        Ok(config)
    }

    /// Validate this configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validation::validate_config(self)
    }

    /// Create default configuration
    pub fn default_config() -> Self {
        Self {
            server: ServerConfig {
                port: default_server_port(),
                host: default_server_host(),
                max_body_size_mb: default_max_body_size(),
                environment: Environment::default(),
            },
            rate_limit: RateLimitSettings {
                enabled: true,
                max_requests: default_max_requests(),
                window_secs: default_window_secs(),
                trusted_proxies: default_trusted_proxies(),
                bypass_token: std::env::var("RATE_LIMIT_BYPASS_TOKEN").ok().map(Secret::new),
                cleanup_interval_secs: default_cleanup_interval(),
            },
            cors: CorsConfig {
                allowed_origins: default_allowed_origins(),
                allowed_methods: default_allowed_methods(),
                allowed_headers: default_allowed_headers(),
                exposed_headers: default_exposed_headers(),
                allow_credentials: true,
                max_age_secs: default_cors_max_age(),
            },
            csrf: CsrfConfig {
                enabled: true,
                secret: Secret::new(std::env::var("CSRF_SECRET").unwrap_or_default()),
                cookie_name: default_csrf_cookie(),
                header_name: default_csrf_header(),
                token_ttl_secs: default_csrf_ttl(),
            },
            identity: IdentityConfig {
                url: "http://localhost:54321".to_string(),
                api_key: Secret::new(std::env::var("IDENTITY_API_KEY").unwrap_or_default()),
                timeout_secs: default_timeout(),
                protected_path_prefix: default_protected_prefix(),
            },
            validation: ValidationConfig::default(),
            logging: LoggingConfig {
                level: default_log_level(),
                format: default_log_format(),
            },
        }
    }
}

/// Custom serializer for Secret<String>
fn serialize_secret<S>(secret: &Secret<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(secret.expose_secret())
}

/// Custom deserializer for Secret<String>
fn deserialize_secret<'de, D>(deserializer: D) -> Result<Secret<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(Secret::new(s))
}

/// Custom serializer for Option<Secret<String>>
fn serialize_optional_secret<S>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

/// Custom deserializer for Option<Secret<String>>
fn deserialize_optional_secret<'de, D>(deserializer: D) -> Result<Option<Secret<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.map(Secret::new))
}

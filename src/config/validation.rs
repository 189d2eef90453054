//! Configuration validation

use super::*;
use crate::error::{GatewayError, Result};

const LOG_FORMATS: &[&str] = &["json", "compact", "pretty"];

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_rate_limit_config(&config.rate_limit)?;
    validate_cors_config(&config.cors)?;
    validate_csrf_config(&config.csrf)?;
    validate_identity_config(&config.identity)?;
    validate_validation_config(&config.validation)?;
    validate_logging_config(&config.logging)?;
    Ok(())
}

/// Validate rate limit configuration
fn validate_rate_limit_config(config: &RateLimitSettings) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    if config.max_requests == 0 {
        return Err(GatewayError::Config(
            "Rate limit max_requests must be greater than 0".to_string()
        ));
    }

    if config.window_secs == 0 {
        return Err(GatewayError::Config(
            "Rate limit window must be greater than 0".to_string()
        ));
    }

    if config.cleanup_interval_secs == 0 {
        return Err(GatewayError::Config(
            "Rate limit cleanup interval must be greater than 0".to_string()
        ));
    }

    if let Some(token) = &config.bypass_token {
        if token.expose_secret().is_empty() {
            return Err(GatewayError::Config(
                "Rate limit bypass token cannot be empty when set".to_string()
            ));
        }
    }

    Ok(())
}

/// Validate CORS configuration
fn validate_cors_config(config: &CorsConfig) -> Result<()> {
    if config.allowed_origins.is_empty() {
        return Err(GatewayError::Config(
            "At least one allowed origin is required".to_string()
        ));
    }

    for origin in &config.allowed_origins {
        if !origin.starts_with("http://") && !origin.starts_with("https://") {
            return Err(GatewayError::Config(
                format!("Allowed origin must start with http:// or https://: {}", origin)
            ));
        }
    }

    if config.allowed_methods.is_empty() {
        return Err(GatewayError::Config(
            "At least one allowed method is required".to_string()
        ));
    }

    Ok(())
}

/// Validate CSRF configuration
fn validate_csrf_config(config: &CsrfConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    if config.secret.expose_secret().is_empty() {
        return Err(GatewayError::Config(
            "CSRF secret is required when CSRF protection is enabled".to_string()
        ));
    }

    if config.cookie_name.is_empty() || config.header_name.is_empty() {
        return Err(GatewayError::Config(
            "CSRF cookie and header names cannot be empty".to_string()
        ));
    }

    Ok(())
}

/// Validate identity service configuration
fn validate_identity_config(config: &IdentityConfig) -> Result<()> {
    if !config.url.starts_with("http://") && !config.url.starts_with("https://") {
        return Err(GatewayError::Config(
            "Identity service URL must start with http:// or https://".to_string()
        ));
    }

    if config.timeout_secs == 0 || config.timeout_secs > 300 {
        return Err(GatewayError::Config(
            "Identity timeout must be between 1 and 300 seconds".to_string()
        ));
    }

    if !config.protected_path_prefix.starts_with('/') {
        return Err(GatewayError::Config(
            "Protected path prefix must start with '/'".to_string()
        ));
    }

    Ok(())
}

/// Validate input validation limits
fn validate_validation_config(config: &ValidationConfig) -> Result<()> {
    if config.max_string_length == 0 {
        return Err(GatewayError::Config(
            "Max string length must be greater than 0".to_string()
        ));
    }

    if config.max_file_size_bytes == 0 {
        return Err(GatewayError::Config(
            "Max file size must be greater than 0".to_string()
        ));
    }

    Ok(())
}

fn validate_logging_config(config: &LoggingConfig) -> Result<()> {
    if !LOG_FORMATS.contains(&config.format.as_str()) {
        return Err(GatewayError::Config(
            format!("Unknown log format '{}' (expected one of {:?})", config.format, LOG_FORMATS)
        ));
    }
    Ok(())
}

//! Input validation and sanitization

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use ::validator::ValidateEmail;

use crate::config::ValidationConfig;

/// Blocks whose content is executable or styling, removed along with the tags
static DANGEROUS_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?is)<\s*(script|style|iframe|object|embed|noscript|template)\b[^>]*>",
        r".*?",
        r"<\s*/\s*(script|style|iframe|object|embed|noscript|template)\s*>",
    ))
    .expect("dangerous block pattern is valid")
});

/// Any remaining tag, comment or doctype
static ANY_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<!--.*?-->|<[!/?]?[a-zA-Z][^>]*>")
        .expect("tag pattern is valid")
});

/// HTML entity already in escaped form
static ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z][a-zA-Z0-9]{1,31});")
        .expect("entity pattern is valid")
});

/// Input validator
#[derive(Debug, Clone)]
pub struct InputValidator {
    config: ValidationConfig,
}

impl InputValidator {
    /// Create a validator with the given limits
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Strip markup, drop script content and escape what remains.
    ///
    /// The output contains no `<` or `>` and every `&` starts an entity, so
    /// sanitizing it again is a no-op.
    pub fn sanitize_string(input: &str) -> String {
        let without_blocks = DANGEROUS_BLOCK.replace_all(input, "");
        let without_tags = ANY_TAG.replace_all(&without_blocks, "");

        let cleaned: String = without_tags
            .chars()
            .filter(|c| !c.is_control() || c.is_whitespace())
            .collect();

        escape_html(cleaned.trim())
    }

    /// True iff the value is an email address whose domain has a TLD
    pub fn validate_email(value: &str) -> bool {
        value.validate_email()
            && value
                .rsplit_once('@')
                .is_some_and(|(_, domain)| domain.contains('.'))
    }

    /// True iff the value is an absolute http(s) URL with a host
    pub fn validate_url(value: &str) -> bool {
        match url::Url::parse(value) {
            Ok(parsed) => {
                matches!(parsed.scheme(), "http" | "https")
                    && parsed.host_str().is_some_and(|h| !h.is_empty())
            }
            Err(_) => false,
        }
    }

    /// True iff the content type is allowed and the size is within the limit
    pub fn validate_file_upload(&self, content_type: &str, size: u64) -> bool {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        let allowed = self.config.allowed_file_types.iter().any(|t| t.eq_ignore_ascii_case(&mime));
        if !allowed {
            warn!("Upload rejected: content type {} not allowed", mime);
            return false;
        }

        if size > self.config.max_file_size_bytes {
            warn!("Upload rejected: {} bytes (max: {})", size, self.config.max_file_size_bytes);
            return false;
        }

        true
    }

    /// Sanitize every top-level string field of a JSON object.
    ///
    /// `email` and `url` fields are checked against their grammar using the
    /// value as received; non-string values pass through unchanged.
    pub fn sanitize_body(
        &self,
        body: Map<String, Value>,
    ) -> Result<Map<String, Value>, ValidationError> {
        let mut sanitized = Map::with_capacity(body.len());

        for (key, value) in body {
            let value = match value {
                Value::String(raw) => {
                    if raw.chars().count() > self.config.max_string_length {
                        warn!("Validation failed: field {} too long", key);
                        return Err(ValidationError::FieldTooLong {
                            field: key,
                            max_length: self.config.max_string_length,
                        });
                    }

                    if key == "email" && !Self::validate_email(&raw) {
                        warn!("Validation failed: invalid email");
                        return Err(ValidationError::InvalidEmail);
                    }

                    if key == "url" && !Self::validate_url(&raw) {
                        warn!("Validation failed: invalid url");
                        return Err(ValidationError::InvalidUrl);
                    }

                    Value::String(Self::sanitize_string(&raw))
                }
                other => other,
            };
            sanitized.insert(key, value);
        }

        debug!("Sanitized {} body fields", sanitized.len());
        Ok(sanitized)
    }
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

/// Escape HTML special characters, leaving existing entities intact
fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());

    for (idx, c) in input.char_indices() {
        match c {
            '&' if ENTITY.is_match(&input[idx..]) => out.push('&'),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '`' => out.push_str("&#96;"),
            _ => out.push(c),
        }
    }

    out
}

/// Validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid email format")]
    InvalidEmail,

    #[error("Invalid URL format")]
    InvalidUrl,

    #[error("Field {field} too long (max: {max_length} characters)")]
    FieldTooLong { field: String, max_length: usize },

    #[error("Invalid file upload")]
    InvalidUpload,

    #[error("Malformed JSON body: {0}")]
    MalformedBody(String),
}

//! Origin allow-list and CORS response headers

use axum::http::{header, HeaderMap, HeaderValue, Method};
use tracing::warn;

use crate::config::CorsConfig;

#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
    expose_headers: Option<HeaderValue>,
    max_age: HeaderValue,
    allow_credentials: bool,
}

impl CorsPolicy {
    pub fn new(config: &CorsConfig) -> Result<Self, CorsError> {
        let join = |items: &[String]| {
            let joined = items.join(", ");
            HeaderValue::from_str(&joined)
                .map_err(|_| CorsError::InvalidHeaderValue(joined.clone()))
        };

        let expose_headers = if config.exposed_headers.is_empty() {
            None
        } else {
            Some(join(&config.exposed_headers)?)
        };

        Ok(Self {
            allowed_origins: config.allowed_origins.clone(),
            allow_methods: join(&config.allowed_methods)?,
            allow_headers: join(&config.allowed_headers)?,
            expose_headers,
            max_age: HeaderValue::from(config.max_age_secs),
            allow_credentials: config.allow_credentials,
        })
    }

    /// Requests without an `Origin` header are same-origin or non-browser
    /// and always pass.
    pub fn check_origin(&self, origin: Option<&str>) -> Result<(), CorsError> {
        match origin {
            Some(origin) if !self.is_allowed(origin) => {
                warn!("Rejected request from origin {}", origin);
                Err(CorsError::OriginNotAllowed(origin.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == origin)
    }

    /// Whether this is a CORS preflight
    pub fn is_preflight(method: &Method, headers: &HeaderMap) -> bool {
        method == Method::OPTIONS && headers.contains_key(header::ORIGIN)
    }

    /// Add CORS headers for an allowed `origin`
    pub fn apply(&self, headers: &mut HeaderMap, origin: Option<&str>, preflight: bool) {
        let Some(origin) = origin.filter(|o| self.is_allowed(o)) else {
            return;
        };
        let Ok(origin) = HeaderValue::from_str(origin) else {
            return;
        };

        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        if self.allow_credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }

        if preflight {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
            headers.insert(header::ACCESS_CONTROL_MAX_AGE, self.max_age.clone());
        } else if let Some(expose) = &self.expose_headers {
            headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, expose.clone());
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CorsError {
    #[error("Origin not allowed: {0}")]
    OriginNotAllowed(String),

    #[error("Invalid CORS header value: {0}")]
    InvalidHeaderValue(String),
}

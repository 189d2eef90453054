//! Fixed security header set attached to every exchange

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

/// Content security policy for the membership site
pub const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; \
    script-src 'self' 'unsafe-inline'; \
    style-src 'self' 'unsafe-inline'; \
    img-src 'self' data: https:; \
    connect-src 'self' https://api.supabase.com; \
    font-src 'self' https:; \
    object-src 'none'; \
    media-src 'self'; \
    frame-src 'none'; \
    upgrade-insecure-requests";

/// Header name/value pairs, in the order they are applied
pub const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("content-security-policy", CONTENT_SECURITY_POLICY),
    ("x-dns-prefetch-control", "off"),
    ("expect-ct", "max-age=86400, enforce"),
    ("x-frame-options", "DENY"),
    ("strict-transport-security", "max-age=31536000; includeSubDomains; preload"),
    ("x-download-options", "noopen"),
    ("x-content-type-options", "nosniff"),
    ("x-permitted-cross-domain-policies", "none"),
    ("referrer-policy", "same-origin"),
    ("x-xss-protection", "1; mode=block"),
];

/// Attach the full security header set.
///
/// Existing values are replaced, so each header appears exactly once no
/// matter how many times this runs.
pub fn apply_security_headers(headers: &mut HeaderMap) {
    for &(name, value) in SECURITY_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    headers.remove(header::SERVER);
}

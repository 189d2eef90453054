//! Request security pipeline
//!
//! Every inbound request runs the stages in order:
//! origin check, rate limit, CSRF (mutating methods), bearer auth, body
//! sanitization, security headers. The first failing stage short-circuits to
//! a JSON error response.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, Instrument};

use crate::config::{Config, Environment};
use crate::error::{GatewayError, Result};
use crate::observability::SecurityMetrics;

use super::auth::{AuthGuard, IdentityProvider};
use super::cors::CorsPolicy;
use super::csrf::CsrfGuard;
use super::headers::apply_security_headers;
use super::rate_limiter::{RateLimiter, RateQuota};
use super::validator::{InputValidator, ValidationError};

/// Header that lets operators skip the rate limiter
pub const RATE_LIMIT_BYPASS_HEADER: &str = "x-rate-limit-bypass";

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Progress of a request through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    OriginChecked,
    RateChecked,
    CsrfChecked,
    AuthChecked,
    BodySanitized,
    HeadersAttached,
    Forwarded,
}

/// A request stopped by the pipeline, with the last stage it passed
#[derive(Debug)]
pub struct Rejection {
    pub stage: PipelineStage,
    pub error: GatewayError,
}

/// What to do with a request that passed
#[derive(Debug)]
pub enum Admission {
    /// Hand the (possibly rewritten) request to the route handler
    Forward {
        request: Request<Body>,
        quota: Option<RateQuota>,
    },
    /// CORS preflight from an allowed origin; answer directly
    Preflight,
}

pub struct SecurityPipeline {
    cors: CorsPolicy,
    rate_limiter: Arc<RateLimiter>,
    csrf: CsrfGuard,
    csrf_enabled: bool,
    auth: AuthGuard,
    validator: InputValidator,
    max_body_size: usize,
    environment: Environment,
    metrics: Arc<SecurityMetrics>,
}

impl SecurityPipeline {
    /// Assemble the pipeline from configuration and its collaborators
    pub fn from_config(
        config: &Config,
        identity: Arc<dyn IdentityProvider>,
        rate_limiter: Arc<RateLimiter>,
        metrics: Arc<SecurityMetrics>,
    ) -> Result<Self> {
        let max_body_size = match config.server.max_body_size_bytes() {
            0 => usize::MAX,
            n => n,
        };

        Ok(Self {
            cors: CorsPolicy::new(&config.cors)?,
            rate_limiter,
            csrf: CsrfGuard::new(&config.csrf),
            csrf_enabled: config.csrf.enabled,
            auth: AuthGuard::new(identity, config.identity.protected_path_prefix.clone()),
            validator: InputValidator::new(config.validation.clone()),
            max_body_size,
            environment: config.server.environment,
            metrics,
        })
    }

    pub fn csrf(&self) -> &CsrfGuard {
        &self.csrf
    }

    pub fn metrics(&self) -> &Arc<SecurityMetrics> {
        &self.metrics
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Run every stage against `req`
    pub async fn process(&self, req: Request<Body>) -> std::result::Result<Admission, Rejection> {
        let mut stage = PipelineStage::Received;
        match self.run(req, &mut stage).await {
            Ok(admission) => Ok(admission),
            Err(error) => Err(Rejection { stage, error }),
        }
    }

    async fn run(&self, req: Request<Body>, stage: &mut PipelineStage) -> Result<Admission> {
        let (mut parts, body) = req.into_parts();

        self.cors.check_origin(header_str(&parts.headers, header::ORIGIN))?;
        *stage = PipelineStage::OriginChecked;

        if CorsPolicy::is_preflight(&parts.method, &parts.headers) {
            debug!("Answering CORS preflight for {}", parts.uri.path());
            return Ok(Admission::Preflight);
        }

        let client = client_key(&parts, &self.rate_limiter.config().trusted_proxies);
        let quota = self
            .rate_limiter
            .check_rate_limit(&client, header_str(&parts.headers, RATE_LIMIT_BYPASS_HEADER))
            .await?;
        *stage = PipelineStage::RateChecked;

        if self.csrf_enabled && CsrfGuard::requires_token(parts.method.as_str()) {
            self.csrf
                .verify_request(header_str(&parts.headers, self.csrf.header_name()))?;
            *stage = PipelineStage::CsrfChecked;
        }

        let user = self
            .auth
            .authenticate(parts.uri.path(), header_str(&parts.headers, header::AUTHORIZATION))
            .await?;
        if let Some(user) = user {
            debug!(user_id = %user.id, "Request authenticated");
            parts.extensions.insert(user);
        }
        *stage = PipelineStage::AuthChecked;

        let body = self.sanitize_body(&mut parts, body).await?;
        *stage = PipelineStage::BodySanitized;

        apply_security_headers(&mut parts.headers);
        *stage = PipelineStage::HeadersAttached;

        Ok(Admission::Forward {
            request: Request::from_parts(parts, body),
            quota,
        })
    }

    async fn sanitize_body(&self, parts: &mut Parts, body: Body) -> Result<Body> {
        let declared_len = header_str(&parts.headers, header::CONTENT_LENGTH)
            .and_then(|v| v.parse::<u64>().ok());

        if let Some(len) = declared_len {
            if len > self.max_body_size as u64 {
                return Err(GatewayError::PayloadTooLarge {
                    size: len as usize,
                    max_size: self.max_body_size,
                });
            }
        }

        let content_type = header_str(&parts.headers, header::CONTENT_TYPE)
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("image/") {
            let size = declared_len.ok_or(ValidationError::InvalidUpload)?;
            if !self.validator.validate_file_upload(&content_type, size) {
                return Err(ValidationError::InvalidUpload.into());
            }
            return Ok(body);
        }

        if !content_type.contains("application/json") {
            return Ok(body);
        }

        let bytes = axum::body::to_bytes(body, self.max_body_size)
            .await
            .map_err(|_| GatewayError::PayloadTooLarge {
                size: declared_len.unwrap_or_default() as usize,
                max_size: self.max_body_size,
            })?;

        if bytes.is_empty() {
            return Ok(Body::empty());
        }

        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| ValidationError::MalformedBody(e.to_string()))?;

        let sanitized = match value {
            Value::Object(fields) => Value::Object(self.validator.sanitize_body(fields)?),
            other => other,
        };

        let encoded = serde_json::to_vec(&sanitized)
            .map_err(|e| GatewayError::Internal(format!("Failed to re-encode body: {}", e)))?;
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(encoded.len()));

        Ok(Body::from(encoded))
    }

    /// Attach CORS and security headers to an outgoing response
    pub fn finish(&self, response: &mut Response, origin: Option<&str>, preflight: bool) {
        let headers = response.headers_mut();
        self.cors.apply(headers, origin, preflight);
        apply_security_headers(headers);
    }
}

/// Rate limit key for a request.
///
/// The socket peer is the client unless it is a trusted proxy. Behind a
/// trusted proxy the key is the nearest `X-Forwarded-For` hop that is not
/// itself trusted, walking from the right; a chain of only trusted hops keys
/// on the peer. Without a peer address the key is `unknown`.
pub fn client_key(parts: &Parts, trusted_proxies: &HashSet<String>) -> String {
    let Some(peer) = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
    else {
        return "unknown".to_string();
    };

    if !trusted_proxies.contains(&peer) {
        return peer;
    }

    let chain: Vec<&str> = parts
        .headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect();

    chain
        .into_iter()
        .rev()
        .find(|hop| !trusted_proxies.contains(*hop))
        .map(str::to_string)
        .unwrap_or(peer)
}

fn header_str<K: header::AsHeaderName>(headers: &HeaderMap, name: K) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn apply_quota_headers(headers: &mut HeaderMap, quota: &RateQuota) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(quota.reset_after.as_secs()));
}

/// Axum middleware running the pipeline in front of every route
pub async fn security_middleware(
    State(pipeline): State<Arc<SecurityPipeline>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let origin = header_str(req.headers(), header::ORIGIN).map(str::to_string);
    let span = tracing::info_span!(
        "security_pipeline",
        method = %req.method(),
        path = %req.uri().path()
    );

    let (mut response, preflight) = async {
        match pipeline.process(req).await {
            Ok(Admission::Forward { request, quota }) => {
                debug!(stage = ?PipelineStage::Forwarded, "Request forwarded");
                let mut response = next.run(request).await;
                if let Some(quota) = quota {
                    apply_quota_headers(response.headers_mut(), &quota);
                }
                pipeline.metrics.record_forwarded();
                (response, false)
            }
            Ok(Admission::Preflight) => {
                pipeline.metrics.record_preflight();
                (StatusCode::NO_CONTENT.into_response(), true)
            }
            Err(Rejection { stage, error }) => {
                debug!(stage = ?stage, "Request rejected");
                pipeline.metrics.record_rejection(error.reason());
                (error.to_response(pipeline.environment), false)
            }
        }
    }
    .instrument(span)
    .await;

    pipeline.finish(&mut response, origin.as_deref(), preflight);
    pipeline.metrics.record_request(started.elapsed());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::auth::{AuthenticatedUser, StaticTokenProvider};
    use crate::middleware::headers::SECURITY_HEADERS;
    use crate::middleware::rate_limiter::RateLimitConfig;
    use secrecy::Secret;
    use std::time::Duration;

    const ORIGIN: &str = "http://localhost:5173";
    const JSON: &str = "application/json";

    async fn pipeline_with(config: Config) -> SecurityPipeline {
        let provider = StaticTokenProvider::new();
        provider
            .add_token(
                "good-token",
                AuthenticatedUser {
                    id: "user-1".to_string(),
                    email: Some("a@b.com".to_string()),
                    role: None,
                },
            )
            .await;

        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::from(&config.rate_limit)));
        let metrics = Arc::new(SecurityMetrics::new());
        SecurityPipeline::from_config(&config, Arc::new(provider), limiter, metrics).unwrap()
    }

    fn test_config() -> Config {
        let mut config = Config::default_config();
        config.csrf.secret = Secret::new("test-secret".to_string());
        config.rate_limit.bypass_token = None;
        config
    }

    async fn pipeline() -> SecurityPipeline {
        pipeline_with(test_config()).await
    }

    fn post(
        pipeline: &SecurityPipeline,
        uri: &str,
        content_type: &str,
    ) -> axum::http::request::Builder {
        let token = pipeline.csrf().generate_token().unwrap();
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("origin", ORIGIN)
            .header("x-forwarded-for", "203.0.113.7")
            .header("content-type", content_type)
            .header("authorization", "Bearer good-token")
            .header("x-csrf-token", token)
    }

    async fn body_json(request: Request<Body>) -> Value {
        let bytes = axum::body::to_bytes(request.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_profile_update_is_sanitized() {
        let pipeline = pipeline().await;
        let body = r#"{"email":"a@b.com","bio":"<script>alert(1)</script>hi"}"#;
        let req = post(&pipeline, "/api/profile", JSON).body(Body::from(body)).unwrap();

        let Ok(Admission::Forward { request, quota }) = pipeline.process(req).await else {
            panic!("request should be forwarded");
        };

        assert_eq!(quota.unwrap().remaining, 99);
        for (name, value) in SECURITY_HEADERS {
            assert_eq!(request.headers().get(*name).unwrap(), *value);
        }
        assert_eq!(request.extensions().get::<AuthenticatedUser>().unwrap().id, "user-1");
        assert_eq!(body_json(request).await, serde_json::json!({"email":"a@b.com","bio":"hi"}));
    }

    #[tokio::test]
    async fn test_foreign_origin_rejected_first() {
        let pipeline = pipeline().await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/profile")
            .header("origin", "https://evil.example")
            .body(Body::empty())
            .unwrap();

        let rejection = pipeline.process(req).await.unwrap_err();
        assert_eq!(rejection.stage, PipelineStage::Received);
        assert_eq!(rejection.error.status_code(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_missing_csrf_rejected() {
        let pipeline = pipeline().await;
        let req = Request::builder()
            .method("DELETE")
            .uri("/api/schedules/3")
            .header("authorization", "Bearer good-token")
            .body(Body::empty())
            .unwrap();

        let rejection = pipeline.process(req).await.unwrap_err();
        assert_eq!(rejection.stage, PipelineStage::RateChecked);
        assert_eq!(rejection.error.status_code(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_csrf_disabled_skips_check() {
        let mut config = test_config();
        config.csrf.enabled = false;
        let pipeline = pipeline_with(config).await;

        let req = Request::builder()
            .method("DELETE")
            .uri("/api/schedules/3")
            .header("authorization", "Bearer good-token")
            .body(Body::empty())
            .unwrap();

        assert!(matches!(pipeline.process(req).await, Ok(Admission::Forward { .. })));
    }

    #[tokio::test]
    async fn test_get_without_auth_on_api_rejected() {
        let pipeline = pipeline().await;
        let req = Request::builder().uri("/api/test").body(Body::empty()).unwrap();

        let rejection = pipeline.process(req).await.unwrap_err();
        assert_eq!(rejection.stage, PipelineStage::RateChecked);
        assert_eq!(rejection.error.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_preflight_short_circuits() {
        let pipeline = pipeline().await;
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/api/profile")
            .header("origin", ORIGIN)
            .body(Body::empty())
            .unwrap();

        assert!(matches!(pipeline.process(req).await, Ok(Admission::Preflight)));
    }

    #[tokio::test]
    async fn test_invalid_email_rejected() {
        let pipeline = pipeline().await;
        let body = r#"{"email":"not-an-email"}"#;
        let req = post(&pipeline, "/api/profile", JSON).body(Body::from(body)).unwrap();

        let rejection = pipeline.process(req).await.unwrap_err();
        assert_eq!(rejection.stage, PipelineStage::AuthChecked);
        assert_eq!(rejection.error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_json_rejected() {
        let pipeline = pipeline().await;
        let req = post(&pipeline, "/api/profile", JSON).body(Body::from("{")).unwrap();

        let rejection = pipeline.process(req).await.unwrap_err();
        assert_eq!(rejection.error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let mut config = test_config();
        config.server.max_body_size_mb = 1;
        let pipeline = pipeline_with(config).await;

        let big = format!(r#"{{"bio":"{}"}}"#, "a".repeat(2 * 1024 * 1024));
        let req = post(&pipeline, "/api/profile", JSON).body(Body::from(big.clone())).unwrap();

        let rejection = pipeline.process(req).await.unwrap_err();
        assert_eq!(rejection.error.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_image_upload_checked() {
        let pipeline = pipeline().await;

        let ok = post(&pipeline, "/api/profile/photo", "image/png")
            .header("content-length", "2048")
            .body(Body::from(vec![0u8; 2048]))
            .unwrap();
        assert!(matches!(pipeline.process(ok).await, Ok(Admission::Forward { .. })));

        let too_big = post(&pipeline, "/api/profile/photo", "image/png")
            .header("content-length", (6 * 1024 * 1024).to_string())
            .body(Body::empty())
            .unwrap();
        let rejection = pipeline.process(too_big).await.unwrap_err();
        assert_eq!(rejection.error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rate_limit_then_recovery() {
        let mut pipeline = pipeline().await;
        pipeline.rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            max_requests: 2,
            window_duration: Duration::from_millis(100),
            ..Default::default()
        }));

        let get = || {
            Request::builder()
                .uri("/health")
                .header("x-forwarded-for", "198.51.100.4")
                .body(Body::empty())
                .unwrap()
        };

        assert!(pipeline.process(get()).await.is_ok());
        assert!(pipeline.process(get()).await.is_ok());
        let rejection = pipeline.process(get()).await.unwrap_err();
        assert_eq!(rejection.stage, PipelineStage::OriginChecked);
        assert_eq!(rejection.error.status_code(), StatusCode::TOO_MANY_REQUESTS);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(pipeline.process(get()).await.is_ok());
    }

    fn parts_from(peer: Option<[u8; 4]>, forwarded: &[&str]) -> Parts {
        let mut builder = Request::builder();
        for value in forwarded {
            builder = builder.header("x-forwarded-for", *value);
        }
        if let Some(ip) = peer {
            builder = builder.extension(ConnectInfo(SocketAddr::from((ip, 4000))));
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn trusted() -> HashSet<String> {
        HashSet::from(["127.0.0.1".to_string(), "10.0.0.2".to_string()])
    }

    #[test]
    fn test_client_key_uses_untrusted_peer() {
        let trusted = trusted();

        let parts = parts_from(Some([192, 0, 2, 1]), &[]);
        assert_eq!(client_key(&parts, &trusted), "192.0.2.1");

        // Forwarded headers from an untrusted peer are ignored
        let parts = parts_from(Some([192, 0, 2, 1]), &["127.0.0.1"]);
        assert_eq!(client_key(&parts, &trusted), "192.0.2.1");
        let parts = parts_from(Some([192, 0, 2, 1]), &["203.0.113.7, 10.0.0.1"]);
        assert_eq!(client_key(&parts, &trusted), "192.0.2.1");
    }

    #[test]
    fn test_client_key_behind_trusted_proxy() {
        let trusted = trusted();

        let parts = parts_from(Some([127, 0, 0, 1]), &[" 203.0.113.7 , 10.0.0.2"]);
        assert_eq!(client_key(&parts, &trusted), "203.0.113.7");

        // A hop spoofed by the client sits left of the address the proxy saw
        let parts = parts_from(Some([127, 0, 0, 1]), &["127.0.0.1, 198.51.100.3"]);
        assert_eq!(client_key(&parts, &trusted), "198.51.100.3");

        let parts = parts_from(Some([127, 0, 0, 1]), &["198.51.100.3", "10.0.0.2"]);
        assert_eq!(client_key(&parts, &trusted), "198.51.100.3");

        let parts = parts_from(Some([127, 0, 0, 1]), &["10.0.0.2"]);
        assert_eq!(client_key(&parts, &trusted), "127.0.0.1");

        let parts = parts_from(Some([127, 0, 0, 1]), &[]);
        assert_eq!(client_key(&parts, &trusted), "127.0.0.1");
    }

    #[test]
    fn test_client_key_without_peer() {
        let parts = parts_from(None, &["203.0.113.7"]);
        assert_eq!(client_key(&parts, &trusted()), "unknown");
    }

    #[tokio::test]
    async fn test_rotating_forwarded_for_is_still_limited() {
        let mut pipeline = pipeline().await;
        pipeline.rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            max_requests: 3,
            ..Default::default()
        }));

        let mut admitted = 0;
        for i in 0..20 {
            let forwarded = if i % 2 == 0 {
                "127.0.0.1".to_string()
            } else {
                format!("10.0.0.{}", i)
            };
            let req = Request::builder()
                .uri("/health")
                .header("x-forwarded-for", forwarded)
                .extension(ConnectInfo(SocketAddr::from(([198, 51, 100, 20], 5000))))
                .body(Body::empty())
                .unwrap();
            if pipeline.process(req).await.is_ok() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 3);
    }
}

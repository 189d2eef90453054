//! Fixed-window rate limiting keyed by client identifier

use async_trait::async_trait;
use dashmap::DashMap;
use secrecy::{ExposeSecret, Secret};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RateLimitSettings;

/// Rate limit configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window
    pub max_requests: u64,
    /// Time window duration
    pub window_duration: Duration,
    /// Whether to enable rate limiting
    pub enabled: bool,
    /// Proxy addresses that are never counted and whose forwarded hops are believed
    pub trusted_proxies: HashSet<String>,
    /// Value of `X-Rate-Limit-Bypass` that skips the counter
    pub bypass_token: Option<Secret<String>>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_duration: Duration::from_secs(15 * 60),
            enabled: true,
            trusted_proxies: HashSet::from(["127.0.0.1".to_string()]),
            bypass_token: None,
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            max_requests: settings.max_requests,
            window_duration: settings.window(),
            enabled: settings.enabled,
            trusted_proxies: settings.trusted_proxies.iter().cloned().collect(),
            bypass_token: settings.bypass_token.clone(),
        }
    }
}

/// Per-client counter for the current window
#[derive(Debug, Clone)]
pub struct RateRecord {
    pub client_key: String,
    pub count: u64,
    pub window_reset_at: Instant,
}

/// Storage for rate records.
///
/// `hit` must count and return the updated record atomically for a key.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one request for `key`, starting a new window if the last one elapsed
    async fn hit(&self, key: &str, window: Duration, now: Instant) -> RateRecord;

    /// Current record for `key`
    async fn get(&self, key: &str) -> Option<RateRecord>;

    /// Forget `key`
    async fn remove(&self, key: &str);

    /// Drop records whose window has ended; returns how many were dropped
    async fn purge_expired(&self, now: Instant) -> usize;

    /// Number of tracked keys
    async fn len(&self) -> usize;
}

/// Single-process store backed by a sharded map
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    records: DashMap<String, RateRecord>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn hit(&self, key: &str, window: Duration, now: Instant) -> RateRecord {
        // The entry guard holds the shard lock across check and increment
        let mut entry = self.records.entry(key.to_string()).or_insert_with(|| RateRecord {
            client_key: key.to_string(),
            count: 0,
            window_reset_at: now + window,
        });

        let record = entry.value_mut();
        if now >= record.window_reset_at {
            record.count = 0;
            record.window_reset_at = now + window;
        }
        record.count += 1;

        record.clone()
    }

    async fn get(&self, key: &str) -> Option<RateRecord> {
        self.records.get(key).map(|r| r.value().clone())
    }

    async fn remove(&self, key: &str) {
        self.records.remove(key);
    }

    async fn purge_expired(&self, now: Instant) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| now < record.window_reset_at);
        before.saturating_sub(self.records.len())
    }

    async fn len(&self) -> usize {
        self.records.len()
    }
}

/// Outcome of an admitted request, used for `X-RateLimit-*` headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
}

/// Rate limiter over an injected store
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    /// Create a rate limiter with an in-memory store
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryRateLimitStore::new()))
    }

    /// Create a rate limiter over a custom store
    pub fn with_store(config: RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self { config, store }
    }

    /// Whether this request skips counting
    pub fn is_exempt(&self, client_key: &str, bypass_header: Option<&str>) -> bool {
        if self.config.trusted_proxies.contains(client_key) {
            return true;
        }

        match (&self.config.bypass_token, bypass_header) {
            (Some(expected), Some(presented)) => {
                constant_time_eq(expected.expose_secret().as_bytes(), presented.as_bytes())
            }
            _ => false,
        }
    }

    /// Count the request and decide.
    ///
    /// The rejected request is still counted. Returns `Ok(None)` when the
    /// client is exempt or limiting is disabled.
    pub async fn check_rate_limit(
        &self,
        client_key: &str,
        bypass_header: Option<&str>,
    ) -> Result<Option<RateQuota>, RateLimitError> {
        if !self.config.enabled {
            return Ok(None);
        }

        if self.is_exempt(client_key, bypass_header) {
            debug!("Rate limit skipped for exempt client: {}", client_key);
            return Ok(None);
        }

        let now = Instant::now();
        let record = self
            .store
            .hit(client_key, self.config.window_duration, now)
            .await;
        let reset_after = record.window_reset_at.saturating_duration_since(now);

        if record.count > self.config.max_requests {
            warn!(
                "Rate limit exceeded for client: {} ({} requests in window)",
                client_key, record.count
            );

            return Err(RateLimitError::LimitExceeded {
                retry_after: reset_after,
                limit: self.config.max_requests,
            });
        }

        debug!(
            "Request allowed for client: {} ({}/{})",
            client_key, record.count, self.config.max_requests
        );

        Ok(Some(RateQuota {
            limit: self.config.max_requests,
            remaining: self.config.max_requests - record.count,
            reset_after,
        }))
    }

    /// Get current usage for a client
    pub async fn get_usage(&self, client_key: &str) -> Option<RateRecord> {
        self.store.get(client_key).await
    }

    /// Reset rate limit for a client
    pub async fn reset(&self, client_key: &str) {
        self.store.remove(client_key).await;
        debug!("Rate limit reset for client: {}", client_key);
    }

    /// Clean up expired records
    pub async fn cleanup_expired(&self) -> usize {
        let removed = self.store.purge_expired(Instant::now()).await;
        debug!("Cleaned up {} expired rate limit records", removed);
        removed
    }

    /// Start background cleanup task
    pub fn start_cleanup_task(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                self.cleanup_expired().await;
            }
        })
    }

    /// Number of clients currently tracked
    pub async fn tracked_clients(&self) -> usize {
        self.store.len().await
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Rate limit error
#[derive(Debug, Clone, thiserror::Error)]
pub enum RateLimitError {
    #[error("Too many requests, please try again later")]
    LimitExceeded {
        retry_after: Duration,
        limit: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_requests: u64, window: Duration) -> RateLimitConfig {
        RateLimitConfig {
            max_requests,
            window_duration: window,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rate_limit_allows_requests() {
        let limiter = RateLimiter::new(config(5, Duration::from_secs(60)));

        for i in 0..5 {
            assert!(
                limiter.check_rate_limit("10.0.0.1", None).await.is_ok(),
                "Request {} should be allowed",
                i
            );
        }
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_excess() {
        let limiter = RateLimiter::new(config(3, Duration::from_secs(60)));

        for _ in 0..3 {
            assert!(limiter.check_rate_limit("10.0.0.1", None).await.is_ok());
        }

        // 4th request is rejected and still counted
        assert!(limiter.check_rate_limit("10.0.0.1", None).await.is_err());
        assert_eq!(limiter.get_usage("10.0.0.1").await.unwrap().count, 4);
        assert!(limiter.check_rate_limit("10.0.0.1", None).await.is_err());
        assert_eq!(limiter.get_usage("10.0.0.1").await.unwrap().count, 5);
    }

    #[tokio::test]
    async fn test_quota_counts_down() {
        let limiter = RateLimiter::new(config(2, Duration::from_secs(60)));

        let first = limiter.check_rate_limit("10.0.0.1", None).await.unwrap().unwrap();
        assert_eq!(first.limit, 2);
        assert_eq!(first.remaining, 1);

        let second = limiter.check_rate_limit("10.0.0.1", None).await.unwrap().unwrap();
        assert_eq!(second.remaining, 0);
        assert!(second.reset_after <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_rate_limit_window_reset() {
        let limiter = RateLimiter::new(config(2, Duration::from_millis(100)));

        // Use up limit
        limiter.check_rate_limit("10.0.0.1", None).await.unwrap();
        limiter.check_rate_limit("10.0.0.1", None).await.unwrap();
        assert!(limiter.check_rate_limit("10.0.0.1", None).await.is_err());

        // Wait for window to expire
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Should allow requests again, counting from one
        assert!(limiter.check_rate_limit("10.0.0.1", None).await.is_ok());
        assert_eq!(limiter.get_usage("10.0.0.1").await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_per_client() {
        let limiter = RateLimiter::new(config(2, Duration::from_secs(60)));

        limiter.check_rate_limit("10.0.0.1", None).await.unwrap();
        limiter.check_rate_limit("10.0.0.1", None).await.unwrap();
        assert!(limiter.check_rate_limit("10.0.0.1", None).await.is_err());

        // Another client still has its own budget
        assert!(limiter.check_rate_limit("10.0.0.2", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_disabled() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            ..config(1, Duration::from_secs(60))
        });

        for _ in 0..10 {
            assert!(limiter.check_rate_limit("10.0.0.1", None).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_trusted_proxy_skips_counter() {
        let limiter = RateLimiter::new(config(1, Duration::from_secs(60)));

        for _ in 0..5 {
            assert_eq!(limiter.check_rate_limit("127.0.0.1", None).await.unwrap(), None);
        }
        assert!(limiter.get_usage("127.0.0.1").await.is_none());
    }

    #[tokio::test]
    async fn test_bypass_token() {
        let limiter = RateLimiter::new(RateLimitConfig {
            bypass_token: Some(Secret::new("let-me-in".to_string())),
            ..config(1, Duration::from_secs(60))
        });

        for _ in 0..3 {
            assert!(limiter.check_rate_limit("10.0.0.1", Some("let-me-in")).await.is_ok());
        }

        limiter.check_rate_limit("10.0.0.1", Some("wrong")).await.unwrap();
        assert!(limiter.check_rate_limit("10.0.0.1", Some("wrong")).await.is_err());
    }

    #[tokio::test]
    async fn test_no_bypass_without_configured_token() {
        let limiter = RateLimiter::new(config(1, Duration::from_secs(60)));

        limiter.check_rate_limit("10.0.0.1", None).await.unwrap();
        assert!(limiter.check_rate_limit("10.0.0.1", Some("")).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_hits_are_all_counted() {
        let limiter = Arc::new(RateLimiter::new(config(1000, Duration::from_secs(60))));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    for _ in 0..10 {
                        limiter.check_rate_limit("10.0.0.1", None).await.unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(limiter.get_usage("10.0.0.1").await.unwrap().count, 500);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let limiter = RateLimiter::new(config(5, Duration::from_millis(50)));

        limiter.check_rate_limit("10.0.0.1", None).await.unwrap();
        limiter.check_rate_limit("10.0.0.2", None).await.unwrap();
        assert_eq!(limiter.tracked_clients().await, 2);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(limiter.cleanup_expired().await, 2);
        assert_eq!(limiter.tracked_clients().await, 0);
    }
}

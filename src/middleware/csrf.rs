//! CSRF token minting and verification
//!
//! Tokens are stateless: `<issued_at>.<salt>.<signature>` where the signature
//! is an HMAC-SHA256 over `<issued_at>.<salt>` keyed with the server secret.

use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::config::CsrfConfig;

type HmacSha256 = Hmac<Sha256>;

/// Random bytes per token
const SALT_LEN: usize = 18;

/// Methods that never need a token
pub const SAFE_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS"];

/// CSRF guard bound to a shared secret
#[derive(Debug, Clone)]
pub struct CsrfGuard {
    secret: Secret<String>,
    cookie_name: String,
    header_name: String,
    /// 0 disables expiry
    token_ttl_secs: u64,
}

impl CsrfGuard {
    pub fn new(config: &CsrfConfig) -> Self {
        Self {
            secret: config.secret.clone(),
            cookie_name: config.cookie_name.clone(),
            header_name: config.header_name.clone(),
            token_ttl_secs: config.token_ttl_secs,
        }
    }

    /// Name of the request header carrying the token
    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// Whether `method` must present a token
    pub fn requires_token(method: &str) -> bool {
        !SAFE_METHODS.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Mint a new token
    pub fn generate_token(&self) -> Result<String, CsrfError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let payload = format!("{}.{}", unix_now()?, hex::encode(salt));
        let signature = self.sign(&payload)?;

        debug!("CSRF token minted");
        Ok(format!("{}.{}", payload, hex::encode(signature)))
    }

    /// Check a presented token against the secret
    pub fn verify_token(&self, token: &str) -> bool {
        match self.check(token) {
            Ok(()) => true,
            Err(e) => {
                warn!("CSRF verification failed: {}", e);
                false
            }
        }
    }

    /// Verify the header value of a state-changing request
    pub fn verify_request(&self, presented: Option<&str>) -> Result<(), CsrfError> {
        let token = presented.ok_or(CsrfError::MissingToken)?;
        self.check(token)
    }

    /// `Set-Cookie` value delivering `token`
    pub fn cookie(&self, token: &str) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; Secure; SameSite=Strict",
            self.cookie_name, token
        );
        if self.token_ttl_secs > 0 {
            cookie.push_str(&format!("; Max-Age={}", self.token_ttl_secs));
        }
        cookie
    }

    fn check(&self, token: &str) -> Result<(), CsrfError> {
        let (payload, signature) = token.rsplit_once('.').ok_or(CsrfError::InvalidToken)?;
        let (issued_at, salt) = payload.split_once('.').ok_or(CsrfError::InvalidToken)?;

        let issued_at: u64 = issued_at.parse().map_err(|_| CsrfError::InvalidToken)?;
        if salt.len() != SALT_LEN * 2 || hex::decode(salt).is_err() {
            return Err(CsrfError::InvalidToken);
        }
        let signature = hex::decode(signature).map_err(|_| CsrfError::InvalidToken)?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature).map_err(|_| CsrfError::InvalidToken)?;

        if self.token_ttl_secs > 0 {
            let now = unix_now()?;
            if issued_at > now || now - issued_at > self.token_ttl_secs {
                return Err(CsrfError::Expired);
            }
        }

        Ok(())
    }

    fn sign(&self, payload: &str) -> Result<Vec<u8>, CsrfError> {
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn mac(&self) -> Result<HmacSha256, CsrfError> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| CsrfError::Secret(e.to_string()))
    }
}

fn unix_now() -> Result<u64, CsrfError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| CsrfError::Secret(format!("System time error: {}", e)))
}

/// CSRF errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CsrfError {
    #[error("Invalid CSRF token")]
    MissingToken,

    #[error("Invalid CSRF token")]
    InvalidToken,

    #[error("CSRF token expired")]
    Expired,

    #[error("CSRF secret unusable: {0}")]
    Secret(String),
}

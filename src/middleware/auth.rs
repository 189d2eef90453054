//! Bearer authentication against the hosted identity service

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::config::IdentityConfig;

/// User returned by the identity service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Verifies bearer tokens
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve `token` to a user
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError>;
}

/// Identity provider backed by the platform's `/auth/v1/user` endpoint
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    user_url: String,
    api_key: Secret<String>,
}

impl HttpIdentityProvider {
    /// Create a provider for the configured identity service
    pub fn new(config: &IdentityConfig) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AuthError::Provider(e.to_string()))?;

        Ok(Self {
            client,
            user_url: format!("{}/auth/v1/user", config.url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let response = self
            .client
            .get(&self.user_url)
            .header("apikey", self.api_key.expose_secret())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                error!("Identity service unreachable: {}", e);
                AuthError::Provider(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!("Identity service rejected token with status {}", status);
            return Err(AuthError::InvalidToken);
        }

        let user: AuthenticatedUser = response.json().await.map_err(|e| {
            warn!("Identity service returned an unreadable user: {}", e);
            AuthError::InvalidToken
        })?;

        debug!(user_id = %user.id, "Token verified by identity service");
        Ok(user)
    }
}

/// In-process token table for development and tests
#[derive(Default)]
pub struct StaticTokenProvider {
    tokens: RwLock<HashMap<String, AuthenticatedUser>>,
}

impl StaticTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `user`
    pub async fn add_token(&self, token: impl Into<String>, user: AuthenticatedUser) {
        self.tokens.write().await.insert(token.into(), user);
        debug!("Token added to valid tokens");
    }

    /// Stop accepting `token`
    pub async fn remove_token(&self, token: &str) {
        self.tokens.write().await.remove(token);
        debug!("Token removed from valid tokens");
    }

    /// Get number of valid tokens
    pub async fn token_count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenProvider {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        self.tokens
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Decides which requests need a bearer token and checks it
#[derive(Clone)]
pub struct AuthGuard {
    provider: Arc<dyn IdentityProvider>,
    protected_path_prefix: String,
}

impl AuthGuard {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        protected_path_prefix: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            protected_path_prefix: protected_path_prefix.into(),
        }
    }

    /// Whether `path` requires authentication
    pub fn is_protected(&self, path: &str) -> bool {
        path.contains(&self.protected_path_prefix)
    }

    /// Authenticate a request from its path and `Authorization` header.
    ///
    /// Protected paths must carry a bearer token. Elsewhere a presented token
    /// is still verified so a bad one never slips through.
    pub async fn authenticate(
        &self,
        path: &str,
        authorization: Option<&str>,
    ) -> Result<Option<AuthenticatedUser>, AuthError> {
        let token = authorization.and_then(bearer_token);

        match (token, self.is_protected(path)) {
            (Some(token), _) => self.provider.verify(token).await.map(Some),
            (None, true) => {
                warn!("Missing bearer token for protected path {}", path);
                Err(AuthError::MissingToken)
            }
            (None, false) => Ok(None),
        }
    }
}

/// Extract the token from `Bearer <token>`
fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Authentication errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("Unauthorized")]
    MissingToken,

    #[error("Invalid authentication token")]
    InvalidToken,

    #[error("Invalid authentication token")]
    Provider(String),
}

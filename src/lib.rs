//! Gym Security Gateway - request security for the boxing gym membership site
//!
//! Every inbound request runs a fixed pipeline before it reaches a handler:
//!
//! - **CORS**: origin allow-list and preflight answers
//! - **Rate Limiting**: fixed-window counting per client, with trusted proxies
//!   and an operator bypass token
//! - **CSRF**: HMAC-signed tokens required on mutating methods
//! - **Authentication**: bearer tokens verified by the hosted identity service
//! - **Input Sanitization**: markup stripping and escaping of JSON bodies,
//!   email/URL checks and upload allow-lists
//! - **Security Headers**: a fixed header set on every response
//!
//! Rejections become `{error, errorId, timestamp}` JSON bodies; production
//! deployments redact the message.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gym_security_gateway::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::from_file_with_env("config.toml")?;
//!     gym_security_gateway::server::run(config).await
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod server;

pub use config::Config;
pub use error::{GatewayError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, Environment};
    pub use crate::error::{GatewayError, Result};
    pub use crate::middleware::{
        AuthenticatedUser, CorsPolicy, CsrfGuard, IdentityProvider, InputValidator, RateLimitStore,
        RateLimiter, SecurityPipeline,
    };
    pub use crate::observability::SecurityMetrics;
}

//! Request security middleware shared by every entry point

pub mod rate_limiter;
pub mod auth;
pub mod validator;
pub mod csrf;
pub mod cors;
pub mod headers;
pub mod pipeline;

pub use rate_limiter::{
    InMemoryRateLimitStore, RateLimitConfig, RateLimitError, RateLimitStore, RateLimiter,
    RateQuota, RateRecord,
};
pub use auth::{
    AuthError, AuthGuard, AuthenticatedUser, HttpIdentityProvider, IdentityProvider,
    StaticTokenProvider,
};
pub use self::validator::{InputValidator, ValidationError};
pub use csrf::{CsrfGuard, CsrfError};
pub use cors::{CorsPolicy, CorsError};
pub use headers::{apply_security_headers, SECURITY_HEADERS};
pub use pipeline::{security_middleware, Admission, PipelineStage, Rejection, SecurityPipeline};

//! API request handlers

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

use crate::error::GatewayError;
use crate::middleware::{AuthError, AuthenticatedUser, SecurityPipeline};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SecurityPipeline>,
}

/// Response carrying a fresh CSRF token
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
}

/// Acknowledgement of a profile update
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub user_id: String,
    pub profile: Map<String, Value>,
}

/// Root handler
pub async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": "Gym Security Gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

/// Liveness probe handler - always returns 200
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "alive"})))
}

/// Metrics handler
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut output = state.pipeline.metrics().export_prometheus();

    let tracked = state.pipeline.rate_limiter().tracked_clients().await;
    output.push_str(&format!(
        "\n# HELP gym_gateway_rate_limit_clients Clients tracked by the rate limiter\n\
         # TYPE gym_gateway_rate_limit_clients gauge\n\
         gym_gateway_rate_limit_clients {}\n",
        tracked
    ));

    output
}

/// Mint a CSRF token, returned in the body and as a cookie
pub async fn csrf_token_handler(State(state): State<AppState>) -> Response {
    let csrf = state.pipeline.csrf();

    match csrf.generate_token() {
        Ok(token) => {
            let cookie = csrf.cookie(&token);
            (
                StatusCode::OK,
                [(header::SET_COOKIE, cookie)],
                Json(CsrfTokenResponse { csrf_token: token }),
            )
                .into_response()
        }
        Err(e) => GatewayError::from(e).to_response(state.pipeline.environment()),
    }
}

/// Authenticated smoke-test endpoint
pub async fn api_test_handler() -> impl IntoResponse {
    Json(json!({"message": "Secure endpoint working!"}))
}

/// Accept a sanitized profile update for the signed-in member.
///
/// Persistence belongs to the hosted data platform; this acknowledges what
/// passed the pipeline. Requests that reach here unauthenticated get the
/// standard 401 body.
pub async fn update_profile(
    State(state): State<AppState>,
    user: Option<Extension<AuthenticatedUser>>,
    Json(profile): Json<Map<String, Value>>,
) -> Response {
    let Some(Extension(user)) = user else {
        return GatewayError::from(AuthError::MissingToken)
            .to_response(state.pipeline.environment());
    };

    info!(user_id = %user.id, fields = profile.len(), "Profile update accepted");

    Json(ProfileResponse {
        user_id: user.id,
        profile,
    })
    .into_response()
}

/// JSON 404 for unknown routes
pub async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({"error": "Not found"})))
}

//! API route configuration

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::security_middleware;

use super::handlers::{self, AppState};

/// Build the complete router; every route sits behind the security pipeline
pub fn build_router(app_state: AppState, max_body_size: usize) -> Router {
    let body_limit = match max_body_size {
        0 => usize::MAX,
        n => n,
    };

    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/csrf-token", get(handlers::csrf_token_handler))
        .route("/api/test", get(handlers::api_test_handler))
        .route(
            "/api/profile",
            post(handlers::update_profile).put(handlers::update_profile),
        )
        .fallback(handlers::not_found_handler)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn_with_state(
                    app_state.pipeline.clone(),
                    security_middleware,
                )),
        )
        .with_state(app_state)
}

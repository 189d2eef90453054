//! HTTP server wiring: state assembly, binding and graceful shutdown

use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use crate::api::{build_router, AppState};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::middleware::{
    HttpIdentityProvider, IdentityProvider, RateLimitConfig, RateLimiter, SecurityPipeline,
};
use crate::observability::SecurityMetrics;

/// Build the application router with the configured identity provider
pub fn create_app(config: &Config) -> Result<Router> {
    let identity: Arc<dyn IdentityProvider> =
        Arc::new(HttpIdentityProvider::new(&config.identity)?);
    create_app_with_identity(config, identity)
}

/// Build the application router around an explicit identity provider.
///
/// Starts the rate limiter's cleanup task, so this must run inside a tokio
/// runtime.
pub fn create_app_with_identity(
    config: &Config,
    identity: Arc<dyn IdentityProvider>,
) -> Result<Router> {
    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig::from(&config.rate_limit)));
    if config.rate_limit.enabled && config.rate_limit.cleanup_interval_secs > 0 {
        let every = std::time::Duration::from_secs(config.rate_limit.cleanup_interval_secs);
        rate_limiter.clone().start_cleanup_task(every);
        info!(
            interval_secs = config.rate_limit.cleanup_interval_secs,
            "Rate limiter cleanup task started"
        );
    }

    let metrics = Arc::new(SecurityMetrics::new());
    let pipeline = Arc::new(SecurityPipeline::from_config(
        config,
        identity,
        rate_limiter,
        metrics,
    )?);

    Ok(build_router(AppState { pipeline }, config.server.max_body_size_bytes()))
}

/// Bind and serve until a shutdown signal arrives
pub async fn run(config: Config) -> Result<()> {
    let app = create_app(&config)?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| GatewayError::Config(format!("Invalid listen address: {}", e)))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    info!(%addr, environment = ?config.server.environment, "Gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Starting graceful shutdown");
}

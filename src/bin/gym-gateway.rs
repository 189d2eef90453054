//! Gym Security Gateway server binary
//!
//! Loads configuration, initializes logging and serves the protected API
//! until Ctrl+C or SIGTERM.

use anyhow::Context;
use gym_security_gateway::{config::Config, observability::init_observability, server};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        Config::from_file_with_env(&config_path)
            .with_context(|| format!("Failed to load configuration from {}", config_path))?
    } else {
        let config = Config::default_config();
        config.validate().context("Default configuration is invalid")?;
        config
    };

    init_observability(&config.logging.level, &config.logging.format);

    info!("Starting Gym Security Gateway");
    info!(path = %config_path, environment = ?config.server.environment, "Configuration loaded");
    info!(
        max_requests = config.rate_limit.max_requests,
        window_secs = config.rate_limit.window_secs,
        csrf_enabled = config.csrf.enabled,
        origins = ?config.cors.allowed_origins,
        "Security pipeline configured"
    );

    server::run(config).await?;

    Ok(())
}

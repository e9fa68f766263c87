//! W-CSAP authentication gateway
//!
//! Binds browser and API sessions to possession of a wallet private key
//! via EIP-191 challenge signing; issues and verifies session tokens.

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use shared::Config;
use std::sync::Arc;

mod background_tasks;
mod handlers;
mod middleware;
mod models;
mod openapi;
mod routes;
mod services;
mod state;

use background_tasks::SweepRunner;
use middleware::{CsrfProtection, RequestIdHeader, SecurityHeaders, SecurityHeadersConfig};
use state::AppState;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    shared::init_tracing();

    tracing::info!("Starting authentication gateway...");

    // Configuration errors are fatal; the process must not start with a
    // missing secret or an incomplete JWT setup
    let config = Config::from_env().context("Failed to load configuration")?;
    for warning in config.production_warnings() {
        tracing::warn!("{}", warning);
    }

    // Install the metrics recorder before any counter is touched
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    let state = Arc::new(
        AppState::from_config(config.clone(), Some(metrics_handle))
            .await
            .context("Failed to assemble authentication core")?,
    );

    // Background expiry sweeps
    let sweeps = SweepRunner::new(state.clone(), config.store.cleanup_interval_seconds);
    let shutdown_token = sweeps.start();
    tracing::info!(
        interval = config.store.cleanup_interval_seconds,
        "Expiry sweeps started"
    );

    let server_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Authentication gateway listening on {}", server_addr);

    let app_state = web::Data::from(state);
    let csrf_enabled = config.server.csrf_enabled;
    let csrf_secret = config.protocol.secret_key.clone();
    let require_https = config.server.require_https;
    let allowed_origins = config.server.allowed_origins.clone();

    let server = HttpServer::new(move || {
        let csrf = CsrfProtection::new(&csrf_secret, require_https);

        App::new()
            // Security headers apply to every response, including errors
            .wrap(SecurityHeaders::new(SecurityHeadersConfig::from_server(
                require_https,
            )))
            .wrap(tracing_actix_web::TracingLogger::default())
            .wrap(middleware::cors(&allowed_origins, require_https))
            .wrap(actix_web::middleware::Condition::new(csrf_enabled, csrf))
            .wrap(RequestIdHeader::new())
            // Body size limit: auth payloads are small
            .app_data(web::JsonConfig::default().limit(65_536))
            .app_data(app_state.clone())
            .configure(routes::configure)
    })
    .bind(&server_addr)
    .with_context(|| format!("Failed to bind to {}", server_addr))?;

    let server_handle = server.run();

    // Graceful shutdown: stop the sweeps with the server
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received, stopping sweeps...");
                shutdown_token.cancel();
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        }
    });

    server_handle.await.context("Server error")?;

    tracing::info!("Authentication gateway shutdown complete");

    Ok(())
}

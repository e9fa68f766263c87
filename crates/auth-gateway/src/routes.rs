//! Route configuration

use actix_web::web;

use crate::handlers;

/// Configure all routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/auth")
            .route("/challenge", web::post().to(handlers::auth::challenge))
            .route("/verify", web::post().to(handlers::auth::verify))
            .route("/refresh", web::post().to(handlers::auth::refresh))
            .route("/logout", web::post().to(handlers::auth::logout))
            .route("/status", web::get().to(handlers::auth::status))
            .route("/sessions", web::get().to(handlers::auth::sessions))
            .route("/stats", web::get().to(handlers::auth::stats))
            .route("/pow", web::get().to(handlers::auth::pow_challenge))
            .route(
                "/rate-limit/{wallet}",
                web::get().to(handlers::auth::rate_limit_status),
            ),
    )
    .route(
        "/.well-known/jwks.json",
        web::get().to(handlers::well_known::jwks),
    )
    .service(
        web::scope("/api/v1")
            .route("/health", web::get().to(handlers::health::health_check))
            .route(
                "/openapi.json",
                web::get().to(handlers::health::openapi_json),
            ),
    )
    .route("/metrics", web::get().to(handlers::health::metrics));
}

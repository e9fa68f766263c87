//! HTTP middleware

pub mod csrf;
pub mod request_id;
pub mod security_headers;

use actix_cors::Cors;
use actix_web::http::header::{self, HeaderName};
use tracing::{debug, warn};

pub use csrf::CsrfProtection;
pub use request_id::RequestIdHeader;
pub use security_headers::{SecurityHeaders, SecurityHeadersConfig};

/// Build the CORS middleware from the configured origin allowlist.
/// Wildcards are refused; with HTTPS required, plain-http origins are
/// dropped.
pub fn cors(allowed_origins: &[String], require_https: bool) -> Cors {
    let mut cors = Cors::default();
    let mut accepted = 0;

    for origin in allowed_origins {
        if origin == "*" {
            warn!("Wildcard CORS origin refused; list explicit origins");
            continue;
        }
        if require_https && !origin.starts_with("https://") {
            warn!(origin = %origin, "Dropping non-HTTPS CORS origin");
            continue;
        }
        if !origin.starts_with("http://") && !origin.starts_with("https://") {
            warn!(origin = %origin, "Dropping malformed CORS origin");
            continue;
        }
        cors = cors.allowed_origin(origin);
        accepted += 1;
    }

    if accepted == 0 {
        warn!("No valid CORS origins configured; cross-origin requests will be blocked");
    } else {
        debug!(origins = accepted, "CORS middleware configured");
    }

    cors.supports_credentials()
        .allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_headers(vec![
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("dpop"),
            HeaderName::from_static("x-csrf-token"),
        ])
        .max_age(3600)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App, HttpResponse};

    async fn test_handler() -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    #[actix_web::test]
    async fn test_cors_allows_listed_origin() {
        let app = test::init_service(
            App::new()
                .wrap(cors(&["http://localhost:3000".to_string()], false))
                .route("/test", web::get().to(test_handler)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/test")
            .insert_header(("Origin", "http://localhost:3000"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
    }

    #[actix_web::test]
    async fn test_cors_blocks_unlisted_origin() {
        let app = test::init_service(
            App::new()
                .wrap(cors(&["http://localhost:3000".to_string()], false))
                .route("/test", web::get().to(test_handler)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/test")
            .insert_header(("Origin", "http://evil.example"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(!resp.headers().contains_key("access-control-allow-origin"));
    }

    #[core::prelude::v1::test]
    fn test_cors_refuses_wildcard_and_http_in_https_mode() {
        // Construction must not panic; refused origins are only logged
        let _ = cors(&["*".to_string(), "http://plain.example".to_string()], true);
    }
}

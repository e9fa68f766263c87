//! Health check and observability endpoints

use crate::state::AppState;
use actix_web::{web, HttpResponse, Responder};
use serde::Serialize;
use utoipa::ToSchema;

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub active_sessions: u64,
    pub active_challenges: u64,
    pub version: String,
}

/// Health check endpoint
///
/// Reports liveness plus session store reachability and counts.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Store backend unreachable", body = HealthResponse)
    )
)]
pub async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let health = state.store.health().await;

    let response = HealthResponse {
        status: if health.ok { "healthy" } else { "unhealthy" }.to_string(),
        store: health.backend.to_string(),
        active_sessions: health.active_sessions,
        active_challenges: health.active_challenges,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    if health.ok {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

/// OpenAPI JSON endpoint
///
/// Public machine-readable description of the authentication surface.
#[utoipa::path(
    get,
    path = "/api/v1/openapi.json",
    tag = "Discovery",
    responses(
        (status = 200, description = "OpenAPI specification", content_type = "application/json")
    )
)]
pub async fn openapi_json() -> impl Responder {
    use utoipa::OpenApi;

    HttpResponse::Ok().content_type("application/json").body(
        crate::openapi::ApiDoc::openapi()
            .to_json()
            .unwrap_or_else(|_| "{}".to_string()),
    )
}

/// Prometheus metrics exposition
pub async fn metrics(state: web::Data<AppState>) -> impl Responder {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            store: "memory".to_string(),
            active_sessions: 3,
            active_challenges: 1,
            version: "0.1.0".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("\"active_sessions\":3"));
    }
}

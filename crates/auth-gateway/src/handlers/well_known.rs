//! Discovery endpoints

use crate::models::ErrorEnvelope;
use crate::state::AppState;
use actix_web::{web, HttpResponse, Responder};
use shared::WcsapErrorCode;

/// Publish the JWT public key set
///
/// Sibling services verify access tokens against these keys without
/// any shared secret. Only served in JWT mode.
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    tag = "Discovery",
    responses(
        (status = 200, description = "JSON Web Key Set"),
        (status = 404, description = "Service runs in opaque-token mode", body = ErrorEnvelope)
    )
)]
pub async fn jwks(state: web::Data<AppState>) -> impl Responder {
    match &state.jwt {
        Some(jwt) => HttpResponse::Ok().json(jwt.jwks()),
        None => HttpResponse::NotFound().json(ErrorEnvelope::new(
            WcsapErrorCode::SessionNotFound,
            "JWKS is only published in JWT token mode",
        )),
    }
}

//! OpenAPI document

use utoipa::OpenApi;

/// Aggregated API documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "W-CSAP Authentication Gateway",
        description = "Wallet-based Cryptographic Session Assertion Protocol: \
                       challenge/response authentication bound to possession of a \
                       blockchain wallet key, with sender-constrained tokens, \
                       revocation and per-wallet rate limiting.",
    ),
    paths(
        crate::handlers::auth::challenge,
        crate::handlers::auth::verify,
        crate::handlers::auth::refresh,
        crate::handlers::auth::logout,
        crate::handlers::auth::status,
        crate::handlers::auth::sessions,
        crate::handlers::auth::stats,
        crate::handlers::auth::pow_challenge,
        crate::handlers::auth::rate_limit_status,
        crate::handlers::health::health_check,
        crate::handlers::health::openapi_json,
        crate::handlers::well_known::jwks,
    ),
    components(schemas(
        crate::models::ChallengeRequest,
        crate::models::ChallengeResponse,
        crate::models::VerifyRequest,
        crate::models::VerifyResponse,
        crate::models::RefreshRequest,
        crate::models::SessionPayload,
        crate::models::SessionSummary,
        crate::models::SessionsResponse,
        crate::models::StatusResponse,
        crate::models::LogoutResponse,
        crate::models::PowChallengeResponse,
        crate::models::ErrorEnvelope,
        crate::models::ErrorBody,
        crate::handlers::health::HealthResponse,
    )),
    tags(
        (name = "Authentication", description = "Challenge/response wallet authentication"),
        (name = "Health", description = "Liveness and store health"),
        (name = "Discovery", description = "Key material discovery"),
    )
)]
pub struct ApiDoc;

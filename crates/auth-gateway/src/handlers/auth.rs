//! Authentication handlers
//!
//! The HTTP face of the protocol: challenge issuance, signature
//! verification, session refresh, logout, principal introspection and
//! aggregate statistics. Handlers stay thin; every decision lives in
//! the services they compose.

use crate::handlers::helpers::{bearer_token, current_principal, request_client};
use crate::models::{
    dpop_error_response, error_response, ChallengeRequest, ChallengeResponse, ErrorEnvelope,
    LogoutResponse, PowChallengeResponse, RefreshRequest, SessionPayload, SessionSummary,
    SessionsResponse, StatusResponse, VerifyRequest, VerifyResponse,
};
use crate::services::rate_limiter::{RateLimitAction, RateLimitDecision};
use crate::services::tokens::TokenManager;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use shared::WcsapErrorCode;
use validator::Validate;

/// 429 response carrying the standard rate-limit headers
fn rate_limited_response(limit: u32, decision: &RateLimitDecision) -> HttpResponse {
    let mut builder = HttpResponse::TooManyRequests();
    builder.insert_header(("X-RateLimit-Limit", limit.to_string()));
    builder.insert_header(("X-RateLimit-Remaining", decision.remaining.to_string()));
    if let Some(retry_after) = decision.retry_after {
        builder.insert_header(("Retry-After", retry_after.to_string()));
    }
    builder.json(ErrorEnvelope::new(
        WcsapErrorCode::RateLimitExceeded,
        decision.reason.clone(),
    ))
}

fn validation_response(field: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(
        ErrorEnvelope::new(WcsapErrorCode::InvalidWalletAddress, "Invalid wallet address")
            .with_field(field),
    )
}

/// Issue an authentication challenge
///
/// Step 1 of the flow: the wallet requests a challenge message to sign.
#[utoipa::path(
    post,
    path = "/auth/challenge",
    tag = "Authentication",
    request_body = ChallengeRequest,
    responses(
        (status = 200, description = "Challenge issued", body = ChallengeResponse),
        (status = 400, description = "Invalid wallet address", body = ErrorEnvelope),
        (status = 429, description = "Rate limited", body = ErrorEnvelope)
    )
)]
pub async fn challenge(
    state: web::Data<AppState>,
    http_req: HttpRequest,
    req: web::Json<ChallengeRequest>,
) -> impl Responder {
    if req.validate().is_err() {
        return validation_response("wallet_address");
    }

    let client = request_client(&http_req);

    if let Err(throttled) = state.ip_limiter.check(client.ip_or_unknown()) {
        let mut builder = HttpResponse::TooManyRequests();
        builder.insert_header(("Retry-After", throttled.retry_after_secs.to_string()));
        return builder.json(ErrorEnvelope::new(
            WcsapErrorCode::RateLimitExceeded,
            throttled.message,
        ));
    }

    // Proof-of-work gate ahead of any stateful work
    if state.config.pow.enabled {
        let (Some(pow_challenge), Some(pow_nonce), Some(pow_difficulty)) = (
            req.pow_challenge.as_deref(),
            req.pow_nonce.as_deref(),
            req.pow_difficulty,
        ) else {
            return HttpResponse::TooManyRequests().json(ErrorEnvelope::new(
                WcsapErrorCode::RateLimitExceeded,
                "Proof-of-work solution required; request one at /auth/pow",
            ));
        };

        if let Err(reason) = state.pow.verify(pow_challenge, pow_nonce, pow_difficulty) {
            return HttpResponse::TooManyRequests().json(ErrorEnvelope::new(
                WcsapErrorCode::RateLimitExceeded,
                format!("Proof-of-work rejected: {}", reason),
            ));
        }
    }

    let decision = state
        .rate_limiter
        .check(&req.wallet_address, RateLimitAction::ChallengeRequest)
        .await;
    if !decision.allowed {
        return rate_limited_response(state.config.rate_limit.challenge_per_hour, &decision);
    }

    let challenge = match state
        .authenticator
        .initiate(&req.wallet_address, client.ip(), client.ua())
        .await
    {
        Ok(challenge) => challenge,
        Err(e) => return error_response(&e),
    };

    state
        .rate_limiter
        .record(&challenge.wallet_address, RateLimitAction::ChallengeRequest, true)
        .await;

    let now = chrono::Utc::now().timestamp();
    HttpResponse::Ok().json(ChallengeResponse {
        success: true,
        challenge_id: challenge.challenge_id,
        wallet_address: challenge.wallet_address,
        challenge_message: challenge.challenge_message,
        nonce: challenge.nonce,
        issued_at: challenge.issued_at,
        expires_at: challenge.expires_at,
        expires_in: (challenge.expires_at - now).max(0),
    })
}

/// Complete authentication with a signed challenge
///
/// Step 2: verifies the signature against the exact challenge message
/// and mints a session. With DPoP enabled the request must carry a
/// proof; the minted token is bound to the proof's key.
#[utoipa::path(
    post,
    path = "/auth/verify",
    tag = "Authentication",
    request_body = VerifyRequest,
    responses(
        (status = 200, description = "Authenticated", body = VerifyResponse),
        (status = 401, description = "Verification failed", body = ErrorEnvelope),
        (status = 404, description = "Challenge not found or expired", body = ErrorEnvelope),
        (status = 429, description = "Rate limited or locked out", body = ErrorEnvelope)
    )
)]
pub async fn verify(
    state: web::Data<AppState>,
    http_req: HttpRequest,
    req: web::Json<VerifyRequest>,
) -> impl Responder {
    if req.validate().is_err() {
        return validation_response("wallet_address");
    }

    let client = request_client(&http_req);

    if let Err(throttled) = state.ip_limiter.check(client.ip_or_unknown()) {
        let mut builder = HttpResponse::TooManyRequests();
        builder.insert_header(("Retry-After", throttled.retry_after_secs.to_string()));
        return builder.json(ErrorEnvelope::new(
            WcsapErrorCode::RateLimitExceeded,
            throttled.message,
        ));
    }

    let decision = state
        .rate_limiter
        .check(&req.wallet_address, RateLimitAction::VerifyAttempt)
        .await;
    if !decision.allowed {
        return rate_limited_response(state.config.rate_limit.verify_per_hour, &decision);
    }
    state
        .rate_limiter
        .record(&req.wallet_address, RateLimitAction::VerifyAttempt, true)
        .await;

    // Sender-constraining: the verification request carries the DPoP
    // proof whose key the token gets bound to
    let cnf_jkt = match &state.dpop {
        Some(dpop) => {
            let Some(proof_header) = http_req.headers().get("DPoP").and_then(|h| h.to_str().ok())
            else {
                return dpop_error_response("Missing DPoP proof");
            };
            let info = http_req.connection_info();
            let url = format!("{}://{}{}", info.scheme(), info.host(), http_req.path());
            match dpop.validate(proof_header, http_req.method().as_str(), &url, None, None) {
                Ok(proof) => Some(proof.jkt),
                Err(rejection) => return dpop_error_response(rejection.to_string()),
            }
        }
        None => None,
    };

    let session = match state
        .authenticator
        .complete(
            &req.challenge_id,
            &req.signature,
            &req.wallet_address,
            cnf_jkt.as_deref(),
            client.ip(),
            client.ua(),
        )
        .await
    {
        Ok(session) => session,
        Err(e) => {
            if e.code() == WcsapErrorCode::InvalidSignature {
                state
                    .rate_limiter
                    .record(&req.wallet_address, RateLimitAction::FailedAuth, false)
                    .await;
            }
            return error_response(&e);
        }
    };

    state
        .rate_limiter
        .record(&session.wallet_address, RateLimitAction::LoginSuccess, true)
        .await;

    HttpResponse::Ok().json(VerifyResponse {
        success: true,
        message: "Authentication successful".to_string(),
        session: SessionPayload::from_session(&session, cnf_jkt.is_some()),
    })
}

/// Rotate a session with a refresh token
///
/// The old session token only needs to be format-valid (it may be
/// expired); the refresh token must match its assertion binding.
#[utoipa::path(
    post,
    path = "/auth/refresh",
    tag = "Authentication",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Session rotated", body = VerifyResponse),
        (status = 401, description = "Invalid refresh token", body = ErrorEnvelope),
        (status = 429, description = "Rate limited", body = ErrorEnvelope)
    )
)]
pub async fn refresh(
    state: web::Data<AppState>,
    req: web::Json<RefreshRequest>,
) -> impl Responder {
    // Rate-limit by the wallet named in the (unverified) old token;
    // unparseable tokens fail verification immediately afterwards
    if let Some((wallet, _)) = TokenManager::parse_unverified(&req.session_token) {
        let decision = state
            .rate_limiter
            .check(&wallet, RateLimitAction::RefreshRequest)
            .await;
        if !decision.allowed {
            return rate_limited_response(state.config.rate_limit.refresh_per_hour, &decision);
        }
        state
            .rate_limiter
            .record(&wallet, RateLimitAction::RefreshRequest, true)
            .await;
    }

    match state
        .authenticator
        .refresh(&req.session_token, &req.refresh_token)
        .await
    {
        Ok(session) => HttpResponse::Ok().json(VerifyResponse {
            success: true,
            message: "Session refreshed".to_string(),
            session: SessionPayload::from_session(&session, false),
        }),
        Err(e) => error_response(&e),
    }
}

/// Revoke the current session
#[utoipa::path(
    post,
    path = "/auth/logout",
    tag = "Authentication",
    responses(
        (status = 200, description = "Session revoked", body = LogoutResponse),
        (status = 401, description = "Not authenticated", body = ErrorEnvelope)
    )
)]
pub async fn logout(state: web::Data<AppState>, http_req: HttpRequest) -> impl Responder {
    let Some(token) = bearer_token(&http_req) else {
        return error_response(&shared::Error::auth(
            WcsapErrorCode::Unauthorized,
            "Missing bearer token",
        ));
    };

    match state.authenticator.logout(&token).await {
        Ok(_) => HttpResponse::Ok().json(LogoutResponse {
            success: true,
            message: "Session revoked".to_string(),
        }),
        Err(e) => error_response(&e),
    }
}

/// Report the current principal
///
/// Token failures report `authenticated: false` rather than an error;
/// a missing or invalid DPoP proof (when enabled) is a hard 401 so
/// clients learn the binding requirement.
#[utoipa::path(
    get,
    path = "/auth/status",
    tag = "Authentication",
    responses(
        (status = 200, description = "Authentication status", body = StatusResponse),
        (status = 401, description = "DPoP proof missing or invalid", body = ErrorEnvelope)
    )
)]
pub async fn status(state: web::Data<AppState>, http_req: HttpRequest) -> impl Responder {
    let Some(token) = bearer_token(&http_req) else {
        return HttpResponse::Ok().json(StatusResponse::anonymous());
    };

    let principal = match state.authenticator.authenticate(&token).await {
        Ok(principal) => principal,
        Err(_) => return HttpResponse::Ok().json(StatusResponse::anonymous()),
    };

    if let Some(dpop) = &state.dpop {
        let Some(proof_header) = http_req.headers().get("DPoP").and_then(|h| h.to_str().ok())
        else {
            return dpop_error_response("Missing DPoP proof");
        };
        let info = http_req.connection_info();
        let url = format!("{}://{}{}", info.scheme(), info.host(), http_req.path());
        if let Err(rejection) = dpop.validate(
            proof_header,
            http_req.method().as_str(),
            &url,
            Some(&token),
            principal.cnf_jkt.as_deref(),
        ) {
            return dpop_error_response(rejection.to_string());
        }
    }

    HttpResponse::Ok().json(StatusResponse {
        authenticated: true,
        wallet_address: Some(principal.wallet_address),
        assertion_id: Some(principal.assertion_id),
        expires_in: Some(principal.expires_in),
        scope: Some(principal.scope),
    })
}

/// List the wallet's active sessions
#[utoipa::path(
    get,
    path = "/auth/sessions",
    tag = "Authentication",
    responses(
        (status = 200, description = "Active sessions", body = SessionsResponse),
        (status = 401, description = "Not authenticated", body = ErrorEnvelope)
    )
)]
pub async fn sessions(state: web::Data<AppState>, http_req: HttpRequest) -> impl Responder {
    let principal = match current_principal(&http_req, &state).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };

    let sessions = state
        .store
        .sessions_by_wallet(&principal.wallet_address, true)
        .await;

    let summaries: Vec<SessionSummary> = sessions
        .iter()
        .map(|s| SessionSummary::from_session(s, &principal.assertion_id))
        .collect();

    HttpResponse::Ok().json(SessionsResponse {
        success: true,
        wallet_address: principal.wallet_address,
        count: summaries.len(),
        sessions: summaries,
    })
}

/// Aggregate service counters (public)
#[utoipa::path(
    get,
    path = "/auth/stats",
    tag = "Authentication",
    responses(
        (status = 200, description = "Aggregate counters")
    )
)]
pub async fn stats(state: web::Data<AppState>) -> impl Responder {
    use shared::models::AuthEventType;

    let store = state.store.health().await;
    let revocation = state.revocation.stats().await;

    let (challenges_ok, _) = state.audit.count_by_type(AuthEventType::ChallengeIssued);
    let (logins, _) = state.audit.count_by_type(AuthEventType::ChallengeVerified);
    let (_, failures) = state.audit.count_by_type(AuthEventType::AuthenticationFailed);
    let (refreshes, _) = state.audit.count_by_type(AuthEventType::SessionRefreshed);
    let (revocations, _) = state.audit.count_by_type(AuthEventType::SessionRevoked);

    let mut body = serde_json::json!({
        "success": true,
        "store": store,
        "revocation": revocation,
        "auth": {
            "challenges_issued": challenges_ok,
            "logins": logins,
            "failures": failures,
            "refreshes": refreshes,
            "revocations": revocations,
            "events_recorded": state.audit.total_recorded(),
        },
    });

    if state.config.pow.enabled {
        body["pow"] = serde_json::to_value(state.pow.stats()).unwrap_or_default();
    }

    HttpResponse::Ok().json(body)
}

/// Issue a proof-of-work challenge
#[utoipa::path(
    get,
    path = "/auth/pow",
    tag = "Authentication",
    responses(
        (status = 200, description = "PoW challenge issued", body = PowChallengeResponse),
        (status = 404, description = "PoW gate disabled", body = ErrorEnvelope)
    )
)]
pub async fn pow_challenge(state: web::Data<AppState>) -> impl Responder {
    if !state.config.pow.enabled {
        return HttpResponse::NotFound().json(ErrorEnvelope::new(
            WcsapErrorCode::ChallengeNotFound,
            "Proof-of-work gate is not enabled",
        ));
    }

    let (challenge, difficulty) = state.pow.issue();
    HttpResponse::Ok().json(PowChallengeResponse {
        success: true,
        challenge,
        difficulty,
        expires_in: state.config.pow.challenge_ttl,
    })
}

/// Per-wallet rate limiter diagnostics
#[utoipa::path(
    get,
    path = "/auth/rate-limit/{wallet}",
    tag = "Authentication",
    params(("wallet" = String, Path, description = "Wallet address")),
    responses(
        (status = 200, description = "Rate limit status")
    )
)]
pub async fn rate_limit_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let status = state.rate_limiter.status(&path.into_inner()).await;
    HttpResponse::Ok().json(serde_json::json!({ "success": true, "status": status }))
}

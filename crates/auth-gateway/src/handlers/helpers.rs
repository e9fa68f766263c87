//! Request plumbing shared by the auth handlers
//!
//! Extracts client metadata and resolves the authenticated principal
//! from the `Authorization` header, composing token verification, DPoP
//! proof validation and the revocation check in that order.

use crate::models::{dpop_error_response, error_response};
use crate::services::authenticator::AuthenticatedPrincipal;
use crate::services::dpop::compute_ath;
use crate::state::AppState;
use actix_web::{HttpRequest, HttpResponse};
use shared::{Error, WcsapErrorCode};
use std::net::IpAddr;
use std::str::FromStr;
use tracing::debug;

/// Client metadata recorded in challenges, sessions and audit events
#[derive(Debug, Clone, Default)]
pub struct RequestClient {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestClient {
    pub fn ip(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    pub fn ua(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// IP for rate limiting; "unknown" when undeterminable
    pub fn ip_or_unknown(&self) -> &str {
        self.ip_address.as_deref().unwrap_or("unknown")
    }
}

/// Extract the client IP (first valid `X-Forwarded-For` entry, falling
/// back to the peer address) and the user agent
pub fn request_client(req: &HttpRequest) -> RequestClient {
    let forwarded = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| IpAddr::from_str(ip).is_ok())
        .map(str::to_string);

    let ip_address = forwarded.or_else(|| req.peer_addr().map(|addr| addr.ip().to_string()));

    let user_agent = req
        .headers()
        .get("User-Agent")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    RequestClient {
        ip_address,
        user_agent,
    }
}

/// Extract the bearer token from the `Authorization` header. Both
/// `Bearer` and `DPoP` token types are accepted; which one is required
/// is decided by configuration, not by the header label.
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    let header = req.headers().get("Authorization")?.to_str().ok()?;
    let (scheme, token) = header.split_once(' ')?;
    match scheme {
        "Bearer" | "DPoP" => Some(token.trim().to_string()),
        _ => None,
    }
}

/// Full request URL without query or fragment, for DPoP `htu` matching
fn request_url(req: &HttpRequest) -> String {
    let info = req.connection_info();
    format!("{}://{}{}", info.scheme(), info.host(), req.path())
}

/// Resolve the authenticated principal for a protected request.
///
/// Order: bearer token verification (constant-time), DPoP proof when
/// enabled (JKT binding, htm/htu, ath, replay), then revocation via the
/// authenticator. Returns a ready error response on failure so handlers
/// stay declarative.
pub async fn current_principal(
    req: &HttpRequest,
    state: &AppState,
) -> Result<AuthenticatedPrincipal, HttpResponse> {
    let Some(token) = bearer_token(req) else {
        let err = Error::auth(WcsapErrorCode::Unauthorized, "Missing bearer token");
        return Err(if state.dpop.is_some() {
            dpop_error_response(err.to_string())
        } else {
            error_response(&err)
        });
    };

    let principal = state
        .authenticator
        .authenticate(&token)
        .await
        .map_err(|e| error_response(&e))?;

    if let Some(dpop) = &state.dpop {
        let Some(proof_header) = req.headers().get("DPoP").and_then(|h| h.to_str().ok()) else {
            return Err(dpop_error_response("Missing DPoP proof"));
        };

        let proof = dpop
            .validate(
                proof_header,
                req.method().as_str(),
                &request_url(req),
                Some(&token),
                principal.cnf_jkt.as_deref(),
            )
            .map_err(|rejection| dpop_error_response(rejection.to_string()))?;

        let ath = compute_ath(&token);
        debug!(
            jkt = %&proof.jkt[..16],
            ath = %&ath[..16],
            "DPoP proof accepted"
        );
    }

    Ok(principal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_bearer_token_extraction() {
        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer abc.def.ghi"))
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("abc.def.ghi"));

        let req = TestRequest::default()
            .insert_header(("Authorization", "DPoP xyz"))
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("xyz"));
    }

    #[test]
    fn test_bearer_token_rejects_other_schemes() {
        let req = TestRequest::default()
            .insert_header(("Authorization", "Basic dXNlcjpwYXNz"))
            .to_http_request();
        assert!(bearer_token(&req).is_none());

        let req = TestRequest::default().to_http_request();
        assert!(bearer_token(&req).is_none());
    }

    #[test]
    fn test_request_client_prefers_forwarded_for() {
        let req = TestRequest::default()
            .peer_addr("10.0.0.1:9999".parse().unwrap())
            .insert_header(("X-Forwarded-For", "203.0.113.45, 10.0.0.1"))
            .insert_header(("User-Agent", "wallet-app/2.1"))
            .to_http_request();

        let client = request_client(&req);
        assert_eq!(client.ip(), Some("203.0.113.45"));
        assert_eq!(client.ua(), Some("wallet-app/2.1"));
    }

    #[test]
    fn test_request_client_ignores_invalid_forwarded_for() {
        let req = TestRequest::default()
            .peer_addr("10.0.0.1:9999".parse().unwrap())
            .insert_header(("X-Forwarded-For", "not-an-ip"))
            .to_http_request();

        let client = request_client(&req);
        assert_eq!(client.ip(), Some("10.0.0.1"));
    }

    #[test]
    fn test_ip_or_unknown_fallback() {
        let client = RequestClient::default();
        assert_eq!(client.ip_or_unknown(), "unknown");
    }
}

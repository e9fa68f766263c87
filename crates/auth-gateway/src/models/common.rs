//! Wire envelope shared by every error response
//!
//! ```json
//! { "success": false,
//!   "error": { "code": "...", "message": "...", "field": "...", "details": {...} },
//!   "timestamp": 1700000000 }
//! ```
//!
//! Codes are the stable `WcsapErrorCode` set; the HTTP status is always
//! derived from the code so the two can never drift apart.

use actix_web::http::header;
use actix_web::HttpResponse;
use serde::{Deserialize, Serialize};
use shared::{Error, WcsapErrorCode};
use utoipa::ToSchema;

/// Error detail inside the envelope
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Standard error envelope
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
    pub timestamp: i64,
}

impl ErrorEnvelope {
    pub fn new(code: WcsapErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: ErrorBody {
                code: code.as_str().to_string(),
                message: message.into(),
                field: None,
                details: None,
            },
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.error.field = Some(field.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }
}

/// Build the HTTP response for a core error. 401 responses carry the
/// appropriate `WWW-Authenticate` challenge.
pub fn error_response(err: &Error) -> HttpResponse {
    respond(err.code(), err.to_string(), false)
}

/// Variant for requests rejected at the DPoP layer
pub fn dpop_error_response(message: impl Into<String>) -> HttpResponse {
    respond(WcsapErrorCode::Unauthorized, message.into(), true)
}

/// 403 for operations that need step-up authentication. The headers let
/// the client drive its re-authentication UI.
pub fn step_up_required_response(
    required: &crate::services::access_control::StepUpRequired,
) -> HttpResponse {
    HttpResponse::Forbidden()
        .insert_header(("X-Step-Up-Required", "true"))
        .insert_header(("X-Step-Up-Operation", required.operation.as_str()))
        .insert_header(("X-Step-Up-Risk-Level", required.risk.as_str()))
        .json(ErrorEnvelope::new(
            WcsapErrorCode::Unauthorized,
            "Step-up authentication required",
        ))
}

fn respond(code: WcsapErrorCode, message: String, dpop: bool) -> HttpResponse {
    let envelope = ErrorEnvelope::new(code, message);
    let status = actix_web::http::StatusCode::from_u16(code.http_status())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);

    let mut builder = HttpResponse::build(status);
    if status == actix_web::http::StatusCode::UNAUTHORIZED {
        builder.insert_header((
            header::WWW_AUTHENTICATE,
            if dpop { "DPoP" } else { "Bearer" },
        ));
    }
    builder.json(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let envelope = ErrorEnvelope::new(WcsapErrorCode::InvalidSignature, "Invalid signature");
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "INVALID_SIGNATURE");
        assert_eq!(json["error"]["message"], "Invalid signature");
        assert!(json["error"].get("field").is_none());
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_envelope_optional_fields() {
        let envelope = ErrorEnvelope::new(WcsapErrorCode::InvalidWalletAddress, "Bad address")
            .with_field("wallet_address")
            .with_details(serde_json::json!({"length": 10}));
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["error"]["field"], "wallet_address");
        assert_eq!(json["error"]["details"]["length"], 10);
    }

    #[test]
    fn test_error_response_status_from_code() {
        let err = Error::auth(WcsapErrorCode::InvalidSignature, "Invalid signature");
        let resp = error_response(&err);
        assert_eq!(resp.status(), 401);
        assert_eq!(
            resp.headers().get("www-authenticate").unwrap(),
            "Bearer"
        );

        let err = Error::rate_limited("Hourly rate limit exceeded");
        assert_eq!(error_response(&err).status(), 429);

        let err = Error::auth(WcsapErrorCode::ChallengeNotFound, "Challenge not found");
        assert_eq!(error_response(&err).status(), 404);
    }

    #[test]
    fn test_dpop_error_response_challenge_header() {
        let resp = dpop_error_response("JWK thumbprint mismatch");
        assert_eq!(resp.status(), 401);
        assert_eq!(resp.headers().get("www-authenticate").unwrap(), "DPoP");
    }

    #[test]
    fn test_step_up_response_headers() {
        use crate::services::access_control::{OperationClassifier, StepUpManager};

        let manager = StepUpManager::new();
        let classification = OperationClassifier::classify("withdrawal", None, None);
        let required = manager
            .enforce("0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0", &classification)
            .unwrap_err();

        let resp = step_up_required_response(&required);
        assert_eq!(resp.status(), 403);
        assert_eq!(resp.headers().get("x-step-up-required").unwrap(), "true");
        assert_eq!(
            resp.headers().get("x-step-up-operation").unwrap(),
            "withdrawal"
        );
        assert_eq!(resp.headers().get("x-step-up-risk-level").unwrap(), "high");
    }
}

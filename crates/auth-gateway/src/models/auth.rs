//! Authentication DTOs

use serde::{Deserialize, Serialize};
use shared::models::SessionAssertion;
use utoipa::ToSchema;
use validator::Validate;

/// Challenge issuance request
#[derive(Debug, Deserialize, Validate, ToSchema)]
#[schema(example = json!({"wallet_address": "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0"}))]
pub struct ChallengeRequest {
    #[validate(length(equal = 42))]
    pub wallet_address: String,

    /// Required when the proof-of-work gate is enabled
    #[serde(default)]
    pub pow_challenge: Option<String>,
    #[serde(default)]
    pub pow_nonce: Option<String>,
    #[serde(default)]
    pub pow_difficulty: Option<u32>,
}

/// Challenge issuance response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChallengeResponse {
    pub success: bool,
    pub challenge_id: String,
    pub wallet_address: String,
    /// The exact text to sign with the wallet
    pub challenge_message: String,
    pub nonce: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub expires_in: i64,
}

/// Signature verification request.
///
/// Only the wallet address is shape-checked here; challenge ids resolve
/// through the store (absent means not found) and signatures go through
/// the fail-closed verifier, so malformed values surface as the same
/// errors as wrong ones.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct VerifyRequest {
    pub challenge_id: String,

    pub signature: String,

    #[validate(length(equal = 42))]
    pub wallet_address: String,
}

/// Session material returned on verify and refresh
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionPayload {
    pub assertion_id: String,
    pub wallet_address: String,
    pub session_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub issued_at: i64,
    pub not_before: i64,
    pub expires_at: i64,
    pub expires_in: i64,
}

impl SessionPayload {
    pub fn from_session(session: &SessionAssertion, dpop_bound: bool) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            assertion_id: session.assertion_id.clone(),
            wallet_address: session.wallet_address.clone(),
            session_token: session.session_token.clone(),
            refresh_token: session.refresh_token.clone(),
            token_type: if dpop_bound { "DPoP" } else { "Bearer" }.to_string(),
            issued_at: session.issued_at,
            not_before: session.not_before,
            expires_at: session.expires_at,
            expires_in: (session.expires_at - now).max(0),
        }
    }
}

/// Successful verification response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VerifyResponse {
    pub success: bool,
    pub message: String,
    pub session: SessionPayload,
}

/// Session refresh request. Empty or forged tokens fail verification
/// with `INVALID_REFRESH_TOKEN`; no shape check is needed here.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RefreshRequest {
    pub refresh_token: String,

    pub session_token: String,
}

/// Current principal, as reported by `/auth/status`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assertion_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl StatusResponse {
    pub fn anonymous() -> Self {
        Self {
            authenticated: false,
            wallet_address: None,
            assertion_id: None,
            expires_in: None,
            scope: None,
        }
    }
}

/// One active session in the sessions listing. Token material is never
/// echoed back.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionSummary {
    pub assertion_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub last_activity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub current: bool,
}

impl SessionSummary {
    pub fn from_session(session: &SessionAssertion, current_assertion: &str) -> Self {
        Self {
            assertion_id: session.assertion_id.clone(),
            issued_at: session.issued_at,
            expires_at: session.expires_at,
            last_activity: session.last_activity,
            ip_address: session.metadata.ip_address.clone(),
            user_agent: session.metadata.user_agent.clone(),
            current: session.assertion_id == current_assertion,
        }
    }
}

/// Active sessions listing
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionsResponse {
    pub success: bool,
    pub wallet_address: String,
    pub sessions: Vec<SessionSummary>,
    pub count: usize,
}

/// Logout acknowledgement
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LogoutResponse {
    pub success: bool,
    pub message: String,
}

/// Proof-of-work challenge issuance
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PowChallengeResponse {
    pub success: bool,
    pub challenge: String,
    pub difficulty: u32,
    pub expires_in: u64,
}

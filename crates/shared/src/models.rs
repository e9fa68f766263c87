//! Core data model for the W-CSAP protocol
//!
//! Challenges and session assertions are owned by the session store; the
//! structs here are their canonical wire form. Records carry an explicit
//! schema version and reject unknown fields so a tampered or foreign blob
//! can never round-trip silently.

use serde::{Deserialize, Serialize};

/// Current wire schema version for persisted records
pub const WIRE_VERSION: u32 = 1;

fn default_wire_version() -> u32 {
    WIRE_VERSION
}

/// Lifecycle state of a challenge. Transitions are one-way:
/// `Pending -> Used` or `Pending -> Expired`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Used,
    Expired,
}

/// Request metadata captured alongside challenges and sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// A one-time nonce envelope bound to a wallet address.
///
/// The `challenge_message` is the exact text the user signs in their
/// wallet; signature verification runs against it byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Challenge {
    #[serde(default = "default_wire_version")]
    pub v: u32,
    pub challenge_id: String,
    pub wallet_address: String,
    pub challenge_message: String,
    pub nonce: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub status: ChallengeStatus,
    pub app_name: String,
    pub protocol_version: String,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

impl Challenge {
    /// Check whether the challenge has passed its expiry
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

/// Session-level metadata recorded at mint time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionMetadata {
    pub auth_method: String,
    pub protocol: String,
    pub version: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Assertion this session was refreshed from, if any
    #[serde(default)]
    pub refreshed_from: Option<String>,
}

impl SessionMetadata {
    pub fn new(protocol_version: &str) -> Self {
        Self {
            auth_method: "wallet_signature".to_string(),
            protocol: "W-CSAP".to_string(),
            version: protocol_version.to_string(),
            ip_address: None,
            user_agent: None,
            refreshed_from: None,
        }
    }
}

/// Proof of a successful authentication.
///
/// Uniquely owned by the session store; `assertion_id` is the join key
/// used by the revocation cache and the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionAssertion {
    #[serde(default = "default_wire_version")]
    pub v: u32,
    pub assertion_id: String,
    pub wallet_address: String,
    pub issued_at: i64,
    pub not_before: i64,
    pub expires_at: i64,
    /// Updated on authenticated reads; the only mutable field
    pub last_activity: i64,
    pub session_token: String,
    pub refresh_token: String,
    /// The signature that produced this session, retained for audit
    pub signature: String,
    pub metadata: SessionMetadata,
}

impl SessionAssertion {
    /// Check temporal validity: `not_before <= now < expires_at`
    pub fn is_valid(&self, now: i64) -> bool {
        now >= self.not_before && now < self.expires_at
    }

    /// Last instant at which this session may still be refreshed
    pub fn refresh_deadline(&self, refresh_ttl: u64) -> i64 {
        self.issued_at + refresh_ttl as i64
    }
}

/// Kinds of events recorded by the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEventType {
    ChallengeIssued,
    ChallengeVerified,
    AuthenticationFailed,
    SessionRefreshed,
    SessionRevoked,
    RateLimitViolation,
    DegradedBackend,
}

impl AuthEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEventType::ChallengeIssued => "challenge_issued",
            AuthEventType::ChallengeVerified => "challenge_verified",
            AuthEventType::AuthenticationFailed => "authentication_failed",
            AuthEventType::SessionRefreshed => "session_refreshed",
            AuthEventType::SessionRevoked => "session_revoked",
            AuthEventType::RateLimitViolation => "rate_limit_violation",
            AuthEventType::DegradedBackend => "degraded_backend",
        }
    }
}

/// One append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthEvent {
    /// Assigned by the audit log at append time
    pub event_id: u64,
    pub wallet_address: String,
    pub event_type: AuthEventType,
    #[serde(default)]
    pub challenge_id: Option<String>,
    #[serde(default)]
    pub assertion_id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub created_at: i64,
}

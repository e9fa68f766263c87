//! Error types for the W-CSAP authentication core

use thiserror::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Stable, enumerated error codes surfaced in the wire envelope.
///
/// These codes are part of the public protocol contract and must not be
/// renamed. Clients switch on the string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcsapErrorCode {
    ChallengeNotFound,
    ChallengeExpired,
    InvalidSignature,
    SessionExpired,
    SessionNotFound,
    InvalidSessionToken,
    InvalidRefreshToken,
    RateLimitExceeded,
    InvalidWalletAddress,
    Unauthorized,
    InternalError,
    ConfigurationError,
}

impl WcsapErrorCode {
    /// Wire form of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            WcsapErrorCode::ChallengeNotFound => "CHALLENGE_NOT_FOUND",
            WcsapErrorCode::ChallengeExpired => "CHALLENGE_EXPIRED",
            WcsapErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            WcsapErrorCode::SessionExpired => "SESSION_EXPIRED",
            WcsapErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            WcsapErrorCode::InvalidSessionToken => "INVALID_SESSION_TOKEN",
            WcsapErrorCode::InvalidRefreshToken => "INVALID_REFRESH_TOKEN",
            WcsapErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            WcsapErrorCode::InvalidWalletAddress => "INVALID_WALLET_ADDRESS",
            WcsapErrorCode::Unauthorized => "UNAUTHORIZED",
            WcsapErrorCode::InternalError => "INTERNAL_ERROR",
            WcsapErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
        }
    }

    /// HTTP status this code maps to (400 validation, 401 auth failure,
    /// 404 not found, 429 limit, 500 internal)
    pub fn http_status(&self) -> u16 {
        match self {
            WcsapErrorCode::InvalidWalletAddress => 400,
            WcsapErrorCode::InvalidSignature
            | WcsapErrorCode::SessionExpired
            | WcsapErrorCode::InvalidSessionToken
            | WcsapErrorCode::InvalidRefreshToken
            | WcsapErrorCode::Unauthorized => 401,
            WcsapErrorCode::ChallengeNotFound
            | WcsapErrorCode::ChallengeExpired
            | WcsapErrorCode::SessionNotFound => 404,
            WcsapErrorCode::RateLimitExceeded => 429,
            WcsapErrorCode::InternalError | WcsapErrorCode::ConfigurationError => 500,
        }
    }
}

impl std::fmt::Display for WcsapErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application error types
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors (safe to report details to the client)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Authentication and authorization errors carrying a stable code.
    /// The message is the client-visible text; the full reason is logged
    /// at the point of failure, never here.
    #[error("{message}")]
    Auth {
        code: WcsapErrorCode,
        message: String,
    },

    /// Rate limiting and lockout errors
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Storage backend errors
    #[error("Store error: {0}")]
    Store(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a Config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a Validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an Auth error with a stable code
    pub fn auth(code: WcsapErrorCode, msg: impl Into<String>) -> Self {
        Self::Auth {
            code,
            message: msg.into(),
        }
    }

    /// Create a RateLimited error
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    /// Create a Store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an Internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable code for the wire envelope
    pub fn code(&self) -> WcsapErrorCode {
        match self {
            Error::Config(_) => WcsapErrorCode::ConfigurationError,
            Error::Validation(_) => WcsapErrorCode::InvalidWalletAddress,
            Error::Auth { code, .. } => *code,
            Error::RateLimited(_) => WcsapErrorCode::RateLimitExceeded,
            Error::Store(_) | Error::Internal(_) => WcsapErrorCode::InternalError,
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Store(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_form_is_stable() {
        assert_eq!(
            WcsapErrorCode::ChallengeNotFound.as_str(),
            "CHALLENGE_NOT_FOUND"
        );
        assert_eq!(
            WcsapErrorCode::InvalidSignature.as_str(),
            "INVALID_SIGNATURE"
        );
        assert_eq!(
            WcsapErrorCode::RateLimitExceeded.as_str(),
            "RATE_LIMIT_EXCEEDED"
        );
        assert_eq!(
            WcsapErrorCode::ConfigurationError.as_str(),
            "CONFIGURATION_ERROR"
        );
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(WcsapErrorCode::InvalidWalletAddress.http_status(), 400);
        assert_eq!(WcsapErrorCode::InvalidSignature.http_status(), 401);
        assert_eq!(WcsapErrorCode::InvalidSessionToken.http_status(), 401);
        assert_eq!(WcsapErrorCode::ChallengeNotFound.http_status(), 404);
        assert_eq!(WcsapErrorCode::RateLimitExceeded.http_status(), 429);
        assert_eq!(WcsapErrorCode::InternalError.http_status(), 500);
    }

    #[test]
    fn test_auth_error_carries_code() {
        let err = Error::auth(WcsapErrorCode::InvalidSignature, "Signature mismatch");
        assert_eq!(err.code(), WcsapErrorCode::InvalidSignature);
        assert_eq!(err.to_string(), "Signature mismatch");
    }

    #[test]
    fn test_rate_limited_maps_to_rate_limit_code() {
        let err = Error::rate_limited("Hourly rate limit exceeded");
        assert_eq!(err.code(), WcsapErrorCode::RateLimitExceeded);
    }

    #[test]
    fn test_store_error_maps_to_internal() {
        let err = Error::store("connection refused");
        assert_eq!(err.code(), WcsapErrorCode::InternalError);
    }
}

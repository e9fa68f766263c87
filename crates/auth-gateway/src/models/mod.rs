//! Request/response DTOs

pub mod auth;
pub mod common;

pub use auth::{
    ChallengeRequest, ChallengeResponse, LogoutResponse, PowChallengeResponse, RefreshRequest,
    SessionPayload, SessionSummary, SessionsResponse, StatusResponse, VerifyRequest,
    VerifyResponse,
};
pub use common::{
    dpop_error_response, error_response, step_up_required_response, ErrorBody, ErrorEnvelope,
};

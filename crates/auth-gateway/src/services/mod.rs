//! Protocol services
//!
//! Each module maps to one protocol concern; the authenticator composes
//! them and owns no state of its own.

pub mod access_control;
pub mod audit;
pub mod authenticator;
pub mod challenge;
pub mod crypto;
pub mod dpop;
pub mod ip_rate_limiter;
pub mod jwt_tokens;
pub mod proof_of_work;
pub mod rate_limiter;
pub mod revocation;
pub mod session_store;
pub mod signature;
pub mod tokens;

pub use access_control::{OperationClassifier, StepUpManager};
pub use audit::AuditLog;
pub use authenticator::Authenticator;
pub use challenge::ChallengeGenerator;
pub use dpop::DpopValidator;
pub use ip_rate_limiter::IpRateLimiter;
pub use jwt_tokens::JwtTokenManager;
pub use proof_of_work::PowGate;
pub use rate_limiter::WalletRateLimiter;
pub use revocation::RevocationCache;
pub use session_store::SessionStore;
pub use tokens::TokenManager;

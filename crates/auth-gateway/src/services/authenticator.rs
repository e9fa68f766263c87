//! Authentication orchestrator
//!
//! Drives the protocol state machine:
//!
//! ```text
//!         request_challenge
//! NO_AUTH ----------------> CHALLENGE_PENDING
//!                               | verify_signature
//!                               v
//!                           AUTHENTICATED --- revoke / expire --> NO_AUTH
//!                               | refresh
//!                               v
//!                           AUTHENTICATED'
//! ```
//!
//! The orchestrator owns no state of its own; it composes the store,
//! the verifier, the token managers, the revocation cache and the audit
//! log through their interfaces. Challenge consumption is atomic (the
//! store's take), and a consumed challenge is never reinstated, even
//! when the signature check then fails.
//!
//! Failure policy at the boundary: challenge absence, expiry and wallet
//! mismatch map to distinct codes; every bearer-token failure collapses
//! to `INVALID_SESSION_TOKEN` so callers cannot tell which sub-check
//! failed. Full reasons are logged internally.

use crate::services::audit::{AuditLog, EventDraft};
use crate::services::challenge::{generate_hex_id, ChallengeGenerator};
use crate::services::jwt_tokens::JwtTokenManager;
use crate::services::revocation::RevocationCache;
use crate::services::session_store::SessionStore;
use crate::services::signature::SignatureVerifier;
use crate::services::tokens::TokenManager;
use shared::models::{
    AuthEventType, Challenge, SessionAssertion, SessionMetadata, WIRE_VERSION,
};
use shared::{Error, Result, WcsapErrorCode};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The authenticated caller attached to a request
#[derive(Debug, Clone)]
pub struct AuthenticatedPrincipal {
    pub wallet_address: String,
    pub assertion_id: String,
    pub expires_at: i64,
    pub expires_in: i64,
    pub scope: String,
    /// JWK thumbprint the token is sender-constrained to, if any
    pub cnf_jkt: Option<String>,
}

/// Orchestrates challenge issuance, verification and session lifecycle
pub struct Authenticator {
    challenges: ChallengeGenerator,
    verifier: SignatureVerifier,
    store: Arc<SessionStore>,
    tokens: Arc<TokenManager>,
    jwt: Option<Arc<JwtTokenManager>>,
    revocation: Arc<RevocationCache>,
    audit: Arc<AuditLog>,
    session_ttl: u64,
    refresh_ttl: u64,
    max_active_sessions: u32,
    protocol_version: String,
}

impl Authenticator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        challenges: ChallengeGenerator,
        store: Arc<SessionStore>,
        tokens: Arc<TokenManager>,
        jwt: Option<Arc<JwtTokenManager>>,
        revocation: Arc<RevocationCache>,
        audit: Arc<AuditLog>,
        session_ttl: u64,
        refresh_ttl: u64,
        max_active_sessions: u32,
        protocol_version: &str,
    ) -> Self {
        Self {
            challenges,
            verifier: SignatureVerifier::new(),
            store,
            tokens,
            jwt,
            revocation,
            audit,
            session_ttl,
            refresh_ttl,
            max_active_sessions,
            protocol_version: protocol_version.to_string(),
        }
    }

    pub fn session_ttl(&self) -> u64 {
        self.session_ttl
    }

    pub fn uses_jwt(&self) -> bool {
        self.jwt.is_some()
    }

    // ==================== Challenge issuance ====================

    /// Step 1: issue a challenge for the wallet to sign
    pub async fn initiate(
        &self,
        wallet_address: &str,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Challenge> {
        let challenge = self.challenges.generate(wallet_address, ip_address, user_agent)?;

        self.store.put_challenge(&challenge).await?;

        self.audit.record(
            EventDraft::new(AuthEventType::ChallengeIssued, &challenge.wallet_address, true)
                .challenge(&challenge.challenge_id)
                .client(ip_address, user_agent),
        );

        debug!(
            wallet = %challenge.wallet_address,
            challenge = %&challenge.challenge_id[..16],
            "Challenge issued"
        );
        Ok(challenge)
    }

    // ==================== Verification ====================

    /// Step 2: verify the signed challenge and mint a session.
    ///
    /// The challenge is consumed atomically up front; two concurrent
    /// calls for one challenge cannot both reach the minting step.
    pub async fn complete(
        &self,
        challenge_id: &str,
        signature: &str,
        wallet_address: &str,
        cnf_jkt: Option<&str>,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<SessionAssertion> {
        let failure = |error: &str| {
            EventDraft::new(AuthEventType::AuthenticationFailed, wallet_address, false)
                .challenge(challenge_id)
                .error(error)
                .client(ip_address, user_agent)
        };

        let Some(challenge) = self.store.take_challenge(challenge_id).await else {
            self.audit.record(failure("challenge not found"));
            return Err(Error::auth(
                WcsapErrorCode::ChallengeNotFound,
                "Challenge not found",
            ));
        };

        let now = chrono::Utc::now().timestamp();
        if challenge.is_expired(now) {
            self.audit.record(failure("challenge expired"));
            return Err(Error::auth(
                WcsapErrorCode::ChallengeExpired,
                "Challenge expired",
            ));
        }

        if challenge.wallet_address.to_lowercase() != wallet_address.to_lowercase() {
            warn!(
                expected = %challenge.wallet_address,
                presented = %wallet_address,
                "Wallet mismatch on verify"
            );
            self.audit.record(failure("wallet mismatch"));
            return Err(Error::auth(
                WcsapErrorCode::InvalidSignature,
                "Invalid signature",
            ));
        }

        let check = self
            .verifier
            .verify(&challenge.challenge_message, signature, &challenge.wallet_address);
        if !check.valid {
            self.audit.record(failure("signature mismatch"));
            return Err(Error::auth(
                WcsapErrorCode::InvalidSignature,
                "Invalid signature",
            ));
        }

        let session = self
            .mint_session(
                &challenge.wallet_address,
                signature,
                cnf_jkt,
                ip_address,
                user_agent,
                None,
            )
            .await?;

        self.audit.record(
            EventDraft::new(AuthEventType::ChallengeVerified, &session.wallet_address, true)
                .challenge(challenge_id)
                .assertion(&session.assertion_id)
                .client(ip_address, user_agent),
        );
        metrics::counter!("wcsap_logins_total").increment(1);

        info!(
            wallet = %session.wallet_address,
            assertion = %&session.assertion_id[..16],
            "Authentication successful"
        );
        Ok(session)
    }

    // ==================== Bearer validation ====================

    /// Validate a session token and resolve the caller. Every failure
    /// surfaces as `INVALID_SESSION_TOKEN`; specifics are only logged.
    pub async fn authenticate(&self, session_token: &str) -> Result<AuthenticatedPrincipal> {
        let denied = || {
            Error::auth(
                WcsapErrorCode::InvalidSessionToken,
                "Invalid session token",
            )
        };
        let now = chrono::Utc::now().timestamp();

        let principal = match &self.jwt {
            Some(jwt) => {
                let claims = jwt.verify_token(session_token).map_err(|_| denied())?;
                let assertion_id = claims.assertion_id.clone().unwrap_or_default();

                if assertion_id.is_empty() {
                    warn!("JWT missing assertion_id claim");
                    return Err(denied());
                }

                AuthenticatedPrincipal {
                    wallet_address: claims.sub.clone(),
                    assertion_id,
                    expires_at: claims.exp,
                    expires_in: claims.exp - now,
                    scope: claims.scope.clone(),
                    cnf_jkt: claims.cnf.map(|c| c.jkt),
                }
            }
            None => {
                let claims = self
                    .tokens
                    .validate_session_token(session_token)
                    .await
                    .ok_or_else(denied)?;

                // Resolve the stored session for revocation and activity
                // tracking; a token without a live session is rejected
                let session = self
                    .store
                    .sessions_by_wallet(&claims.wallet_address, true)
                    .await
                    .into_iter()
                    .find(|s| s.session_token == session_token)
                    .ok_or_else(|| {
                        warn!(wallet = %claims.wallet_address, "No stored session for valid token");
                        denied()
                    })?;

                AuthenticatedPrincipal {
                    wallet_address: session.wallet_address.clone(),
                    assertion_id: session.assertion_id.clone(),
                    expires_at: claims.expires_at,
                    expires_in: claims.expires_in,
                    scope: "profile".to_string(),
                    cnf_jkt: None,
                }
            }
        };

        if self.revocation.is_revoked(&principal.assertion_id).await {
            warn!(
                assertion = %&principal.assertion_id[..principal.assertion_id.len().min(16)],
                "Rejected revoked assertion"
            );
            return Err(denied());
        }

        // Track last activity, best-effort
        if let Some(mut session) = self.store.get_session(&principal.assertion_id).await {
            if session.is_valid(now) {
                session.last_activity = now;
                let _ = self.store.put_session(&session).await;
            }
        }

        Ok(principal)
    }

    // ==================== Refresh ====================

    /// Rotate a session: the old session token only needs to be
    /// format-valid (it may be expired); the refresh token must match
    /// the MAC binding for the same assertion. The old session is
    /// invalidated and a new one minted.
    pub async fn refresh(
        &self,
        session_token: &str,
        refresh_token: &str,
    ) -> Result<SessionAssertion> {
        let denied = || {
            Error::auth(
                WcsapErrorCode::InvalidRefreshToken,
                "Invalid refresh token",
            )
        };

        // Recover the wallet from the old token, format-only
        let wallet = match &self.jwt {
            Some(_) => TokenManager::parse_unverified(session_token)
                .map(|(wallet, _)| wallet)
                .or_else(|| jwt_wallet_unverified(session_token)),
            None => TokenManager::parse_unverified(session_token).map(|(wallet, _)| wallet),
        }
        .ok_or_else(|| {
            warn!("Refresh rejected: old session token is not format-valid");
            denied()
        })?;

        let now = chrono::Utc::now().timestamp();

        // Resolve the assertion by matching the refresh binding across
        // the wallet's stored sessions (constant-time per candidate)
        let candidates = self.store.sessions_by_wallet(&wallet, false).await;
        let old = candidates
            .into_iter()
            .find(|s| {
                self.tokens
                    .verify_refresh_token(refresh_token, &s.assertion_id, &s.wallet_address)
            })
            .ok_or_else(|| {
                warn!(wallet = %wallet, "Refresh rejected: no session matches the refresh token");
                denied()
            })?;

        if now > old.refresh_deadline(self.refresh_ttl) {
            warn!(wallet = %wallet, "Refresh rejected: refresh window closed");
            return Err(denied());
        }

        if self.revocation.is_revoked(&old.assertion_id).await {
            warn!(wallet = %wallet, "Refresh rejected: assertion revoked");
            return Err(denied());
        }

        // Invalidate the old session before minting its successor
        self.store
            .revoke_session(&old.assertion_id, old.expires_at)
            .await;

        let session = self
            .mint_session(
                &old.wallet_address,
                "refreshed",
                None,
                old.metadata.ip_address.as_deref(),
                old.metadata.user_agent.as_deref(),
                Some(old.assertion_id.clone()),
            )
            .await?;

        self.audit.record(
            EventDraft::new(AuthEventType::SessionRefreshed, &session.wallet_address, true)
                .assertion(&session.assertion_id),
        );

        info!(
            wallet = %session.wallet_address,
            old_assertion = %&old.assertion_id[..16],
            new_assertion = %&session.assertion_id[..16],
            "Session refreshed"
        );
        Ok(session)
    }

    // ==================== Revocation ====================

    /// Revoke the session behind a bearer token (logout)
    pub async fn logout(&self, session_token: &str) -> Result<AuthenticatedPrincipal> {
        let principal = self.authenticate(session_token).await?;

        self.store
            .revoke_session(&principal.assertion_id, principal.expires_at)
            .await;

        self.audit.record(
            EventDraft::new(AuthEventType::SessionRevoked, &principal.wallet_address, true)
                .assertion(&principal.assertion_id),
        );

        info!(
            wallet = %principal.wallet_address,
            assertion = %&principal.assertion_id[..16],
            "Session revoked (logout)"
        );
        Ok(principal)
    }

    /// Revoke every active session for a wallet ("log out all devices")
    pub async fn revoke_all_for_wallet(&self, wallet_address: &str) -> usize {
        let sessions = self.store.sessions_by_wallet(wallet_address, false).await;
        let revoked = self
            .revocation
            .revoke_all_for_wallet(wallet_address, &sessions)
            .await;

        for session in &sessions {
            let _ = self.store.delete_session(&session.assertion_id).await;
        }

        self.audit.record(
            EventDraft::new(AuthEventType::SessionRevoked, wallet_address, true)
                .error(format!("revoked {} sessions", revoked)),
        );
        revoked
    }

    // ==================== Session minting ====================

    async fn mint_session(
        &self,
        wallet_address: &str,
        signature: &str,
        cnf_jkt: Option<&str>,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
        refreshed_from: Option<String>,
    ) -> Result<SessionAssertion> {
        let now = chrono::Utc::now().timestamp();
        let assertion_id = generate_hex_id(wallet_address);
        let expires_at = now + self.session_ttl as i64;

        let session_token = match &self.jwt {
            Some(jwt) => jwt.create_access_token(
                wallet_address,
                &assertion_id,
                "profile",
                cnf_jkt,
                ip_address,
                user_agent,
            )?,
            None => self.tokens.issue_session_token(wallet_address, expires_at),
        };
        let refresh_token = self.tokens.issue_refresh_token(&assertion_id, wallet_address);

        let mut metadata = SessionMetadata::new(&self.protocol_version);
        metadata.ip_address = ip_address.map(str::to_string);
        metadata.user_agent = user_agent.map(str::to_string);
        metadata.refreshed_from = refreshed_from;

        let session = SessionAssertion {
            v: WIRE_VERSION,
            assertion_id,
            wallet_address: wallet_address.to_string(),
            issued_at: now,
            not_before: now,
            expires_at,
            last_activity: now,
            session_token,
            refresh_token,
            signature: signature.to_string(),
            metadata,
        };

        self.enforce_session_cap(wallet_address).await;
        self.store.put_session(&session).await?;

        Ok(session)
    }

    /// Evict the oldest sessions when the per-wallet cap is reached
    async fn enforce_session_cap(&self, wallet_address: &str) {
        if self.max_active_sessions == 0 {
            return;
        }

        let sessions = self.store.sessions_by_wallet(wallet_address, true).await;
        if sessions.len() < self.max_active_sessions as usize {
            return;
        }

        // sessions_by_wallet returns oldest-first
        let excess = sessions.len() + 1 - self.max_active_sessions as usize;
        for session in sessions.into_iter().take(excess) {
            warn!(
                wallet = %wallet_address,
                assertion = %&session.assertion_id[..16],
                "Session cap reached, evicting oldest session"
            );
            self.store
                .revoke_session(&session.assertion_id, session.expires_at)
                .await;
        }
    }
}

/// Extract the subject wallet from an (unverified) JWT payload. Used
/// only to locate refresh candidates; nothing here is trusted.
fn jwt_wallet_unverified(token: &str) -> Option<String> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let payload = URL_SAFE_NO_PAD.decode(parts[1]).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&payload).ok()?;
    value.get("sub")?.as_str().map(str::to_string)
}

//! Opaque HMAC session tokens
//!
//! Token format: `<random_url_b64(32)>.<wallet_checksum>.<expires_at>.<hex_mac>`
//! where the MAC covers all three preceding fields. Any truncation,
//! field reorder or field edit fails verification.
//!
//! Verification is constant-time by construction: the token is always
//! parsed into four fields (dummies on malformed input), the expected
//! MAC is always computed, comparison uses constant-time equality, and
//! the whole check is padded to a minimum wall-clock duration so parse
//! errors, MAC mismatches and expiry are indistinguishable to a remote
//! observer.
//!
//! Refresh tokens are the shorter opaque form bound to
//! `refresh:{assertion_id}:{wallet}`.

use crate::services::crypto::{KEY_LENGTH, PBKDF2_ITERATIONS};
use crate::services::signature::normalize_address;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use shared::{Error, Result};
use std::fmt;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Minimum wall-clock duration of a token validation
const MIN_VALIDATION_TIME: Duration = Duration::from_millis(5);

/// Deterministic PBKDF2 salt for the token MAC key. Unlike the store
/// keys, token keys must survive process restarts, so the salt is a
/// fixed domain-separation constant rather than fresh randomness.
const TOKEN_KEY_SALT: &[u8] = b"w_csap:token:v1";

/// Data recovered from a valid session token
#[derive(Debug, Clone)]
pub struct SessionTokenClaims {
    pub wallet_address: String,
    pub expires_at: i64,
    pub expires_in: i64,
}

/// Issues and validates opaque HMAC tokens
pub struct TokenManager {
    mac_key: [u8; KEY_LENGTH],
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenManager([REDACTED])")
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.mac_key.iter_mut().for_each(|b| *b = 0);
    }
}

impl TokenManager {
    pub fn new(secret_key: &str) -> Result<Self> {
        if secret_key.len() < 32 {
            return Err(Error::config(
                "Token secret must be at least 32 characters",
            ));
        }

        let mut mac_key = [0u8; KEY_LENGTH];
        pbkdf2_hmac::<Sha256>(
            secret_key.as_bytes(),
            TOKEN_KEY_SALT,
            PBKDF2_ITERATIONS,
            &mut mac_key,
        );

        Ok(Self { mac_key })
    }

    /// Mint a session token for a checksummed wallet address
    pub fn issue_session_token(&self, wallet_address: &str, expires_at: i64) -> String {
        let mut random_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut random_bytes);
        let random = URL_SAFE_NO_PAD.encode(random_bytes);

        let mac = self.token_mac(&random, wallet_address, expires_at);
        format!("{}.{}.{}.{}", random, wallet_address, expires_at, mac)
    }

    /// Mint the refresh token bound to an assertion and wallet
    pub fn issue_refresh_token(&self, assertion_id: &str, wallet_address: &str) -> String {
        self.refresh_mac(assertion_id, wallet_address)
    }

    /// Validate a session token. Returns claims only when format, MAC
    /// and expiry all pass. Runs in (at least) constant time.
    pub async fn validate_session_token(&self, token: &str) -> Option<SessionTokenClaims> {
        let start = Instant::now();

        // Always parse into four fields; substitute dummies on
        // malformed input so the MAC is computed either way
        let parts: Vec<&str> = token.split('.').collect();
        let mut valid_format = parts.len() == 4;

        let (random, wallet, expires_str, presented_mac) = if valid_format {
            (parts[0], parts[1], parts[2], parts[3])
        } else {
            ("dummy", "0x0000000000000000000000000000000000000000", "0", "")
        };

        let expires_at = match expires_str.parse::<i64>() {
            Ok(v) => v,
            Err(_) => {
                valid_format = false;
                0
            }
        };

        // Always compute the expected MAC
        let expected_mac = self.token_mac(random, wallet, expires_at);

        let mac_valid = bool::from(
            expected_mac
                .as_bytes()
                .ct_eq(pad_to_len(presented_mac, expected_mac.len()).as_bytes()),
        );

        let now = chrono::Utc::now().timestamp();
        let not_expired = now < expires_at;

        let mut claims = None;
        if valid_format && mac_valid && not_expired {
            // The wallet field must still be a well-formed address
            match normalize_address(wallet) {
                Some(wallet_address) => {
                    claims = Some(SessionTokenClaims {
                        wallet_address,
                        expires_at,
                        expires_in: expires_at - now,
                    });
                }
                None => {
                    warn!("Session token carried malformed wallet field");
                }
            }
        } else if !valid_format {
            warn!("Session token validation failed: invalid format");
        } else if !mac_valid {
            warn!("Session token validation failed: MAC mismatch");
        } else {
            warn!("Session token validation failed: token expired");
        }

        // Pad to the minimum duration to mask which check failed
        let elapsed = start.elapsed();
        if elapsed < MIN_VALIDATION_TIME {
            tokio::time::sleep(MIN_VALIDATION_TIME - elapsed).await;
        }

        claims
    }

    /// Parse a session token without any verification. Used by the
    /// refresh flow, which accepts expired tokens that are format-valid.
    pub fn parse_unverified(token: &str) -> Option<(String, i64)> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 4 {
            return None;
        }
        let wallet = normalize_address(parts[1])?;
        let expires_at = parts[2].parse::<i64>().ok()?;
        Some((wallet, expires_at))
    }

    /// Constant-time refresh token verification against the binding
    /// recomputed from (assertion_id, wallet)
    pub fn verify_refresh_token(
        &self,
        refresh_token: &str,
        assertion_id: &str,
        wallet_address: &str,
    ) -> bool {
        let expected = self.refresh_mac(assertion_id, wallet_address);
        bool::from(
            expected
                .as_bytes()
                .ct_eq(pad_to_len(refresh_token, expected.len()).as_bytes()),
        )
    }

    fn token_mac(&self, random: &str, wallet: &str, expires_at: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key).expect("HMAC key");
        mac.update(format!("{}:{}:{}", random, wallet, expires_at).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn refresh_mac(&self, assertion_id: &str, wallet: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key).expect("HMAC key");
        mac.update(format!("refresh:{}:{}", assertion_id, wallet).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Length-equalize untrusted input before constant-time comparison so
/// length differences fail without short-circuiting the compare
fn pad_to_len(input: &str, len: usize) -> String {
    let mut out = String::with_capacity(len);
    out.push_str(&input.chars().take(len).collect::<String>());
    while out.len() < len {
        out.push('\0');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "a-sufficiently-long-secret-key-0123456789";
    const WALLET: &str = "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0";

    fn manager() -> TokenManager {
        TokenManager::new(SECRET).unwrap()
    }

    fn future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    // ========================================================================
    // Issuance and validation
    // ========================================================================

    #[tokio::test]
    async fn test_issue_and_validate() {
        let mgr = manager();
        let token = mgr.issue_session_token(WALLET, future());

        assert_eq!(token.matches('.').count(), 3);

        let claims = mgr.validate_session_token(&token).await.unwrap();
        assert_eq!(claims.wallet_address, WALLET);
        assert!(claims.expires_in > 3590 && claims.expires_in <= 3600);
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(TokenManager::new("short").is_err());
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let mgr = manager();
        let token = mgr.issue_session_token(WALLET, chrono::Utc::now().timestamp() - 1);
        assert!(mgr.validate_session_token(&token).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_tokens_rejected() {
        let mgr = manager();
        for bad in [
            "",
            "no-dots-at-all",
            "a.b.c",
            "a.b.c.d.e",
            "rand.wallet.not-a-number.mac",
        ] {
            assert!(
                mgr.validate_session_token(bad).await.is_none(),
                "accepted {:?}",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_any_field_edit_fails() {
        let mgr = manager();
        let token = mgr.issue_session_token(WALLET, future());
        let parts: Vec<&str> = token.split('.').collect();

        // Edit each field in turn
        let flip = if parts[0].starts_with('A') { "B" } else { "A" };
        let edits = [
            format!("{}{}.{}.{}.{}", flip, &parts[0][1..], parts[1], parts[2], parts[3]),
            format!(
                "{}.0x0000000000000000000000000000000000000001.{}.{}",
                parts[0], parts[2], parts[3]
            ),
            format!("{}.{}.{}.{}", parts[0], parts[1], future() + 999, parts[3]),
            format!("{}.{}.{}.X{}", parts[0], parts[1], parts[2], &parts[3][1..]),
        ];

        for edited in &edits {
            assert!(
                mgr.validate_session_token(edited).await.is_none(),
                "accepted edited token {:?}",
                edited
            );
        }
    }

    #[tokio::test]
    async fn test_every_mac_byte_flip_fails() {
        let mgr = manager();
        let token = mgr.issue_session_token(WALLET, future());
        let dot = token.rfind('.').unwrap();

        for i in (dot + 1)..token.len() {
            let mut bytes = token.clone().into_bytes();
            bytes[i] = if bytes[i] == b'0' { b'1' } else { b'0' };
            let tampered = String::from_utf8(bytes).unwrap();
            if tampered == token {
                continue;
            }
            assert!(mgr.validate_session_token(&tampered).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_field_reorder_fails() {
        let mgr = manager();
        let token = mgr.issue_session_token(WALLET, future());
        let parts: Vec<&str> = token.split('.').collect();
        let reordered = format!("{}.{}.{}.{}", parts[1], parts[0], parts[2], parts[3]);
        assert!(mgr.validate_session_token(&reordered).await.is_none());
    }

    #[tokio::test]
    async fn test_truncation_fails() {
        let mgr = manager();
        let token = mgr.issue_session_token(WALLET, future());
        assert!(mgr
            .validate_session_token(&token[..token.len() - 1])
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_different_secret_fails() {
        let token = manager().issue_session_token(WALLET, future());
        let other = TokenManager::new("another-sufficiently-long-secret-key-42").unwrap();
        assert!(other.validate_session_token(&token).await.is_none());
    }

    // ========================================================================
    // Timing floor
    // ========================================================================

    #[tokio::test]
    async fn test_validation_takes_at_least_minimum_time() {
        let mgr = manager();
        let valid = mgr.issue_session_token(WALLET, future());

        for token in [valid.as_str(), "garbage", ""] {
            let start = Instant::now();
            let _ = mgr.validate_session_token(token).await;
            assert!(
                start.elapsed() >= MIN_VALIDATION_TIME,
                "validation of {:?} returned early",
                token
            );
        }
    }

    #[tokio::test]
    async fn test_first_vs_last_byte_timing_is_uniform() {
        let mgr = manager();
        let token = mgr.issue_session_token(WALLET, future());
        let dot = token.rfind('.').unwrap();

        let mut first = token.clone().into_bytes();
        first[dot + 1] = if first[dot + 1] == b'0' { b'1' } else { b'0' };
        let first = String::from_utf8(first).unwrap();

        let mut last = token.clone().into_bytes();
        let n = last.len() - 1;
        last[n] = if last[n] == b'0' { b'1' } else { b'0' };
        let last = String::from_utf8(last).unwrap();

        async fn timed(mgr: &TokenManager, token: &str) -> Duration {
            let start = Instant::now();
            let _ = mgr.validate_session_token(token).await;
            start.elapsed()
        }

        let mut ratios = Vec::new();
        for _ in 0..20 {
            let a = timed(&mgr, &first).await;
            let b = timed(&mgr, &last).await;
            let ratio = a.as_secs_f64() / b.as_secs_f64();
            ratios.push(if ratio < 1.0 { 1.0 / ratio } else { ratio });
        }
        ratios.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = ratios[ratios.len() / 2];
        assert!(median < 1.5, "timing ratio {} exceeds bound", median);
    }

    // ========================================================================
    // Refresh tokens
    // ========================================================================

    #[test]
    fn test_refresh_token_roundtrip() {
        let mgr = manager();
        let refresh = mgr.issue_refresh_token("assertion-1", WALLET);

        assert!(mgr.verify_refresh_token(&refresh, "assertion-1", WALLET));
        assert!(!mgr.verify_refresh_token(&refresh, "assertion-2", WALLET));
        assert!(!mgr.verify_refresh_token(
            &refresh,
            "assertion-1",
            "0x0000000000000000000000000000000000000001"
        ));
        assert!(!mgr.verify_refresh_token("forged", "assertion-1", WALLET));
    }

    #[test]
    fn test_parse_unverified_format_only() {
        let mgr = manager();
        let token = mgr.issue_session_token(WALLET, 12345);

        let (wallet, expires_at) = TokenManager::parse_unverified(&token).unwrap();
        assert_eq!(wallet, WALLET);
        assert_eq!(expires_at, 12345);

        assert!(TokenManager::parse_unverified("a.b.c").is_none());
        assert!(TokenManager::parse_unverified("a.not-an-address.5.mac").is_none());
    }
}

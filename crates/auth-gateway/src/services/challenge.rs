//! Challenge generation
//!
//! Mints unique, time-bound challenges for wallet authentication. The
//! challenge message is the exact text shown in the user's wallet; it
//! embeds the challenge id, nonce and validity window, and carries a
//! warning line so users do not sign unsolicited messages.

use crate::services::signature::normalize_address;
use chrono::{TimeZone, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use shared::models::{Challenge, ChallengeStatus, RequestMetadata, WIRE_VERSION};
use shared::{Error, Result, WcsapErrorCode};

/// Nonce length in bytes
const NONCE_LENGTH: usize = 32;

/// Generates challenges bound to a wallet address
#[derive(Debug, Clone)]
pub struct ChallengeGenerator {
    challenge_ttl: u64,
    app_name: String,
    protocol_version: String,
}

impl ChallengeGenerator {
    pub fn new(challenge_ttl: u64, app_name: &str, protocol_version: &str) -> Self {
        Self {
            challenge_ttl,
            app_name: app_name.to_string(),
            protocol_version: protocol_version.to_string(),
        }
    }

    /// Generate a challenge for `wallet_address` (any case). Rejects
    /// malformed addresses before any randomness is spent.
    pub fn generate(
        &self,
        wallet_address: &str,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Challenge> {
        let wallet = normalize_address(wallet_address).ok_or_else(|| {
            Error::auth(
                WcsapErrorCode::InvalidWalletAddress,
                "Invalid wallet address",
            )
        })?;

        let challenge_id = generate_hex_id(&wallet);
        let nonce = generate_nonce();

        let issued_at = Utc::now().timestamp();
        let expires_at = issued_at + self.challenge_ttl as i64;

        let challenge_message =
            self.render_message(&challenge_id, &wallet, &nonce, issued_at, expires_at);

        Ok(Challenge {
            v: WIRE_VERSION,
            challenge_id,
            wallet_address: wallet,
            challenge_message,
            nonce,
            issued_at,
            expires_at,
            status: ChallengeStatus::Pending,
            app_name: self.app_name.clone(),
            protocol_version: self.protocol_version.clone(),
            metadata: RequestMetadata {
                ip_address: ip_address.map(str::to_string),
                user_agent: user_agent.map(str::to_string),
            },
        })
    }

    /// Render the human-readable message presented for signing
    fn render_message(
        &self,
        challenge_id: &str,
        wallet: &str,
        nonce: &str,
        issued_at: i64,
        expires_at: i64,
    ) -> String {
        let issued = format_ts(issued_at);
        let expires = format_ts(expires_at);

        format!(
            "{} - Wallet Authentication\n\n\
             Sign this message to authenticate your wallet.\n\n\
             Wallet: {}\n\
             Challenge ID: {}...\n\
             Nonce: {}...\n\n\
             Issued: {}\n\
             Expires: {}\n\n\
             WARNING: Only sign this message if you initiated this login.\n\
             Never share this signature with anyone.\n\n\
             Security: This is a one-time authentication challenge.",
            self.app_name,
            wallet,
            &challenge_id[..16],
            &nonce[..16],
            issued,
            expires,
        )
    }
}

fn format_ts(unix: i64) -> String {
    Utc.timestamp_opt(unix, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| unix.to_string())
}

/// Unique 32-byte hex identifier derived from the wallet, the current
/// time and fresh randomness
pub fn generate_hex_id(wallet_address: &str) -> String {
    let mut random = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut random);

    let mut hasher = Sha256::new();
    hasher.update(wallet_address.as_bytes());
    hasher.update(b":");
    hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    hasher.update(b":");
    hasher.update(random);
    hex::encode(hasher.finalize())
}

/// Fresh 32-byte CSPRNG nonce, hex encoded
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0";

    fn generator() -> ChallengeGenerator {
        ChallengeGenerator::new(300, "W-CSAP", "1.0.0")
    }

    #[test]
    fn test_generate_challenge_valid_address() {
        let challenge = generator().generate(WALLET, None, None).unwrap();

        assert_eq!(challenge.challenge_id.len(), 64);
        assert_eq!(challenge.nonce.len(), 64);
        assert_eq!(challenge.wallet_address, WALLET);
        assert_eq!(challenge.status, ChallengeStatus::Pending);
        assert_eq!(challenge.expires_at - challenge.issued_at, 300);
    }

    #[test]
    fn test_generate_challenge_normalizes_case() {
        let challenge = generator()
            .generate(&WALLET.to_lowercase(), None, None)
            .unwrap();
        assert_eq!(challenge.wallet_address, WALLET);
    }

    #[test]
    fn test_generate_challenge_invalid_address() {
        let result = generator().generate("742d35Cc6634C0532925a3b844Bc9e7595f0bEb0", None, None);
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().code(),
            WcsapErrorCode::InvalidWalletAddress
        );
    }

    #[test]
    fn test_message_contains_required_fields() {
        let challenge = generator().generate(WALLET, None, None).unwrap();
        let msg = &challenge.challenge_message;

        assert!(msg.contains(WALLET));
        assert!(msg.contains(&challenge.challenge_id[..16]));
        assert!(msg.contains(&challenge.nonce[..16]));
        assert!(msg.contains("Issued:"));
        assert!(msg.contains("Expires:"));
        assert!(msg.contains("WARNING"));
    }

    #[test]
    fn test_metadata_recorded() {
        let challenge = generator()
            .generate(WALLET, Some("203.0.113.45"), Some("test-agent/1.0"))
            .unwrap();
        assert_eq!(challenge.metadata.ip_address.as_deref(), Some("203.0.113.45"));
        assert_eq!(challenge.metadata.user_agent.as_deref(), Some("test-agent/1.0"));
    }

    #[test]
    fn test_nonces_and_ids_unique() {
        let gen = generator();
        let a = gen.generate(WALLET, None, None).unwrap();
        let b = gen.generate(WALLET, None, None).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.challenge_id, b.challenge_id);
    }
}

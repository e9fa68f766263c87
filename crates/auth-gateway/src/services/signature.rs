//! EIP-191 signature verification
//!
//! Verifies that a challenge message was signed by the expected wallet
//! address. The public entry point is fail-closed: every malformed input,
//! recovery failure, or mismatch collapses to `(false, None)` and the
//! specific reason is only ever logged, never returned to callers.
//!
//! # Security
//!
//! - EIP-191 personal_sign framing: `"\x19Ethereum Signed Message:\n" + len + message`
//! - secp256k1 public key recovery, recovered address compared with the
//!   expected address using a constant-time equality over lowercased hex

use alloy::primitives::{keccak256, Address, PrimitiveSignature, B256, U256};
use alloy::signers::k256::ecdsa::VerifyingKey;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use tracing::warn;

/// Outcome of a signature verification. `recovered` is populated only
/// when `valid` is true.
#[derive(Debug, Clone)]
pub struct SignatureCheck {
    pub valid: bool,
    pub recovered: Option<String>,
}

impl SignatureCheck {
    fn rejected() -> Self {
        Self {
            valid: false,
            recovered: None,
        }
    }
}

/// Internal rejection reasons. Logged, never surfaced.
#[derive(Debug)]
enum Reject {
    EmptyMessage,
    EmptySignature,
    MissingHexPrefix,
    BadLength(usize),
    BadHex,
    BadRecoveryId(u8),
    BadAddress,
    RecoveryFailed,
    Mismatch,
}

/// Validate an Ethereum address and normalize it to its EIP-55
/// checksummed form. Rejects anything that is not `0x` + 40 hex chars.
pub fn normalize_address(address: &str) -> Option<String> {
    if !address.starts_with("0x") || address.len() != 42 {
        return None;
    }
    if hex::decode(&address[2..]).is_err() {
        return None;
    }
    let parsed = Address::from_str(address).ok()?;
    Some(parsed.to_checksum(None))
}

/// EIP-191 signature verifier
#[derive(Debug, Clone, Default)]
pub struct SignatureVerifier;

impl SignatureVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Verify that `message` was signed by `expected_address`.
    ///
    /// Fail-closed: no input can make this return `valid: true` unless
    /// every step succeeded and the recovered signer matches.
    pub fn verify(
        &self,
        message: &str,
        signature: &str,
        expected_address: &str,
    ) -> SignatureCheck {
        match self.verify_inner(message, signature, expected_address) {
            Ok(recovered) => SignatureCheck {
                valid: true,
                recovered: Some(recovered),
            },
            Err(reason) => {
                warn!(
                    reason = ?reason,
                    signature_len = signature.len(),
                    message_len = message.len(),
                    "Signature verification rejected"
                );
                SignatureCheck::rejected()
            }
        }
    }

    fn verify_inner(
        &self,
        message: &str,
        signature: &str,
        expected_address: &str,
    ) -> Result<String, Reject> {
        if message.is_empty() {
            return Err(Reject::EmptyMessage);
        }
        if signature.is_empty() {
            return Err(Reject::EmptySignature);
        }
        if !signature.starts_with("0x") {
            return Err(Reject::MissingHexPrefix);
        }
        // 0x + 128 hex (64-byte) or 0x + 130 hex (65-byte)
        if signature.len() != 130 && signature.len() != 132 {
            return Err(Reject::BadLength(signature.len()));
        }

        let expected = normalize_address(expected_address).ok_or(Reject::BadAddress)?;

        let sig_bytes = hex::decode(&signature[2..]).map_err(|_| Reject::BadHex)?;

        let (r, s, y_parity) = match sig_bytes.len() {
            65 => {
                let r = B256::from_slice(&sig_bytes[0..32]);
                let s = B256::from_slice(&sig_bytes[32..64]);
                let v = sig_bytes[64];
                // Normalize v (handle both legacy 27/28 and raw 0/1 forms)
                let v_normalized = if v >= 27 { v - 27 } else { v };
                if v_normalized > 1 {
                    return Err(Reject::BadRecoveryId(v));
                }
                (r, s, v_normalized != 0)
            }
            64 => {
                // EIP-2098 compact form: y parity is the top bit of s
                let r = B256::from_slice(&sig_bytes[0..32]);
                let mut s_bytes = [0u8; 32];
                s_bytes.copy_from_slice(&sig_bytes[32..64]);
                let y_parity = s_bytes[0] & 0x80 != 0;
                s_bytes[0] &= 0x7f;
                (r, B256::from(s_bytes), y_parity)
            }
            n => return Err(Reject::BadLength(n)),
        };

        let prehash = eip191_hash(message);

        let sig = PrimitiveSignature::new(
            U256::from_be_slice(r.as_slice()),
            U256::from_be_slice(s.as_slice()),
            y_parity,
        );

        let recovered_key = sig
            .recover_from_prehash(&prehash)
            .map_err(|_| Reject::RecoveryFailed)?;

        let recovered = pubkey_to_address(&recovered_key);

        if constant_time_address_eq(&recovered, &expected) {
            Ok(recovered)
        } else {
            Err(Reject::Mismatch)
        }
    }
}

/// Keccak-256 over the EIP-191 personal-message framing
pub fn eip191_hash(message: &str) -> B256 {
    let prefixed = format!(
        "\x19Ethereum Signed Message:\n{}{}",
        message.len(),
        message
    );
    keccak256(prefixed.as_bytes())
}

/// Convert a recovered public key to a `0x`-prefixed lowercase address
fn pubkey_to_address(pubkey: &VerifyingKey) -> String {
    // Uncompressed point is 65 bytes with a 0x04 prefix; the address is
    // the last 20 bytes of keccak256 over the remaining 64
    let point = pubkey.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// Constant-time equality over lowercased address hex
fn constant_time_address_eq(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

//! Cryptographic primitives for the session store
//!
//! Provides:
//! - PBKDF2-HMAC-SHA256 key derivation (600k iterations, OWASP parameters)
//! - AES-256-GCM authenticated encryption for persisted records
//! - HMAC-SHA256 tamper seals over (storage key || ciphertext)
//! - Key rotation with an old-cipher handover for re-encryption
//!
//! Derived keys live only in memory and are redacted from Debug output.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use shared::{Error, Result};
use std::fmt;
use subtle::ConstantTimeEq;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// PBKDF2 salt length (256 bits)
pub const SALT_LENGTH: usize = 32;

/// Derived key length (256 bits for AES-256 / HMAC-SHA256)
pub const KEY_LENGTH: usize = 32;

/// OWASP recommendation for PBKDF2-HMAC-SHA256
pub const PBKDF2_ITERATIONS: u32 = 600_000;

/// AES-GCM nonce size (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size
pub const TAG_SIZE: usize = 16;

/// Separator between ciphertext blob and tamper seal in stored values
pub const SEAL_SEPARATOR: &[u8] = b"||";

/// Encryption and MAC keys derived from the process-wide master secret.
///
/// Owns the AES-256-GCM cipher and the HMAC key together so both always
/// rotate as a pair.
pub struct RecordCrypto {
    master_secret: Vec<u8>,
    salt: [u8; SALT_LENGTH],
    cipher: Aes256Gcm,
    hmac_key: [u8; KEY_LENGTH],
}

impl fmt::Debug for RecordCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordCrypto([REDACTED])")
    }
}

impl Drop for RecordCrypto {
    fn drop(&mut self) {
        self.master_secret.iter_mut().for_each(|b| *b = 0);
        self.hmac_key.iter_mut().for_each(|b| *b = 0);
    }
}

impl RecordCrypto {
    /// Derive keys from the master secret. The secret must be at least
    /// 32 bytes; shorter secrets are a configuration error.
    pub fn new(master_secret: &str) -> Result<Self> {
        if master_secret.len() < 32 {
            return Err(Error::config(
                "Master secret must be at least 32 characters",
            ));
        }

        let mut salt = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);

        let (cipher, hmac_key) = derive_keys(master_secret.as_bytes(), &salt);

        Ok(Self {
            master_secret: master_secret.as_bytes().to_vec(),
            salt,
            cipher,
            hmac_key,
        })
    }

    /// Encrypt a plaintext record. Output layout:
    /// `nonce(12) || ciphertext || tag(16)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::internal("Record encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a record blob. Returns `None` when the blob is truncated
    /// or the authentication tag does not verify; never errors.
    pub fn decrypt(&self, blob: &[u8]) -> Option<Vec<u8>> {
        decrypt_with(&self.cipher, blob)
    }

    /// Compute the tamper seal over (storage key || ciphertext blob)
    pub fn seal(&self, storage_key: &str, blob: &[u8]) -> String {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.hmac_key)
            .expect("HMAC accepts any key length");
        mac.update(storage_key.as_bytes());
        mac.update(blob);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a tamper seal with constant-time equality
    pub fn verify_seal(&self, storage_key: &str, blob: &[u8], seal_hex: &str) -> bool {
        let expected = self.seal(storage_key, blob);
        if expected.len() != seal_hex.len() {
            return false;
        }
        expected.as_bytes().ct_eq(seal_hex.as_bytes()).into()
    }

    /// Rotate to fresh keys under a new salt. Returns the previous
    /// cipher so callers can re-encrypt existing records during the
    /// overlap window.
    pub fn rotate(&mut self) -> Aes256Gcm {
        warn!("Encryption key rotation initiated");

        OsRng.fill_bytes(&mut self.salt);
        let (cipher, hmac_key) = derive_keys(&self.master_secret, &self.salt);

        let old_cipher = std::mem::replace(&mut self.cipher, cipher);
        self.hmac_key = hmac_key;
        old_cipher
    }
}

/// Decrypt a blob with an explicit cipher (used for the rotation
/// overlap window)
pub fn decrypt_with(cipher: &Aes256Gcm, blob: &[u8]) -> Option<Vec<u8>> {
    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return None;
    }
    let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);
    cipher.decrypt(nonce, &blob[NONCE_SIZE..]).ok()
}

/// Derive the (encryption, hmac) key pair for a salt. The derivation
/// context is appended to the salt so the two keys never collide.
fn derive_keys(master_secret: &[u8], salt: &[u8; SALT_LENGTH]) -> (Aes256Gcm, [u8; KEY_LENGTH]) {
    let enc = derive_key(master_secret, salt, b"encryption");
    let mac = derive_key(master_secret, salt, b"hmac");
    let cipher = Aes256Gcm::new_from_slice(&enc).expect("32-byte AES key");
    (cipher, mac)
}

fn derive_key(master_secret: &[u8], salt: &[u8; SALT_LENGTH], context: &[u8]) -> [u8; KEY_LENGTH] {
    let mut salted = Vec::with_capacity(SALT_LENGTH + context.len());
    salted.extend_from_slice(salt);
    salted.extend_from_slice(context);

    let mut out = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha256>(master_secret, &salted, PBKDF2_ITERATIONS, &mut out);
    out
}

//! Encrypted session and challenge store
//!
//! All persisted records are AES-256-GCM encrypted and carry an
//! HMAC-SHA256 tamper seal bound to their storage key:
//! `nonce || ciphertext || tag` + `"||"` + `hex(seal)`. A read that fails
//! the seal or the AEAD tag deletes the record and reports absence.
//!
//! Persistence goes through a backend capability trait with two
//! variants selected at startup: an in-process map with periodic sweep,
//! and Redis with native TTL. Challenge consumption uses the backend's
//! atomic take (Redis GETDEL) so two concurrent verifies of one
//! challenge can never both mint a session.
//!
//! Session records are retained until the refresh horizon
//! (`issued_at + refresh_ttl`); token validity is judged against
//! `expires_at` by the caller, which keeps expired-but-refreshable
//! sessions reachable for the refresh flow and nothing else.

use crate::services::audit::{AuditLog, EventDraft};
use crate::services::crypto::{decrypt_with, RecordCrypto, SEAL_SEPARATOR};
use crate::services::revocation::RevocationCache;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::models::{AuthEventType, Challenge, SessionAssertion, WIRE_VERSION};
use shared::redis::{PREFIX_CHALLENGE, PREFIX_SESSION};
use shared::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Hex length of the tamper seal (HMAC-SHA256)
const SEAL_HEX_LEN: usize = 64;

/// Store health snapshot for `/auth/stats` and the health endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreHealth {
    pub ok: bool,
    pub backend: &'static str,
    pub active_sessions: u64,
    pub active_challenges: u64,
}

/// Key rotation outcome
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RotationReport {
    pub re_encrypted: usize,
    pub failed: usize,
}

/// Raw KV operations every backend must provide. All values are opaque
/// sealed blobs; encryption happens above this trait.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn put_ex(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically fetch and delete. Returns the value iff this caller
    /// performed the deletion.
    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Cursor-based key scan; never blocks the backend on large keysets
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove naturally expired entries. Redis handles TTL natively and
    /// returns 0.
    async fn sweep_expired(&self) -> usize;

    async fn ping(&self) -> Result<()>;
}

/// In-process backend. Expiry is enforced lazily on read and by the
/// periodic sweep task.
#[derive(Default)]
pub struct MemoryStoreBackend {
    entries: DashMap<String, (Vec<u8>, i64)>,
}

impl MemoryStoreBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreBackend for MemoryStoreBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn put_ex(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<()> {
        let expires_at = chrono::Utc::now().timestamp() + ttl_seconds as i64;
        self.entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = chrono::Utc::now().timestamp();
        // Copy out under the read guard; removal must not run while the
        // guard is held
        let entry = self.entries.get(key).map(|e| e.clone());
        match entry {
            Some((value, expires_at)) if now < expires_at => Ok(Some(value)),
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = chrono::Utc::now().timestamp();
        match self.entries.remove(key) {
            Some((_, (value, expires_at))) if now < expires_at => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn sweep_expired(&self) -> usize {
        let now = chrono::Utc::now().timestamp();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| now < *expires_at);
        before - self.entries.len()
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Redis backend. Every call carries a deadline; natural TTL is set by
/// the writer.
pub struct RedisStoreBackend {
    redis: ConnectionManager,
    timeout: Duration,
}

impl RedisStoreBackend {
    pub fn new(redis: ConnectionManager, timeout: Duration) -> Self {
        Self { redis, timeout }
    }

    async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = std::result::Result<T, redis::RedisError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::store(e.to_string())),
            Err(_) => Err(Error::store("backend deadline exceeded")),
        }
    }
}

#[async_trait]
impl StoreBackend for RedisStoreBackend {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn put_ex(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.redis.clone();
        self.with_deadline(conn.set_ex::<_, _, ()>(key, value, ttl_seconds))
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.redis.clone();
        self.with_deadline(conn.get::<_, Option<Vec<u8>>>(key)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = self.with_deadline(conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.redis.clone();
        self.with_deadline(
            redis::cmd("GETDEL")
                .arg(key)
                .query_async::<Option<Vec<u8>>>(&mut conn),
        )
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", prefix);
        let mut keys = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .with_deadline(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }

    async fn sweep_expired(&self) -> usize {
        0
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        self.with_deadline(redis::cmd("PING").query_async::<String>(&mut conn))
            .await
            .map(|_| ())
    }
}

/// Encrypted store for challenges and session assertions
pub struct SessionStore {
    backend: Arc<dyn StoreBackend>,
    crypto: RwLock<RecordCrypto>,
    revocation: Arc<RevocationCache>,
    audit: Arc<AuditLog>,
    refresh_ttl: u64,
}

impl SessionStore {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        master_secret: &str,
        revocation: Arc<RevocationCache>,
        audit: Arc<AuditLog>,
        refresh_ttl: u64,
    ) -> Result<Self> {
        Ok(Self {
            backend,
            crypto: RwLock::new(RecordCrypto::new(master_secret)?),
            revocation,
            audit,
            refresh_ttl,
        })
    }

    fn session_key(assertion_id: &str) -> String {
        format!("{}{}", PREFIX_SESSION, assertion_id)
    }

    fn challenge_key(challenge_id: &str) -> String {
        format!("{}{}", PREFIX_CHALLENGE, challenge_id)
    }

    // ==================== Session operations ====================

    /// Persist a session. The record lives until the refresh horizon so
    /// an expired session token can still be refreshed.
    pub async fn put_session(&self, session: &SessionAssertion) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let ttl = (session.refresh_deadline(self.refresh_ttl) - now).max(1) as u64;
        let key = Self::session_key(&session.assertion_id);

        self.write_record(&key, session, ttl).await?;
        debug!(
            assertion = %&session.assertion_id[..16],
            ttl = ttl,
            "Session stored (encrypted)"
        );
        Ok(())
    }

    /// Fetch a session by assertion id. Temporal validity is NOT checked
    /// here; callers decide whether an expired-but-refreshable record is
    /// acceptable.
    pub async fn get_session(&self, assertion_id: &str) -> Option<SessionAssertion> {
        let key = Self::session_key(assertion_id);
        self.read_record::<SessionAssertion>(&key).await
    }

    pub async fn delete_session(&self, assertion_id: &str) -> Result<bool> {
        self.backend.delete(&Self::session_key(assertion_id)).await
    }

    /// All sessions for a wallet (case-insensitive). With `only_valid`,
    /// expired-but-refreshable records are filtered out.
    pub async fn sessions_by_wallet(
        &self,
        wallet_address: &str,
        only_valid: bool,
    ) -> Vec<SessionAssertion> {
        let wallet = wallet_address.to_lowercase();
        let now = chrono::Utc::now().timestamp();

        let keys = match self.backend.scan_prefix(PREFIX_SESSION).await {
            Ok(keys) => keys,
            Err(e) => {
                self.degraded("session scan", &e);
                return Vec::new();
            }
        };

        let mut sessions = Vec::new();
        for key in keys {
            let assertion_id = key.trim_start_matches(PREFIX_SESSION);
            if let Some(session) = self.get_session(assertion_id).await {
                if session.wallet_address.to_lowercase() != wallet {
                    continue;
                }
                if only_valid && !session.is_valid(now) {
                    continue;
                }
                sessions.push(session);
            }
        }

        sessions.sort_by_key(|s| s.issued_at);
        sessions
    }

    // ==================== Challenge operations ====================

    pub async fn put_challenge(&self, challenge: &Challenge) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let ttl = (challenge.expires_at - now).max(1) as u64;
        let key = Self::challenge_key(&challenge.challenge_id);

        self.write_record(&key, challenge, ttl).await?;
        debug!(
            challenge = %&challenge.challenge_id[..16],
            ttl = ttl,
            "Challenge stored (encrypted)"
        );
        Ok(())
    }

    /// Fetch a challenge without consuming it. Expired challenges are
    /// deleted and reported absent.
    pub async fn get_challenge(&self, challenge_id: &str) -> Option<Challenge> {
        let key = Self::challenge_key(challenge_id);
        let challenge = self.read_record::<Challenge>(&key).await?;

        if challenge.is_expired(chrono::Utc::now().timestamp()) {
            let _ = self.backend.delete(&key).await;
            return None;
        }
        Some(challenge)
    }

    /// Atomically consume a challenge. At most one caller observes the
    /// record; a consumed challenge is never reinstated. The returned
    /// challenge may already be expired, letting the caller report
    /// expiry distinctly from absence.
    pub async fn take_challenge(&self, challenge_id: &str) -> Option<Challenge> {
        let key = Self::challenge_key(challenge_id);

        let value = match self.backend.take(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                self.degraded("challenge take", &e);
                return None;
            }
        };

        self.decode::<Challenge>(&key, &value, false).await
    }

    pub async fn delete_challenge(&self, challenge_id: &str) -> Result<bool> {
        self.backend.delete(&Self::challenge_key(challenge_id)).await
    }

    // ==================== Revocation delegation ====================

    /// Revoke a session: remove the record and blocklist the assertion
    /// id until its natural expiry
    pub async fn revoke_session(&self, assertion_id: &str, expires_at: i64) -> bool {
        let _ = self.delete_session(assertion_id).await;
        self.revocation.revoke(assertion_id, expires_at).await
    }

    pub async fn is_revoked(&self, assertion_id: &str) -> bool {
        self.revocation.is_revoked(assertion_id).await
    }

    // ==================== Key rotation ====================

    /// Rotate encryption keys and re-encrypt existing records
    /// best-effort under the old-cipher overlap window.
    pub async fn rotate_keys(&self) -> RotationReport {
        let mut crypto = self.crypto.write().await;
        let old_cipher = crypto.rotate();

        let mut report = RotationReport {
            re_encrypted: 0,
            failed: 0,
        };

        for prefix in [PREFIX_SESSION, PREFIX_CHALLENGE] {
            let keys = match self.backend.scan_prefix(prefix).await {
                Ok(keys) => keys,
                Err(e) => {
                    error!(error = %e, prefix = prefix, "Rotation scan failed");
                    report.failed += 1;
                    continue;
                }
            };

            for key in keys {
                let value = match self.backend.get(&key).await {
                    Ok(Some(value)) => value,
                    _ => continue,
                };

                // Seal was computed under the old MAC key; trust the AEAD
                // tag alone during the overlap window
                let Some((blob, _)) = split_sealed(&value) else {
                    report.failed += 1;
                    continue;
                };
                let Some(plaintext) = decrypt_with(&old_cipher, blob) else {
                    report.failed += 1;
                    continue;
                };

                let ttl = match remaining_ttl(&key, &plaintext, self.refresh_ttl) {
                    Some(ttl) => ttl,
                    None => {
                        let _ = self.backend.delete(&key).await;
                        continue;
                    }
                };

                match encode_sealed(&crypto, &key, &plaintext) {
                    Ok(sealed) => {
                        if self.backend.put_ex(&key, sealed, ttl).await.is_ok() {
                            report.re_encrypted += 1;
                        } else {
                            report.failed += 1;
                        }
                    }
                    Err(_) => report.failed += 1,
                }
            }
        }

        warn!(
            re_encrypted = report.re_encrypted,
            failed = report.failed,
            "Key rotation complete"
        );
        report
    }

    // ==================== Health & maintenance ====================

    pub async fn health(&self) -> StoreHealth {
        let ok = self.backend.ping().await.is_ok();

        let count = |keys: Result<Vec<String>>| keys.map(|k| k.len() as u64).unwrap_or(0);
        let active_sessions = count(self.backend.scan_prefix(PREFIX_SESSION).await);
        let active_challenges = count(self.backend.scan_prefix(PREFIX_CHALLENGE).await);

        StoreHealth {
            ok,
            backend: self.backend.kind(),
            active_sessions,
            active_challenges,
        }
    }

    /// Drop naturally expired entries (memory backend only)
    pub async fn sweep_expired(&self) -> usize {
        self.backend.sweep_expired().await
    }

    // ==================== Record plumbing ====================

    async fn write_record<T: Serialize>(&self, key: &str, record: &T, ttl: u64) -> Result<()> {
        let plaintext =
            serde_json::to_vec(record).map_err(|e| Error::internal(e.to_string()))?;

        let crypto = self.crypto.read().await;
        let sealed = encode_sealed(&crypto, key, &plaintext)?;
        drop(crypto);

        self.backend.put_ex(key, sealed, ttl).await
    }

    async fn read_record<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = match self.backend.get(key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                self.degraded("record read", &e);
                return None;
            }
        };

        self.decode::<T>(key, &value, true).await
    }

    /// Verify seal, decrypt and parse one stored value. A record that
    /// fails the seal or the tag is deleted (when `delete_on_tamper`)
    /// and reported absent.
    async fn decode<T: DeserializeOwned>(
        &self,
        key: &str,
        value: &[u8],
        delete_on_tamper: bool,
    ) -> Option<T> {
        let crypto = self.crypto.read().await;

        let Some((blob, seal)) = split_sealed(value) else {
            drop(crypto);
            self.tamper_detected(key, delete_on_tamper).await;
            return None;
        };

        if !crypto.verify_seal(key, blob, seal) {
            drop(crypto);
            self.tamper_detected(key, delete_on_tamper).await;
            return None;
        }

        let Some(plaintext) = crypto.decrypt(blob) else {
            drop(crypto);
            self.tamper_detected(key, delete_on_tamper).await;
            return None;
        };
        drop(crypto);

        match serde_json::from_slice::<serde_json::Value>(&plaintext) {
            Ok(parsed) if parsed.get("v").and_then(|v| v.as_u64()) == Some(WIRE_VERSION as u64) => {
                serde_json::from_value(parsed).ok()
            }
            _ => {
                warn!(key = %key, "Record failed wire-format validation, deleting");
                let _ = self.backend.delete(key).await;
                None
            }
        }
    }

    async fn tamper_detected(&self, key: &str, delete: bool) {
        error!(key = %key, "Record tamper detected");
        metrics::counter!("wcsap_store_tamper_total").increment(1);
        if delete {
            let _ = self.backend.delete(key).await;
        }
    }

    fn degraded(&self, operation: &str, error: &Error) {
        warn!(operation = operation, error = %error, "Store backend degraded, treating read as not-found");
        metrics::counter!("wcsap_store_degraded_total").increment(1);
        self.audit.record(EventDraft::new(
            AuthEventType::DegradedBackend,
            "-",
            false,
        ));
    }
}

/// Assemble `blob || "||" || hex(seal)`
fn encode_sealed(crypto: &RecordCrypto, key: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let blob = crypto.encrypt(plaintext)?;
    let seal = crypto.seal(key, &blob);

    let mut out = Vec::with_capacity(blob.len() + SEAL_SEPARATOR.len() + seal.len());
    out.extend_from_slice(&blob);
    out.extend_from_slice(SEAL_SEPARATOR);
    out.extend_from_slice(seal.as_bytes());
    Ok(out)
}

/// Split a stored value into (ciphertext blob, seal hex). The seal is a
/// fixed-length suffix, so ciphertext containing the separator bytes
/// cannot confuse the split.
fn split_sealed(value: &[u8]) -> Option<(&[u8], &str)> {
    if value.len() < SEAL_HEX_LEN + SEAL_SEPARATOR.len() {
        return None;
    }
    let (head, seal_bytes) = value.split_at(value.len() - SEAL_HEX_LEN);
    let (blob, sep) = head.split_at(head.len().checked_sub(SEAL_SEPARATOR.len())?);
    if sep != SEAL_SEPARATOR {
        return None;
    }
    let seal = std::str::from_utf8(seal_bytes).ok()?;
    Some((blob, seal))
}

/// Remaining TTL for a decrypted record, derived from its own expiry
/// fields. `None` means the record is already past its horizon.
fn remaining_ttl(key: &str, plaintext: &[u8], refresh_ttl: u64) -> Option<u64> {
    let now = chrono::Utc::now().timestamp();

    let deadline = if key.starts_with(PREFIX_SESSION) {
        let session: SessionAssertion = serde_json::from_slice(plaintext).ok()?;
        session.refresh_deadline(refresh_ttl)
    } else {
        let challenge: Challenge = serde_json::from_slice(plaintext).ok()?;
        challenge.expires_at
    };

    if deadline <= now {
        None
    } else {
        Some((deadline - now) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::models::{ChallengeStatus, RequestMetadata, SessionMetadata};

    const SECRET: &str = "0123456789abcdef0123456789abcdef";
    const WALLET: &str = "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0";

    fn store() -> SessionStore {
        SessionStore::new(
            Arc::new(MemoryStoreBackend::new()),
            SECRET,
            Arc::new(RevocationCache::in_memory()),
            Arc::new(AuditLog::default()),
            604_800,
        )
        .unwrap()
    }

    fn session(id_fill: char, expires_in: i64) -> SessionAssertion {
        let now = chrono::Utc::now().timestamp();
        SessionAssertion {
            v: WIRE_VERSION,
            assertion_id: id_fill.to_string().repeat(64),
            wallet_address: WALLET.to_string(),
            issued_at: now,
            not_before: now,
            expires_at: now + expires_in,
            last_activity: now,
            session_token: "tok".to_string(),
            refresh_token: "ref".to_string(),
            signature: "0xsig".to_string(),
            metadata: SessionMetadata::new("1.0.0"),
        }
    }

    fn challenge(id_fill: char, expires_in: i64) -> Challenge {
        let now = chrono::Utc::now().timestamp();
        Challenge {
            v: WIRE_VERSION,
            challenge_id: id_fill.to_string().repeat(64),
            wallet_address: WALLET.to_string(),
            challenge_message: "sign me".to_string(),
            nonce: "f".repeat(64),
            issued_at: now,
            expires_at: now + expires_in,
            status: ChallengeStatus::Pending,
            app_name: "W-CSAP".to_string(),
            protocol_version: "1.0.0".to_string(),
            metadata: RequestMetadata::default(),
        }
    }

    // ========================================================================
    // Session round-trip
    // ========================================================================

    #[tokio::test]
    async fn test_session_roundtrip() {
        let store = store();
        let s = session('a', 3600);
        store.put_session(&s).await.unwrap();

        let loaded = store.get_session(&s.assertion_id).await.unwrap();
        assert_eq!(loaded.assertion_id, s.assertion_id);
        assert_eq!(loaded.wallet_address, WALLET);
        assert_eq!(loaded.session_token, "tok");
    }

    #[tokio::test]
    async fn test_get_missing_session() {
        let store = store();
        assert!(store.get_session(&"b".repeat(64)).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_session_remains_within_refresh_horizon() {
        let store = store();
        let s = session('a', -10); // token expired, refresh horizon still open
        store.put_session(&s).await.unwrap();

        let loaded = store.get_session(&s.assertion_id).await.unwrap();
        assert!(!loaded.is_valid(chrono::Utc::now().timestamp()));
    }

    #[tokio::test]
    async fn test_tampered_session_is_deleted() {
        let store = store();
        let s = session('a', 3600);
        store.put_session(&s).await.unwrap();

        let key = SessionStore::session_key(&s.assertion_id);
        // Flip one ciphertext byte behind the store's back
        let mut value = store.backend.get(&key).await.unwrap().unwrap();
        value[5] ^= 0xFF;
        store.backend.put_ex(&key, value, 60).await.unwrap();

        assert!(store.get_session(&s.assertion_id).await.is_none());
        // Record must be gone after the tamper check
        assert!(store.backend.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_every_byte_flip_is_rejected() {
        let store = store();
        let s = session('a', 3600);
        store.put_session(&s).await.unwrap();

        let key = SessionStore::session_key(&s.assertion_id);
        let original = store.backend.get(&key).await.unwrap().unwrap();

        for i in (0..original.len()).step_by(7) {
            let mut tampered = original.clone();
            tampered[i] ^= 0x01;
            store.backend.put_ex(&key, tampered, 60).await.unwrap();
            assert!(
                store.get_session(&s.assertion_id).await.is_none(),
                "flip at byte {} accepted",
                i
            );
        }
    }

    #[tokio::test]
    async fn test_sessions_by_wallet_case_insensitive() {
        let store = store();
        store.put_session(&session('a', 3600)).await.unwrap();
        store.put_session(&session('b', 3600)).await.unwrap();
        store.put_session(&session('c', -10)).await.unwrap(); // expired

        let valid = store.sessions_by_wallet(&WALLET.to_uppercase().replace("0X", "0x"), true).await;
        assert_eq!(valid.len(), 2);

        let all = store.sessions_by_wallet(WALLET, false).await;
        assert_eq!(all.len(), 3);
    }

    // ========================================================================
    // Challenge consumption
    // ========================================================================

    #[tokio::test]
    async fn test_challenge_roundtrip_and_take() {
        let store = store();
        let c = challenge('d', 300);
        store.put_challenge(&c).await.unwrap();

        assert!(store.get_challenge(&c.challenge_id).await.is_some());

        let taken = store.take_challenge(&c.challenge_id).await.unwrap();
        assert_eq!(taken.challenge_id, c.challenge_id);

        // Consumed exactly once
        assert!(store.take_challenge(&c.challenge_id).await.is_none());
        assert!(store.get_challenge(&c.challenge_id).await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_takes_yield_one_winner() {
        let store = Arc::new(store());
        let c = challenge('d', 300);
        store.put_challenge(&c).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = c.challenge_id.clone();
            handles.push(tokio::spawn(async move {
                store.take_challenge(&id).await.is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_expired_challenge_hidden_from_get() {
        let store = store();
        let c = challenge('d', 90);
        store.put_challenge(&c).await.unwrap();

        // Make the record expired in place (backend TTL is still open)
        let mut expired = c.clone();
        expired.expires_at = chrono::Utc::now().timestamp() - 5;
        store.put_challenge(&expired).await.unwrap();

        assert!(store.get_challenge(&c.challenge_id).await.is_none());
    }

    // ========================================================================
    // Revocation delegation
    // ========================================================================

    #[tokio::test]
    async fn test_revoke_session_removes_and_blocks() {
        let store = store();
        let s = session('a', 3600);
        store.put_session(&s).await.unwrap();

        assert!(store.revoke_session(&s.assertion_id, s.expires_at).await);
        assert!(store.get_session(&s.assertion_id).await.is_none());
        assert!(store.is_revoked(&s.assertion_id).await);
    }

    // ========================================================================
    // Rotation, health, sweep
    // ========================================================================

    #[tokio::test]
    async fn test_rotation_preserves_records() {
        let store = store();
        let s = session('a', 3600);
        let c = challenge('d', 300);
        store.put_session(&s).await.unwrap();
        store.put_challenge(&c).await.unwrap();

        let report = store.rotate_keys().await;
        assert_eq!(report.re_encrypted, 2);
        assert_eq!(report.failed, 0);

        // Records remain readable under the new keys
        assert!(store.get_session(&s.assertion_id).await.is_some());
        assert!(store.get_challenge(&c.challenge_id).await.is_some());
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let store = store();
        store.put_session(&session('a', 3600)).await.unwrap();
        store.put_challenge(&challenge('d', 300)).await.unwrap();

        let health = store.health().await;
        assert!(health.ok);
        assert_eq!(health.backend, "memory");
        assert_eq!(health.active_sessions, 1);
        assert_eq!(health.active_challenges, 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_backend_expired_entries() {
        let backend = Arc::new(MemoryStoreBackend::new());
        backend
            .put_ex("w_csap:challenge:gone", vec![1, 2, 3], 0)
            .await
            .unwrap();

        // ttl 0 expires immediately
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(backend.sweep_expired().await, 1);
    }

    // ========================================================================
    // Sealed encoding internals
    // ========================================================================

    #[test]
    fn test_split_sealed_rejects_short_values() {
        assert!(split_sealed(b"short").is_none());
        assert!(split_sealed(&vec![0u8; SEAL_HEX_LEN]).is_none());
    }

    #[test]
    fn test_split_sealed_roundtrip() {
        let crypto = RecordCrypto::new(SECRET).unwrap();
        let sealed = encode_sealed(&crypto, "key", b"payload").unwrap();
        let (blob, seal) = split_sealed(&sealed).unwrap();
        assert!(crypto.verify_seal("key", blob, seal));
        assert_eq!(crypto.decrypt(blob).unwrap(), b"payload");
    }
}

//! Token revocation cache
//!
//! Stores revoked assertion ids until their natural expiry, no longer.
//! Two backends: an in-process map with periodic sweep (single-instance
//! deployments, tests) and Redis with native TTL (distributed
//! deployments). Revocation is monotonic: once an id reports revoked it
//! stays revoked until the stored expiry passes.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use shared::models::SessionAssertion;
use shared::redis::PREFIX_REVOKED;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

/// Cache statistics for diagnostics and `/auth/stats`
#[derive(Debug, Clone, serde::Serialize)]
pub struct RevocationStats {
    pub backend: &'static str,
    pub active_revocations: u64,
    pub total_revocations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Backend capability interface. Selected at startup from configuration.
#[async_trait]
pub trait RevocationBackend: Send + Sync {
    /// Revoke an assertion until `expires_at`. Returns false when the
    /// assertion has already expired naturally.
    async fn revoke(&self, assertion_id: &str, expires_at: i64) -> bool;

    /// Check whether an assertion is currently revoked
    async fn is_revoked(&self, assertion_id: &str) -> bool;

    /// Drop expired entries (no-op on Redis, TTL handles it)
    async fn cleanup_expired(&self) -> usize;

    async fn stats(&self) -> RevocationStats;
}

/// In-process revocation cache. Lost on restart by design; revoked
/// tokens expire naturally anyway.
#[derive(Default)]
pub struct MemoryRevocationCache {
    entries: DashMap<String, i64>,
    total: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryRevocationCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevocationBackend for MemoryRevocationCache {
    async fn revoke(&self, assertion_id: &str, expires_at: i64) -> bool {
        let now = chrono::Utc::now().timestamp();
        if expires_at <= now {
            debug!(assertion = %&assertion_id[..assertion_id.len().min(16)], "Assertion already expired, not caching");
            return false;
        }

        self.entries.insert(assertion_id.to_string(), expires_at);
        self.total.fetch_add(1, Ordering::Relaxed);
        warn!(
            assertion = %&assertion_id[..assertion_id.len().min(16)],
            ttl = expires_at - now,
            "Assertion revoked"
        );
        true
    }

    async fn is_revoked(&self, assertion_id: &str) -> bool {
        let now = chrono::Utc::now().timestamp();

        // Copy out under the read guard; removal must not run while the
        // guard is held
        let expires_at = self.entries.get(assertion_id).map(|e| *e);
        match expires_at {
            Some(expires_at) if now < expires_at => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(_) => {
                // Natural expiry reached, drop the entry
                self.entries.remove(assertion_id);
                self.misses.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    async fn cleanup_expired(&self) -> usize {
        let now = chrono::Utc::now().timestamp();
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| now < *expires_at);
        before - self.entries.len()
    }

    async fn stats(&self) -> RevocationStats {
        RevocationStats {
            backend: "memory",
            active_revocations: self.entries.len() as u64,
            total_revocations: self.total.load(Ordering::Relaxed),
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Redis-backed revocation cache. TTL enforcement is native; entries
/// disappear exactly at the token's natural expiry.
pub struct RedisRevocationCache {
    redis: ConnectionManager,
    total: AtomicU64,
}

impl RedisRevocationCache {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            total: AtomicU64::new(0),
        }
    }

    fn key(assertion_id: &str) -> String {
        format!("{}{}", PREFIX_REVOKED, assertion_id)
    }
}

#[async_trait]
impl RevocationBackend for RedisRevocationCache {
    async fn revoke(&self, assertion_id: &str, expires_at: i64) -> bool {
        let now = chrono::Utc::now().timestamp();
        let ttl = expires_at - now;
        if ttl <= 0 {
            return false;
        }

        let mut conn = self.redis.clone();
        match conn
            .set_ex::<_, _, ()>(Self::key(assertion_id), "1", ttl as u64)
            .await
        {
            Ok(()) => {
                self.total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    assertion = %&assertion_id[..assertion_id.len().min(16)],
                    ttl = ttl,
                    "Assertion revoked in Redis"
                );
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to write revocation entry");
                false
            }
        }
    }

    async fn is_revoked(&self, assertion_id: &str) -> bool {
        let mut conn = self.redis.clone();
        match conn.exists::<_, bool>(Self::key(assertion_id)).await {
            Ok(exists) => exists,
            Err(e) => {
                // Revocation check degrades open; token expiry still bounds
                // the exposure window
                error!(error = %e, "Revocation check failed, treating as not revoked");
                false
            }
        }
    }

    async fn cleanup_expired(&self) -> usize {
        // Redis expires keys natively
        0
    }

    async fn stats(&self) -> RevocationStats {
        let mut conn = self.redis.clone();
        let mut active = 0u64;
        let mut cursor = 0u64;
        loop {
            let result: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{}*", PREFIX_REVOKED))
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await;
            match result {
                Ok((next, keys)) => {
                    active += keys.len() as u64;
                    cursor = next;
                    if cursor == 0 {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to scan revocation entries");
                    break;
                }
            }
        }

        RevocationStats {
            backend: "redis",
            active_revocations: active,
            total_revocations: self.total.load(Ordering::Relaxed),
            cache_hits: 0,
            cache_misses: 0,
        }
    }
}

/// Main revocation interface over the selected backend
pub struct RevocationCache {
    backend: Box<dyn RevocationBackend>,
}

impl RevocationCache {
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryRevocationCache::new()),
        }
    }

    pub fn distributed(redis: ConnectionManager) -> Self {
        Self {
            backend: Box::new(RedisRevocationCache::new(redis)),
        }
    }

    /// Revoke one assertion until its natural expiry
    pub async fn revoke(&self, assertion_id: &str, expires_at: i64) -> bool {
        self.backend.revoke(assertion_id, expires_at).await
    }

    /// Check whether an assertion is revoked
    pub async fn is_revoked(&self, assertion_id: &str) -> bool {
        self.backend.is_revoked(assertion_id).await
    }

    /// Revoke every supplied session for a wallet. Used for
    /// "log out all devices" and security incident response.
    pub async fn revoke_all_for_wallet(
        &self,
        wallet_address: &str,
        sessions: &[SessionAssertion],
    ) -> usize {
        let mut revoked = 0;
        for session in sessions {
            if self.revoke(&session.assertion_id, session.expires_at).await {
                revoked += 1;
            }
        }

        warn!(
            wallet = %wallet_address,
            revoked = revoked,
            "Revoked all sessions for wallet"
        );
        revoked
    }

    pub async fn cleanup_expired(&self) -> usize {
        self.backend.cleanup_expired().await
    }

    pub async fn stats(&self) -> RevocationStats {
        self.backend.stats().await
    }
}

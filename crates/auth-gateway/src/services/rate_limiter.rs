//! Per-wallet global rate limiting
//!
//! Sliding-window counters per `(wallet, action)` at hourly and daily
//! granularity, with progressive lockout after repeated failed
//! authentications. Backed by either an in-process map or Redis sorted
//! sets under the `w_csap:ratelimit:` key family.
//!
//! Availability choice: when the backend is unreachable the limiter
//! FAILS OPEN, logging the degraded state and emitting an audit event.
//! Correctness is guarded by signature verification, not by this layer.

use crate::services::audit::{AuditLog, EventDraft};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use shared::config::RateLimitConfig;
use shared::models::AuthEventType;
use shared::redis::{PREFIX_LOCKOUT, PREFIX_RATE_LIMIT, PREFIX_VIOLATION};
use shared::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const HOUR_SECONDS: u64 = 3_600;
const DAY_SECONDS: u64 = 86_400;
const WEEK_SECONDS: u64 = 604_800;

/// Maximum lockout duration (24 h)
const MAX_LOCKOUT_SECONDS: u64 = 86_400;

/// Rate-limited action kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAction {
    ChallengeRequest,
    VerifyAttempt,
    RefreshRequest,
    FailedAuth,
    LoginSuccess,
}

impl RateLimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAction::ChallengeRequest => "challenge_request",
            RateLimitAction::VerifyAttempt => "verify_attempt",
            RateLimitAction::RefreshRequest => "refresh_request",
            RateLimitAction::FailedAuth => "failed_auth",
            RateLimitAction::LoginSuccess => "login_success",
        }
    }

    pub const ALL: [RateLimitAction; 5] = [
        RateLimitAction::ChallengeRequest,
        RateLimitAction::VerifyAttempt,
        RateLimitAction::RefreshRequest,
        RateLimitAction::FailedAuth,
        RateLimitAction::LoginSuccess,
    ];
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reason: String,
    /// Seconds until retry makes sense (lockouts only)
    pub retry_after: Option<u64>,
}

impl RateLimitDecision {
    fn allowed(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            reason: "OK".to_string(),
            retry_after: None,
        }
    }

    fn denied(reason: String, retry_after: Option<u64>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reason,
            retry_after,
        }
    }

    /// Fail-open decision used when the backend is unavailable
    fn degraded() -> Self {
        Self {
            allowed: true,
            remaining: 999,
            reason: "Rate limit check unavailable".to_string(),
            retry_after: None,
        }
    }
}

/// Per-wallet limiter diagnostics
#[derive(Debug, Clone, serde::Serialize)]
pub struct WalletRateLimitStatus {
    pub wallet_address: String,
    pub is_locked_out: bool,
    pub lockout_remaining: u64,
    pub violation_count: u32,
    pub counts: Vec<ActionWindowStatus>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ActionWindowStatus {
    pub action: &'static str,
    pub hourly_count: u32,
    pub hourly_limit: u32,
    pub daily_count: u32,
    pub daily_limit: u32,
}

/// Raw counter operations per backend
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Append one timestamped entry to a sliding window
    async fn record(&self, key: &str, window_seconds: u64) -> Result<()>;

    /// Entries within the window (expired entries pruned)
    async fn count(&self, key: &str, window_seconds: u64) -> Result<u32>;

    /// Set a marker key with TTL (lockouts)
    async fn set_marker(&self, key: &str, ttl_seconds: u64) -> Result<()>;

    /// Remaining TTL of a marker, `None` when absent
    async fn marker_ttl(&self, key: &str) -> Result<Option<u64>>;

    /// Remove all state whose key starts with the prefix
    async fn clear_prefix(&self, prefix: &str) -> Result<()>;
}

/// In-process backend (single-instance deployments, tests)
#[derive(Default)]
pub struct MemoryRateLimitBackend {
    windows: DashMap<String, Vec<i64>>,
    markers: DashMap<String, i64>,
}

impl MemoryRateLimitBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitBackend for MemoryRateLimitBackend {
    async fn record(&self, key: &str, window_seconds: u64) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let cutoff = now - (window_seconds as i64) * 1000;
        let mut entry = self.windows.entry(key.to_string()).or_default();
        entry.retain(|ts| *ts > cutoff);
        entry.push(now);
        Ok(())
    }

    async fn count(&self, key: &str, window_seconds: u64) -> Result<u32> {
        let now = chrono::Utc::now().timestamp_millis();
        let cutoff = now - (window_seconds as i64) * 1000;
        Ok(self
            .windows
            .get(key)
            .map(|entry| entry.iter().filter(|ts| **ts > cutoff).count() as u32)
            .unwrap_or(0))
    }

    async fn set_marker(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let expiry = chrono::Utc::now().timestamp() + ttl_seconds as i64;
        self.markers.insert(key.to_string(), expiry);
        Ok(())
    }

    async fn marker_ttl(&self, key: &str) -> Result<Option<u64>> {
        let now = chrono::Utc::now().timestamp();
        // Copy out under the read guard; removal must not run while the
        // guard is held
        let expiry = self.markers.get(key).map(|e| *e);
        match expiry {
            Some(expiry) if expiry > now => Ok(Some((expiry - now) as u64)),
            Some(_) => {
                self.markers.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<()> {
        self.windows.retain(|k, _| !k.starts_with(prefix));
        self.markers.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

/// Redis backend using sorted sets with score = timestamp. Every call
/// carries a deadline.
pub struct RedisRateLimitBackend {
    redis: ConnectionManager,
    timeout: Duration,
}

impl RedisRateLimitBackend {
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
            Err(_) => Err(Error::store("rate limit backend deadline exceeded")),
        }
    }
}

#[async_trait]
impl RateLimitBackend for RedisRateLimitBackend {
    async fn record(&self, key: &str, window_seconds: u64) -> Result<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.zadd(key, now_ms, now_ms)
            .expire(key, window_seconds as i64);
        self.with_deadline(pipe.query_async::<()>(&mut conn)).await
    }

    async fn count(&self, key: &str, window_seconds: u64) -> Result<u32> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let cutoff = now_ms - (window_seconds as i64) * 1000;
        let mut conn = self.redis.clone();

        self.with_deadline(conn.zrembyscore::<_, _, _, ()>(key, 0, cutoff))
            .await?;
        let count: u64 = self.with_deadline(conn.zcard(key)).await?;
        Ok(count as u32)
    }

    async fn set_marker(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.redis.clone();
        self.with_deadline(conn.set_ex::<_, _, ()>(key, "1", ttl_seconds))
            .await
    }

    async fn marker_ttl(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.redis.clone();
        let ttl: i64 = self.with_deadline(conn.ttl(key)).await?;
        Ok(if ttl > 0 { Some(ttl as u64) } else { None })
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor = 0u64;

        loop {
            let (next, keys): (u64, Vec<String>) = self
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
            if !keys.is_empty() {
                self.with_deadline(conn.del::<_, ()>(keys)).await?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// Progressive lockout duration for the given prior violation count:
/// `base * multiplier^violations`, capped at 24 h
pub fn lockout_duration(base_seconds: u64, multiplier: f64, violations: u32) -> u64 {
    let duration = (base_seconds as f64) * multiplier.powi(violations as i32);
    (duration as u64).min(MAX_LOCKOUT_SECONDS)
}

/// Global per-wallet rate limiter
pub struct WalletRateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    config: RateLimitConfig,
    audit: Arc<AuditLog>,
}

impl WalletRateLimiter {
    pub fn new(
        backend: Arc<dyn RateLimitBackend>,
        config: RateLimitConfig,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            backend,
            config,
            audit,
        }
    }

    fn window_key(wallet: &str, action: RateLimitAction, window: &str) -> String {
        format!("{}{}:{}:{}", PREFIX_RATE_LIMIT, wallet, action.as_str(), window)
    }

    fn lockout_key(wallet: &str) -> String {
        format!("{}{}", PREFIX_LOCKOUT, wallet)
    }

    fn violation_key(wallet: &str) -> String {
        format!("{}{}", PREFIX_VIOLATION, wallet)
    }

    fn limits_for(&self, action: RateLimitAction) -> (u32, u32) {
        match action {
            RateLimitAction::ChallengeRequest => {
                (self.config.challenge_per_hour, self.config.challenge_per_day)
            }
            RateLimitAction::VerifyAttempt => {
                (self.config.verify_per_hour, self.config.verify_per_day)
            }
            RateLimitAction::RefreshRequest => {
                (self.config.refresh_per_hour, self.config.refresh_per_day)
            }
            RateLimitAction::FailedAuth => (
                self.config.failed_auth_per_hour,
                self.config.failed_auth_per_day,
            ),
            RateLimitAction::LoginSuccess => (100, 1_000),
        }
    }

    /// Check whether the action is allowed for the wallet. Lockout
    /// precedes any window check.
    pub async fn check(&self, wallet_address: &str, action: RateLimitAction) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision::allowed(u32::MAX);
        }

        let wallet = wallet_address.to_lowercase();

        match self.check_inner(&wallet, action).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, wallet = %wallet, "Rate limiter degraded, failing open");
                metrics::counter!("wcsap_rate_limiter_degraded_total").increment(1);
                self.audit.record(EventDraft::new(
                    AuthEventType::DegradedBackend,
                    &wallet,
                    false,
                ));
                RateLimitDecision::degraded()
            }
        }
    }

    async fn check_inner(
        &self,
        wallet: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitDecision> {
        if let Some(remaining) = self.backend.marker_ttl(&Self::lockout_key(wallet)).await? {
            warn!(wallet = %wallet, remaining = remaining, "Wallet is locked out");
            return Ok(RateLimitDecision::denied(
                format!("Account locked. Try again in {}s", remaining),
                Some(remaining),
            ));
        }

        let (hourly_limit, daily_limit) = self.limits_for(action);

        let hourly = self
            .backend
            .count(&Self::window_key(wallet, action, "hour"), HOUR_SECONDS)
            .await?;
        if hourly >= hourly_limit {
            warn!(wallet = %wallet, action = action.as_str(), "Hourly rate limit exceeded");
            self.record_violation(wallet).await;
            return Ok(RateLimitDecision::denied(
                format!("Hourly rate limit exceeded ({} requests/hour)", hourly_limit),
                Some(HOUR_SECONDS),
            ));
        }

        let daily = self
            .backend
            .count(&Self::window_key(wallet, action, "day"), DAY_SECONDS)
            .await?;
        if daily >= daily_limit {
            warn!(wallet = %wallet, action = action.as_str(), "Daily rate limit exceeded");
            self.record_violation(wallet).await;
            return Ok(RateLimitDecision::denied(
                format!("Daily rate limit exceeded ({} requests/day)", daily_limit),
                Some(DAY_SECONDS),
            ));
        }

        let remaining = (hourly_limit - hourly - 1).min(daily_limit - daily - 1);
        Ok(RateLimitDecision::allowed(remaining))
    }

    /// Record one action occurrence. Failed authentications may trigger
    /// a lockout.
    pub async fn record(&self, wallet_address: &str, action: RateLimitAction, success: bool) {
        if !self.config.enabled {
            return;
        }

        let wallet = wallet_address.to_lowercase();

        let hour_key = Self::window_key(&wallet, action, "hour");
        let day_key = Self::window_key(&wallet, action, "day");

        if let Err(e) = self.backend.record(&hour_key, HOUR_SECONDS).await {
            warn!(error = %e, "Failed to record hourly rate entry");
            return;
        }
        if let Err(e) = self.backend.record(&day_key, DAY_SECONDS).await {
            warn!(error = %e, "Failed to record daily rate entry");
            return;
        }

        if action == RateLimitAction::FailedAuth && !success {
            self.maybe_lock_out(&wallet).await;
        }
    }

    async fn maybe_lock_out(&self, wallet: &str) {
        let failed = match self
            .backend
            .count(
                &Self::window_key(wallet, RateLimitAction::FailedAuth, "hour"),
                HOUR_SECONDS,
            )
            .await
        {
            Ok(count) => count,
            Err(_) => return,
        };

        if failed < self.config.max_failed_before_lockout {
            return;
        }

        let violations = self.violation_count(wallet).await;
        let duration = lockout_duration(
            self.config.lockout_duration_seconds,
            self.config.lockout_multiplier,
            violations,
        );

        if self
            .backend
            .set_marker(&Self::lockout_key(wallet), duration)
            .await
            .is_ok()
        {
            warn!(
                wallet = %wallet,
                duration = duration,
                violations = violations,
                "Wallet locked out"
            );
            self.audit.record(
                EventDraft::new(AuthEventType::RateLimitViolation, wallet, false)
                    .error(format!("lockout applied for {}s", duration)),
            );
            self.record_violation(wallet).await;
        }
    }

    async fn record_violation(&self, wallet: &str) {
        if let Err(e) = self
            .backend
            .record(&Self::violation_key(wallet), WEEK_SECONDS)
            .await
        {
            warn!(error = %e, "Failed to record rate violation");
        }
    }

    async fn violation_count(&self, wallet: &str) -> u32 {
        self.backend
            .count(&Self::violation_key(wallet), WEEK_SECONDS)
            .await
            .unwrap_or(0)
    }

    /// Diagnostics for one wallet
    pub async fn status(&self, wallet_address: &str) -> WalletRateLimitStatus {
        let wallet = wallet_address.to_lowercase();

        let lockout_remaining = self
            .backend
            .marker_ttl(&Self::lockout_key(&wallet))
            .await
            .ok()
            .flatten()
            .unwrap_or(0);

        let mut counts = Vec::with_capacity(RateLimitAction::ALL.len());
        for action in RateLimitAction::ALL {
            let (hourly_limit, daily_limit) = self.limits_for(action);
            counts.push(ActionWindowStatus {
                action: action.as_str(),
                hourly_count: self
                    .backend
                    .count(&Self::window_key(&wallet, action, "hour"), HOUR_SECONDS)
                    .await
                    .unwrap_or(0),
                hourly_limit,
                daily_count: self
                    .backend
                    .count(&Self::window_key(&wallet, action, "day"), DAY_SECONDS)
                    .await
                    .unwrap_or(0),
                daily_limit,
            });
        }

        WalletRateLimitStatus {
            wallet_address: wallet.clone(),
            is_locked_out: lockout_remaining > 0,
            lockout_remaining,
            violation_count: self.violation_count(&wallet).await,
            counts,
        }
    }

    /// Admin reset: clears windows, lockout and violations for a wallet
    pub async fn reset(&self, wallet_address: &str) -> Result<()> {
        let wallet = wallet_address.to_lowercase();
        self.backend
            .clear_prefix(&format!("{}{}", PREFIX_RATE_LIMIT, wallet))
            .await?;
        self.backend
            .clear_prefix(&Self::lockout_key(&wallet))
            .await?;
        self.backend
            .clear_prefix(&Self::violation_key(&wallet))
            .await?;
        debug!(wallet = %wallet, "Rate limits reset");
        Ok(())
    }
}
